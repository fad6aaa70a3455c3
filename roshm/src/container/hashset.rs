//! Bucketed hash set. Grounded on `details/hashset.hpp`'s `HashSet<Key,
//! Hash, Pred>` — same bucket shape as `HashMap` but looked up by linear
//! scan within a chain (chains are expected short, so no sort/bsearch
//! overhead is paid on the producer side).

use super::{NestedVector, bucket_count_for, hash_of, nested_vector_memsize};
use std::fmt;
use std::hash::Hash;

/// `HashSet<K>`: `bucket_count` rows, each an unsorted chain scanned
/// linearly on lookup.
#[repr(C)]
pub struct HashSet<K: Copy> {
    size: u64,
    bucket_count: u64,
    buckets: NestedVector<K, u32>,
}

impl<K: Copy + Hash + Eq> HashSet<K> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.size as usize
    }

    /// Whether the set has no elements.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.bucket_count as usize
    }

    /// Number of entries in bucket `n`. No range check.
    pub fn bucket_size(&self, n: usize) -> usize {
        self.buckets.get(n).map(|b| b.len()).unwrap_or(0)
    }

    /// The backing nested vector of buckets.
    pub fn datas(&self) -> &NestedVector<K, u32> {
        &self.buckets
    }

    /// Hash `key`, land on its bucket, scan linearly.
    pub fn find(&self, key: &K) -> Option<&K> {
        let bucket_idx = (hash_of(key) % self.bucket_count) as usize;
        let bucket = self.buckets.get(bucket_idx)?;
        bucket.iter().find(|item| *item == key)
    }

    /// `1` if present, else `0`.
    pub fn count(&self, key: &K) -> usize {
        usize::from(self.find(key).is_some())
    }

    /// Iterate elements bucket by bucket.
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }
}

impl<K: Copy + fmt::Debug> fmt::Debug for HashSet<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashSet")
            .field("size", &self.size)
            .field("bucket_count", &self.bucket_count)
            .finish()
    }
}

/// Choose `bucket_count` for `n` entries, shared with `wire::dump`.
pub fn choose_bucket_count(n: u64) -> u64 {
    bucket_count_for(n)
}

/// Byte span covered by a `HashSet`, measured from its own address: the
/// 16-byte `size`+`bucket_count` prefix plus the `buckets` nested vector.
pub fn hashset_memsize<K: Copy>(object: &HashSet<K>) -> usize {
    16 + nested_vector_memsize(&object.buckets)
}

impl<K: Copy> super::ContainerMemSize for HashSet<K> {
    fn memsize(&self) -> usize {
        hashset_memsize(self)
    }
}
