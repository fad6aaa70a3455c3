//! Bucketed hash map. Grounded on `details/hashmap.hpp`'s `HashMap<Key,
//! Value, Hash>`: buckets are a nested vector (`bucket_count` rows), each
//! row a sorted collision chain looked up by binary search.

use super::{Vector, bucket_count_for, hash_of, nested_vector_memsize, NestedVector};
use std::fmt;
use std::hash::Hash;

/// `HashMap<K, V>`: `bucket_count` rows, each a sorted `(K, V)` chain.
#[repr(C)]
pub struct HashMap<K: Copy, V: Copy> {
    size: u64,
    bucket_count: u64,
    buckets: NestedVector<(K, V), u32>,
}

impl<K: Copy + Hash + Ord, V: Copy> HashMap<K, V> {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.size as usize
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.bucket_count as usize
    }

    /// Number of entries in bucket `n`. No range check, matching the
    /// source's `bucket_size`.
    pub fn bucket_size(&self, n: usize) -> usize {
        self.buckets.get(n).map(|b| b.len()).unwrap_or(0)
    }

    /// The backing nested vector of buckets.
    pub fn datas(&self) -> &NestedVector<(K, V), u32> {
        &self.buckets
    }

    /// Hash `key`, land on its bucket, binary-search the sorted chain.
    pub fn find(&self, key: &K) -> Option<&V> {
        let bucket_idx = (hash_of(key) % self.bucket_count) as usize;
        let bucket = self.buckets.get(bucket_idx)?;
        let slice = bucket.as_slice();
        slice.binary_search_by(|(k, _)| k.cmp(key)).ok().map(|i| &slice[i].1)
    }

    /// `1` if present, else `0`.
    pub fn count(&self, key: &K) -> usize {
        usize::from(self.find(key).is_some())
    }

    /// Value for `key`. Panics if absent.
    pub fn at(&self, key: &K) -> &V {
        self.find(key).unwrap_or_else(|| panic!("key not found in hash map"))
    }

    /// Iterate `(key, value)` pairs bucket by bucket.
    pub fn iter(&self) -> impl Iterator<Item = &(K, V)> {
        self.buckets.iter().flat_map(|bucket: &Vector<(K, V), u32>| bucket.iter())
    }
}

impl<K: Copy + fmt::Debug, V: Copy + fmt::Debug> fmt::Debug for HashMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashMap")
            .field("size", &self.size)
            .field("bucket_count", &self.bucket_count)
            .finish()
    }
}

/// Choose `bucket_count` for `n` entries — exposed for `wire::dump` to use
/// on the producer side so bucket placement matches this module's `find`.
pub fn choose_bucket_count(n: u64) -> u64 {
    bucket_count_for(n)
}

/// Byte span covered by a `HashMap`, measured from its own address: the
/// 16-byte `size`+`bucket_count` prefix plus the `buckets` nested vector.
pub fn hashmap_memsize<K: Copy, V: Copy>(object: &HashMap<K, V>) -> usize {
    16 + nested_vector_memsize(&object.buckets)
}

impl<K: Copy, V: Copy> super::ContainerMemSize for HashMap<K, V> {
    fn memsize(&self) -> usize {
        hashmap_memsize(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(pairs: &[(u64, u64)]) -> Vec<u8> {
        let bucket_count = choose_bucket_count(pairs.len() as u64);
        let mut buckets: Vec<Vec<(u64, u64)>> = vec![Vec::new(); bucket_count as usize];
        for &(k, v) in pairs {
            let idx = (hash_of(&k) % bucket_count) as usize;
            buckets[idx].push((k, v));
        }
        for b in &mut buckets {
            b.sort_by_key(|(k, _)| *k);
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&(pairs.len() as u64).to_ne_bytes());
        buf.extend_from_slice(&bucket_count.to_ne_bytes());
        // outer NestedVector header lives at absolute offset 16: row_count,
        // outer_offset (relative to its OWN address, i.e. 16 = header size).
        buf.extend_from_slice(&(bucket_count).to_ne_bytes());
        buf.extend_from_slice(&16u64.to_ne_bytes());
        // Absolute offset where the row headers begin: prefix(16) + outer header(16).
        let row_headers_start = 32usize;
        let row_header_bytes = 8usize * bucket_count as usize;
        let mut running_elem_offset = row_headers_start + row_header_bytes;
        let mut row_headers = Vec::new();
        for b in &buckets {
            let row_self_addr = row_headers_start + row_headers.len() * 8;
            let elem_addr = running_elem_offset;
            let offset_from_row = elem_addr - row_self_addr;
            row_headers.push((b.len() as u32, offset_from_row as u32));
            running_elem_offset += b.len() * 16; // (u64,u64) = 16 bytes
        }
        for (count, offset) in &row_headers {
            buf.extend_from_slice(&count.to_ne_bytes());
            buf.extend_from_slice(&offset.to_ne_bytes());
        }
        for b in &buckets {
            for (k, v) in b {
                buf.extend_from_slice(&k.to_ne_bytes());
                buf.extend_from_slice(&v.to_ne_bytes());
            }
        }
        buf
    }

    #[test]
    fn deterministic_bucketing_and_lookup() {
        let pairs: &[(u64, u64)] = &[(11, 77), (77, 321), (111, 777), (1024, 2048), (10000, 11111), (77777, 88888)];
        let bytes = build(pairs);
        let map = unsafe { &*(bytes.as_ptr() as *const HashMap<u64, u64>) };
        assert_eq!(map.bucket_count(), 17);
        for &(k, v) in pairs {
            assert_eq!(*map.find(&k).unwrap(), v);
            let bucket_idx = (hash_of(&k) % 17) as usize;
            assert!((0..17).contains(&bucket_idx));
        }
        assert_eq!(map.count(&42), 0);
    }

    #[cfg(test)]
    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashSet;

        proptest! {
            /// For any set of distinct keys, every key lands in the bucket
            /// its hash predicts, is found with its stored value, and
            /// `bucket_count` matches the same sizing rule the producer used.
            #[test]
            fn hashmap_bucket_and_lookup_invariants_hold(
                raw_pairs in prop::collection::vec((any::<u64>(), any::<u64>()), 0..40),
            ) {
                let mut seen = HashSet::new();
                let pairs: Vec<(u64, u64)> = raw_pairs.into_iter().filter(|(k, _)| seen.insert(*k)).collect();
                let bytes = build(&pairs);
                let map = unsafe { &*(bytes.as_ptr() as *const HashMap<u64, u64>) };

                prop_assert_eq!(map.bucket_count() as u64, choose_bucket_count(pairs.len() as u64));
                for &(k, v) in &pairs {
                    prop_assert_eq!(*map.find(&k).unwrap(), v);
                    prop_assert_eq!(map.count(&k), 1);

                    let bucket_idx = (hash_of(&k) % map.bucket_count() as u64) as usize;
                    let bucket = map.datas().get(bucket_idx).unwrap();
                    prop_assert!(bucket.iter().any(|&(bk, bv)| bk == k && bv == v));
                }
            }
        }
    }
}
