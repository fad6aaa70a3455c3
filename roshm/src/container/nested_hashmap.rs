//! Two-level hash map: buckets of keys index into a separate, parallel
//! array of value rows. Grounded on `details/nested_hashmap.hpp`'s
//! `NestedHashMap<Key, Value, Hash>`, whose `data_array()` is derived
//! rather than stored — `reinterpret_cast<char*>(this) + sizeof(*this)
//! + index_size_`, i.e. the data blob sits immediately after the index
//! blob in the arena. The 32 comes from the four `u64` header fields
//! below (`size`, `bucket_count`, `index_size_bytes`, `data_size_bytes`).

use super::{NestedVector, Vector, bucket_count_for, hash_of};
use std::fmt;
use std::hash::Hash;

/// `NestedHashMap<K, V>`: `index` buckets a `(key, position)` pair per
/// distinct key; `position` is this key's row index into the data blob
/// that immediately follows the index blob in memory.
#[repr(C)]
pub struct NestedHashMap<K: Copy, V: Copy> {
    size: u64,
    bucket_count: u64,
    index_size_bytes: u64,
    data_size_bytes: u64,
    index: NestedVector<(K, u64), u32>,
}

impl<K: Copy + Hash + Ord, V: Copy> NestedHashMap<K, V> {
    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.size as usize
    }

    /// Whether the map has no keys.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of index buckets.
    pub fn bucket_count(&self) -> usize {
        self.bucket_count as usize
    }

    /// The key index: one bucket per hash slot, each a sorted
    /// `(key, position)` chain.
    pub fn index(&self) -> &NestedVector<(K, u64), u32> {
        &self.index
    }

    /// The data blob, derived from this object's own address plus the
    /// fixed 32-byte header plus the index blob's byte length — never a
    /// stored pointer, matching the source's `data_array()`.
    ///
    /// # Safety
    /// Valid for any `NestedHashMap` produced by [`crate::wire`]'s
    /// load/dump path, where the data blob is guaranteed to immediately
    /// follow the index blob.
    fn data_array(&self) -> &NestedVector<V, u32> {
        let self_addr = self as *const Self as *const u8;
        let data_ptr = unsafe { self_addr.add(32 + self.index_size_bytes as usize) };
        unsafe { &*(data_ptr as *const NestedVector<V, u32>) }
    }

    /// Hash `key`, locate its bucket in the index, binary-search the
    /// sorted chain for an exact key match, then look up that key's row
    /// of values in the data blob.
    pub fn find(&self, key: &K) -> Option<&Vector<V, u32>> {
        let bucket_idx = (hash_of(key) % self.bucket_count) as usize;
        let bucket = self.index.get(bucket_idx)?;
        let slice = bucket.as_slice();
        let pos = slice.binary_search_by(|(k, _)| k.cmp(key)).ok()?;
        let (_, position) = slice[pos];
        self.data_array().get(position as usize)
    }

    /// `1` if `key` is present, else `0`.
    pub fn count(&self, key: &K) -> usize {
        usize::from(self.find(key).is_some())
    }

    /// Iterate `(key, values)` pairs bucket by bucket. Does not cross
    /// bucket boundaries in any particular key order — matches the
    /// source's `NHashIterator`, which walks one bucket fully before
    /// advancing to the next.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &Vector<V, u32>)> {
        let data = self.data_array();
        self.index.iter().flat_map(move |bucket| {
            bucket.iter().filter_map(move |(k, position)| data.get(*position as usize).map(|v| (k, v)))
        })
    }
}

impl<K: Copy + fmt::Debug, V: Copy> fmt::Debug for NestedHashMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedHashMap")
            .field("size", &self.size)
            .field("bucket_count", &self.bucket_count)
            .field("index_size_bytes", &self.index_size_bytes)
            .field("data_size_bytes", &self.data_size_bytes)
            .finish()
    }
}

/// Choose `bucket_count` for `n` distinct keys, shared with `wire::dump`.
pub fn choose_bucket_count(n: u64) -> u64 {
    bucket_count_for(n)
}

/// Byte span covered by a `NestedHashMap`: the fixed header plus both
/// blobs, as recorded in `index_size_bytes`/`data_size_bytes` at dump
/// time (there is no cheaper way to derive this purely from pointers,
/// since the data blob's own tail is not independently bounded).
pub fn nested_hashmap_memsize<K: Copy, V: Copy>(object: &NestedHashMap<K, V>) -> usize {
    32 + object.index_size_bytes as usize + object.data_size_bytes as usize
}

impl<K: Copy, V: Copy> super::ContainerMemSize for NestedHashMap<K, V> {
    fn memsize(&self) -> usize {
        nested_hashmap_memsize(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-build a `NestedHashMap<u64, u32>` with two keys, each owning a
    /// row of values, to exercise `find`/`data_array` derivation without
    /// involving the serialization module.
    fn build(rows: &[(u64, &[u32])]) -> Vec<u8> {
        let bucket_count = choose_bucket_count(rows.len() as u64);
        let mut index_buckets: Vec<Vec<(u64, u64)>> = vec![Vec::new(); bucket_count as usize];
        for (position, (k, _)) in rows.iter().enumerate() {
            let idx = (hash_of(k) % bucket_count) as usize;
            index_buckets[idx].push((*k, position as u64));
        }
        for b in &mut index_buckets {
            b.sort_by_key(|(k, _)| *k);
        }

        // Build the index blob: outer NestedVector header (16) + row
        // headers (8 * bucket_count) + (key: u64, position: u64) elements.
        let mut index_buf = Vec::new();
        index_buf.extend_from_slice(&(bucket_count).to_ne_bytes());
        index_buf.extend_from_slice(&16u64.to_ne_bytes());
        let row_headers_start = 16usize;
        let row_header_bytes = 8usize * bucket_count as usize;
        let mut running_elem_offset = row_headers_start + row_header_bytes;
        let mut row_headers = Vec::new();
        for b in &index_buckets {
            let row_self_addr = row_headers_start + row_headers.len() * 8;
            let offset_from_row = running_elem_offset - row_self_addr;
            row_headers.push((b.len() as u32, offset_from_row as u32));
            running_elem_offset += b.len() * 16; // (u64, u64) = 16 bytes
        }
        for (count, offset) in &row_headers {
            index_buf.extend_from_slice(&count.to_ne_bytes());
            index_buf.extend_from_slice(&offset.to_ne_bytes());
        }
        for b in &index_buckets {
            for (k, position) in b {
                index_buf.extend_from_slice(&k.to_ne_bytes());
                index_buf.extend_from_slice(&position.to_ne_bytes());
            }
        }
        let index_size_bytes = index_buf.len() as u64;

        // Build the data blob: one row per input key, in input order
        // (position-addressed, not sorted).
        let mut data_buf = Vec::new();
        data_buf.extend_from_slice(&(rows.len() as u64).to_ne_bytes());
        data_buf.extend_from_slice(&16u64.to_ne_bytes());
        let data_row_headers_start = 16usize;
        let data_row_header_bytes = 8usize * rows.len();
        let mut running_data_offset = data_row_headers_start + data_row_header_bytes;
        let mut data_row_headers = Vec::new();
        for (_, values) in rows {
            let row_self_addr = data_row_headers_start + data_row_headers.len() * 8;
            let offset_from_row = running_data_offset - row_self_addr;
            data_row_headers.push((values.len() as u32, offset_from_row as u32));
            running_data_offset += values.len() * 4; // u32 elements
        }
        for (count, offset) in &data_row_headers {
            data_buf.extend_from_slice(&count.to_ne_bytes());
            data_buf.extend_from_slice(&offset.to_ne_bytes());
        }
        for (_, values) in rows {
            for v in *values {
                data_buf.extend_from_slice(&v.to_ne_bytes());
            }
        }
        let data_size_bytes = data_buf.len() as u64;

        let mut buf = Vec::new();
        buf.extend_from_slice(&(rows.len() as u64).to_ne_bytes());
        buf.extend_from_slice(&bucket_count.to_ne_bytes());
        buf.extend_from_slice(&index_size_bytes.to_ne_bytes());
        buf.extend_from_slice(&data_size_bytes.to_ne_bytes());
        buf.extend_from_slice(&index_buf);
        buf.extend_from_slice(&data_buf);
        buf
    }

    #[test]
    fn find_locates_the_value_row_for_each_key() {
        let rows: &[(u64, &[u32])] = &[(10, &[1, 2, 3]), (20, &[4, 5])];
        let bytes = build(rows);
        let map = unsafe { &*(bytes.as_ptr() as *const NestedHashMap<u64, u32>) };
        assert_eq!(map.len(), 2);
        assert_eq!(map.find(&10).unwrap().as_slice(), &[1, 2, 3]);
        assert_eq!(map.find(&20).unwrap().as_slice(), &[4, 5]);
        assert!(map.find(&99).is_none());
    }
}
