//! Sorted-array map. Grounded on `details/map.hpp`'s `Map<Key, Value,
//! Compare>`: a `CustomVector<pair<Key,Value>, size_t>` kept sorted by key,
//! looked up by binary search.

use super::Vector;
use std::fmt;

/// `Map<K, V>`: `find`/`count`/`at` are O(log n) via binary search; the
/// backing array must already be sorted by key (the producer's
/// responsibility during `Dump`).
#[repr(transparent)]
pub struct Map<K: Copy + Ord, V: Copy> {
    data: Vector<(K, V), u64>,
}

impl<K: Copy + Ord, V: Copy> Map<K, V> {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The backing sorted array of pairs.
    pub fn datas(&self) -> &Vector<(K, V), u64> {
        &self.data
    }

    /// Binary-search for `key`. Total: never panics.
    pub fn find(&self, key: &K) -> Option<&V> {
        let slice = self.data.as_slice();
        slice.binary_search_by(|(k, _)| k.cmp(key)).ok().map(|i| &slice[i].1)
    }

    /// `1` if present, else `0` — mirrors the source's `count`.
    pub fn count(&self, key: &K) -> usize {
        usize::from(self.find(key).is_some())
    }

    /// Value for `key`. Panics if absent — the read-time analogue of the
    /// source's `at()` throwing `std::out_of_range`.
    pub fn at(&self, key: &K) -> &V {
        self.find(key).unwrap_or_else(|| panic!("key not found in map"))
    }

    /// Index of the first entry whose key is not less than `key`.
    pub fn lower_bound(&self, key: &K) -> usize {
        self.data.as_slice().partition_point(|(k, _)| k < key)
    }

    /// Index of the first entry whose key is strictly greater than `key`.
    pub fn upper_bound(&self, key: &K) -> usize {
        self.data.as_slice().partition_point(|(k, _)| k <= key)
    }

    /// `(lower_bound, upper_bound)` as an index pair.
    pub fn equal_range(&self, key: &K) -> (usize, usize) {
        (self.lower_bound(key), self.upper_bound(key))
    }

    /// Entry at a raw index, as returned by `lower_bound`/`upper_bound`.
    pub fn entry_at(&self, idx: usize) -> Option<&(K, V)> {
        self.data.get(idx)
    }

    /// Iterate entries in sorted-key order.
    pub fn iter(&self) -> std::slice::Iter<'_, (K, V)> {
        self.data.iter()
    }
}

impl<K: Copy + Ord + fmt::Debug, V: Copy + fmt::Debug> fmt::Debug for Map<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map").field("len", &self.len()).finish()
    }
}

/// Byte span covered by a `Map`, measured from its own address.
pub fn map_memsize<K: Copy + Ord, V: Copy>(object: &Map<K, V>) -> usize {
    super::vector_memsize(&object.data)
}

impl<K: Copy + Ord, V: Copy> super::ContainerMemSize for Map<K, V> {
    fn memsize(&self) -> usize {
        map_memsize(self)
    }
}
