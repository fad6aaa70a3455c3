//! C3: file header, segment meta block, and the producer-side `Dump`
//! writers that lay out container bytes exactly as [`crate::container`]
//! expects to read them back. Grounded on `shared_base.hpp`'s
//! `_bin2file`/`_file2bin` (file header + raw container image) and
//! `shared_utils.h`'s `SharedMeta`/`Header`/`IntegrityChecker`/`Md5Checker`.

use crate::config::{ALLOC_ALIGNMENT, FORMAT_VERSION, INTEGRITY_LABEL_MAGIC, SEGMENT_MARKER};
use crate::container::{OffsetInt, bucket_count_for, hash_of};
use crate::error::{RoshmError, RoshmResult};
use static_assertions::const_assert_eq;
use std::hash::Hash;
use std::io::{Read, Write};
use std::path::Path;

const PATH_LEN: usize = 1025;
const GROUP_LEN: usize = 129;
const SUMMARY_LEN: usize = 129;
const CHECKSUM_LEN: usize = 33;

/// File header, written at offset 0 of every container file and mirrored
/// into the segment's arena on load. `flags`'s high byte carries
/// [`FORMAT_VERSION`]; the low 56 bits are reserved, always zero here.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FileHeader {
    /// Size in bytes of the container body that follows this header.
    pub body_size: u64,
    /// Hash identifying the container's Rust type, checked on load.
    pub type_hash: u64,
    /// Format version (high byte) plus reserved bits (always zero here).
    pub flags: u64,
}

impl FileHeader {
    /// Encoded size of a `FileHeader` on disk, in bytes.
    pub const ENCODED_LEN: usize = 24;

    /// Build a header for a freshly dumped container body.
    pub fn new(body_size: u64, type_hash: u64) -> Self {
        FileHeader { body_size, type_hash, flags: make_flags(FORMAT_VERSION) }
    }

    /// Format version stamped in this header's `flags` field.
    pub fn version(&self) -> u8 {
        (self.flags >> 56) as u8
    }

    fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..8].copy_from_slice(&self.body_size.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.type_hash.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.flags.to_ne_bytes());
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        FileHeader {
            body_size: u64::from_ne_bytes(bytes[0..8].try_into().unwrap()),
            type_hash: u64::from_ne_bytes(bytes[8..16].try_into().unwrap()),
            flags: u64::from_ne_bytes(bytes[16..24].try_into().unwrap()),
        }
    }
}

fn make_flags(version: u8) -> u64 {
    (version as u64) << 56
}

// `to_bytes`/`from_bytes` hand-encode the wire layout independently of
// `repr(C)` field order; this keeps that encoding honest if a field is
// ever added or reordered.
const_assert_eq!(std::mem::size_of::<FileHeader>(), FileHeader::ENCODED_LEN);

/// Segment meta block: the fixed-size preamble stamped at the start of
/// every segment's arena. Mirrors `shared_utils.h`'s `SharedMeta`,
/// carrying both an integrity `label` and a `checksum` field — which one
/// is live depends on the [`IntegrityCheck`] strategy configured for the
/// container.
#[repr(C)]
pub struct Meta {
    /// Absolute producer path, NUL-padded to [`PATH_LEN`] bytes.
    pub path: [u8; PATH_LEN],
    /// Format version (high byte) plus reserved bits (always zero here).
    pub flags: u64,
    /// Caller-supplied group name, NUL-padded to [`GROUP_LEN`] bytes.
    pub group: [u8; GROUP_LEN],
    /// PID of the process that created this segment.
    pub app_id: i32,
    /// Type name plus [`SEGMENT_MARKER`] tag, NUL-padded to
    /// [`SUMMARY_LEN`] bytes.
    pub summary: [u8; SUMMARY_LEN],
    /// Hash identifying the container's Rust type, checked on attach.
    pub type_hash: u64,
    /// Magic label used by [`LabelCheck`]; unused under [`Md5Check`].
    pub label: u64,
    /// MD5 digest used by [`Md5Check`]; unused under [`LabelCheck`].
    pub checksum: [u8; CHECKSUM_LEN],
}

impl Meta {
    /// Build a fresh meta block for a container about to be published.
    pub fn new(path: &str, type_name: &str, group: &str, app_id: i32, type_hash: u64) -> Self {
        let mut meta = Meta {
            path: [0; PATH_LEN],
            flags: make_flags(FORMAT_VERSION),
            group: [0; GROUP_LEN],
            app_id,
            summary: [0; SUMMARY_LEN],
            type_hash,
            label: 0,
            checksum: [0; CHECKSUM_LEN],
        };
        write_fixed(&mut meta.path, path);
        write_fixed(&mut meta.group, group);
        // The summary must contain SEGMENT_MARKER so IdManager's startup
        // scan and check_path can recognize segments this crate owns.
        write_fixed(&mut meta.summary, &format!("{type_name} [{SEGMENT_MARKER}]"));
        meta
    }

    /// Decode the stored producer path back into a `&str`.
    pub fn path_str(&self) -> &str {
        read_fixed(&self.path)
    }

    /// Decode the stored group name back into a `&str`.
    pub fn group_str(&self) -> &str {
        read_fixed(&self.group)
    }

    /// Decode the stored type/marker summary back into a `&str`.
    pub fn summary_str(&self) -> &str {
        read_fixed(&self.summary)
    }

    /// Format version stamped in this meta block's `flags` field.
    pub fn version(&self) -> u8 {
        (self.flags >> 56) as u8
    }

    /// Whether this segment's summary carries [`SEGMENT_MARKER`],
    /// identifying it as one this crate created.
    pub fn is_marked(&self) -> bool {
        self.summary_str().contains(SEGMENT_MARKER)
    }

    /// Human-readable field dump, for diagnostics only — mirrors
    /// `SharedMeta::layout()`.
    pub fn describe(&self) -> String {
        format!(
            "path={} summary={} type_hash={} flags={} label={} checksum={}",
            self.path_str(),
            self.summary_str(),
            self.type_hash,
            self.flags,
            self.label,
            read_fixed(&self.checksum)
        )
    }
}

fn write_fixed(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf[n] = 0;
}

fn read_fixed(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// Pluggable integrity strategy, run at the end of `Load` in `update`
/// mode (stamps the meta) and again on every subsequent `Init` against
/// an existing segment in check mode (compares). Mirrors
/// `shared_utils.h`'s `CheckFunctor` (`IntegrityChecker` / `Md5Checker`).
pub trait IntegrityCheck {
    /// Check `bytes` against `meta`'s stored label/checksum. When
    /// `update` is set, stamp a freshly computed value into `meta`
    /// instead of comparing against the existing one.
    fn verify(&self, bytes: &[u8], meta: &mut Meta, update: bool) -> bool;
}

/// Fast path: a magic label stamped once, re-checked for presence only.
/// Mirrors `IntegrityChecker`.
pub struct LabelCheck;

impl IntegrityCheck for LabelCheck {
    fn verify(&self, _bytes: &[u8], meta: &mut Meta, update: bool) -> bool {
        if update {
            meta.label = INTEGRITY_LABEL_MAGIC;
            return true;
        }
        meta.label == INTEGRITY_LABEL_MAGIC
    }
}

/// Slow path: a full MD5 digest of the container region. Mirrors
/// `Md5Checker`.
pub struct Md5Check;

impl IntegrityCheck for Md5Check {
    fn verify(&self, bytes: &[u8], meta: &mut Meta, update: bool) -> bool {
        use md5::{Digest, Md5};
        let digest = Md5::digest(bytes);
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        if update {
            write_fixed(&mut meta.checksum, &hex);
            return true;
        }
        read_fixed(&meta.checksum).eq_ignore_ascii_case(&hex)
    }
}

/// Deterministic 64-bit type identity, the read-time analogue of
/// `typeid(Container).hash_code()`. Stable across processes launched
/// from the same binary (the only case this crate's Non-goals require),
/// since `TypeId` is fixed at compile time for a given monomorphization.
pub fn type_hash_of<T: 'static>() -> u64 {
    hash_of(&std::any::TypeId::of::<T>())
}

/// View `values` as raw bytes. Sound for `T: Copy` with no padding bytes
/// that matter to equality — the same assumption the offset containers
/// already make when reading this memory back.
fn as_bytes<T: Copy>(values: &[T]) -> &[u8] {
    if values.is_empty() {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(values.as_ptr() as *const u8, std::mem::size_of_val(values)) }
}

/// Body bytes for `Vector<T, u64>`: a 16-byte header followed by the
/// element array. Mirrors `shared_base.hpp`'s vector write step.
pub fn dump_vector<T: Copy>(values: &[T]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + values.len() * std::mem::size_of::<T>());
    (values.len() as u64).write_le(&mut buf);
    16u64.write_le(&mut buf);
    buf.extend_from_slice(as_bytes(values));
    buf
}

/// Body bytes for `NestedVector<T, S>`: outer header, then every row
/// header, then every row's element run, in that order — matching the
/// derivation in spec §4.3: row `i`'s `col_offset_i` is relative to row
/// `i`'s own header address.
pub fn dump_nested_vector<T: Copy, S: OffsetInt>(rows: &[Vec<T>]) -> Vec<u8> {
    let mut buf = Vec::new();
    (rows.len() as u64).write_le(&mut buf);
    16u64.write_le(&mut buf);

    let row_headers_start = 16usize;
    let row_header_bytes = 2 * S::WIDTH * rows.len();
    let mut running_elem_offset = row_headers_start + row_header_bytes;
    let mut row_headers = Vec::with_capacity(rows.len());
    for row in rows {
        let row_self_addr = row_headers_start + row_headers.len() * 2 * S::WIDTH;
        let offset_from_row = running_elem_offset - row_self_addr;
        row_headers.push((S::from_usize(row.len()), S::from_usize(offset_from_row)));
        running_elem_offset += row.len() * std::mem::size_of::<T>();
    }
    for (count, offset) in row_headers {
        count.write_le(&mut buf);
        offset.write_le(&mut buf);
    }
    for row in rows {
        buf.extend_from_slice(as_bytes(row));
    }
    buf
}

/// Body bytes for a sorted `Map<K, V>`: `pairs` must already be sorted
/// by key (the producer's responsibility, per spec §3).
pub fn dump_map<K: Copy, V: Copy>(pairs: &[(K, V)]) -> Vec<u8> {
    dump_vector(pairs)
}

/// Body bytes for a sorted `Set<K>`: `keys` must already be sorted.
pub fn dump_set<K: Copy>(keys: &[K]) -> Vec<u8> {
    dump_vector(keys)
}

/// Bucket `entries` by `hash(key) % bucket_count`, sorting each bucket
/// by key — the layout `HashMap::find` assumes.
fn bucket_sorted<K: Copy + Hash + Ord, V: Copy>(entries: &[(K, V)]) -> (u64, Vec<Vec<(K, V)>>) {
    let bucket_count = bucket_count_for(entries.len() as u64);
    let mut buckets: Vec<Vec<(K, V)>> = vec![Vec::new(); bucket_count as usize];
    for &(k, v) in entries {
        let idx = (hash_of(&k) % bucket_count) as usize;
        buckets[idx].push((k, v));
    }
    for b in &mut buckets {
        b.sort_by(|a, b| a.0.cmp(&b.0));
    }
    (bucket_count, buckets)
}

/// Body bytes for `HashMap<K, V>`: `size`, `bucket_count`, then the
/// bucketed, per-bucket-sorted nested vector.
pub fn dump_hashmap<K: Copy + Hash + Ord, V: Copy>(entries: &[(K, V)]) -> Vec<u8> {
    let (bucket_count, buckets) = bucket_sorted(entries);
    let mut buf = Vec::new();
    (entries.len() as u64).write_le(&mut buf);
    bucket_count.write_le(&mut buf);
    buf.extend_from_slice(&dump_nested_vector::<(K, V), u32>(&buckets));
    buf
}

/// Body bytes for `HashSet<K>`: chains are not sorted, since `find`
/// scans linearly — only bucket placement is load-bearing.
pub fn dump_hashset<K: Copy + Hash>(keys: &[K]) -> Vec<u8> {
    let bucket_count = bucket_count_for(keys.len() as u64);
    let mut buckets: Vec<Vec<K>> = vec![Vec::new(); bucket_count as usize];
    for &k in keys {
        let idx = (hash_of(&k) % bucket_count) as usize;
        buckets[idx].push(k);
    }
    let mut buf = Vec::new();
    (keys.len() as u64).write_le(&mut buf);
    bucket_count.write_le(&mut buf);
    buf.extend_from_slice(&dump_nested_vector::<K, u32>(&buckets));
    buf
}

/// Body bytes for `NestedHashMap<K, V>`: a key index bucketed/sorted
/// like `HashMap`'s, mapping each key to its position in `rows`, and a
/// data blob holding `rows[i].1` at position `i`, laid out immediately
/// after the index so `data_array()` can be derived rather than stored.
pub fn dump_nested_hashmap<K: Copy + Hash + Ord, V: Copy>(rows: &[(K, Vec<V>)]) -> Vec<u8> {
    let index_entries: Vec<(K, u64)> =
        rows.iter().enumerate().map(|(pos, (k, _))| (*k, pos as u64)).collect();
    let (bucket_count, index_buckets) = bucket_sorted(&index_entries);
    let index_bytes = dump_nested_vector::<(K, u64), u32>(&index_buckets);

    let data_rows: Vec<Vec<V>> = rows.iter().map(|(_, v)| v.clone()).collect();
    let data_bytes = dump_nested_vector::<V, u32>(&data_rows);

    let mut buf = Vec::new();
    (rows.len() as u64).write_le(&mut buf);
    bucket_count.write_le(&mut buf);
    (index_bytes.len() as u64).write_le(&mut buf);
    (data_bytes.len() as u64).write_le(&mut buf);
    buf.extend_from_slice(&index_bytes);
    buf.extend_from_slice(&data_bytes);
    buf
}

/// Read just the leading `u64 body_size` field, to size a segment
/// before the whole file is read. Mirrors `SharedMemory::init`'s
/// `fin.read((char*)&_mem_size, sizeof(_mem_size))`.
pub fn peek_body_size(path: &Path) -> RoshmResult<u64> {
    let path_str = path.to_string_lossy().to_string();
    let mut file =
        std::fs::File::open(path).map_err(|_| RoshmError::FileNoExist { path: path_str.clone() })?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf).map_err(|_| RoshmError::ReadFail { path: path_str })?;
    Ok(u64::from_ne_bytes(buf))
}

/// Write `body` to `path` preceded by a [`FileHeader`]. Mirrors
/// `_bin2file`.
pub fn write_container_file(path: &Path, type_hash: u64, body: &[u8]) -> RoshmResult<()> {
    let header = FileHeader::new(body.len() as u64, type_hash);
    let mut file = std::fs::File::create(path)?;
    file.write_all(&header.to_bytes())?;
    file.write_all(body)?;
    Ok(())
}

/// Read `path`'s header and body. Mirrors `_file2bin`: validates that
/// the file is at least as long as its own declared header + body.
pub fn read_container_file(path: &Path, expected_type_hash: u64) -> RoshmResult<(FileHeader, Vec<u8>)> {
    let path_str = path.to_string_lossy().to_string();
    let bytes = std::fs::read(path).map_err(|_| RoshmError::FileNoExist { path: path_str.clone() })?;
    if bytes.len() < FileHeader::ENCODED_LEN {
        return Err(RoshmError::ReadFail { path: path_str });
    }
    let header = FileHeader::from_bytes(&bytes[..FileHeader::ENCODED_LEN]);
    if header.type_hash != expected_type_hash {
        return Err(RoshmError::WrongType { path: path_str });
    }
    let body_start = FileHeader::ENCODED_LEN;
    let body_end = body_start + header.body_size as usize;
    if bytes.len() < body_end {
        return Err(RoshmError::ReadFail { path: path_str });
    }
    Ok((header, bytes[body_start..body_end].to_vec()))
}

/// Byte size of the segment meta block plus the embedded file-header
/// copy, each individually 8-byte aligned exactly as `Region::reserve`
/// aligns them. `Shared Base` reserves this much before the container
/// body on every `Init`.
pub fn fixed_preamble_size() -> usize {
    align8(std::mem::size_of::<Meta>()) + align8(FileHeader::ENCODED_LEN)
}

fn align8(size: usize) -> usize {
    (size + (ALLOC_ALIGNMENT - 1)) & !(ALLOC_ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Vector;
    use crate::container::hashmap::HashMap;
    use crate::container::map::Map;

    #[test]
    fn dump_vector_reads_back_with_container_reader() {
        let values = [10u32, 20, 30];
        let bytes = dump_vector(&values);
        let vector = unsafe { &*(bytes.as_ptr() as *const Vector<u32, u64>) };
        assert_eq!(vector.as_slice(), &values);
    }

    #[test]
    fn dump_map_keeps_sorted_pairs_findable() {
        let pairs: Vec<(u64, u64)> = vec![(1111, 1), (2222, 2), (3333, 3)];
        let bytes = dump_map(&pairs);
        let map = unsafe { &*(bytes.as_ptr() as *const Map<u64, u64>) };
        assert_eq!(*map.find(&2222).unwrap(), 2);
    }

    #[test]
    fn dump_hashmap_matches_bucket_invariant() {
        let entries: Vec<(u64, u64)> =
            vec![(11, 77), (77, 321), (111, 777), (1024, 2048), (10000, 11111), (77777, 88888)];
        let bytes = dump_hashmap(&entries);
        let map = unsafe { &*(bytes.as_ptr() as *const HashMap<u64, u64>) };
        assert_eq!(map.bucket_count(), 17);
        for &(k, v) in &entries {
            assert_eq!(*map.find(&k).unwrap(), v);
        }
    }

    #[test]
    fn file_round_trip_preserves_body_and_type_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vec_small");
        let body = dump_vector(&[1u32, 2, 3, 4, 5]);
        let type_hash = type_hash_of::<Vector<u32, u64>>();
        write_container_file(&path, type_hash, &body).unwrap();
        let (header, read_body) = read_container_file(&path, type_hash).unwrap();
        assert_eq!(header.body_size as usize, body.len());
        assert_eq!(read_body, body);
    }

    #[test]
    fn label_check_round_trips() {
        let mut meta = Meta::new("/tmp/x", "Vector<u32>", "grp", 1, 42);
        assert!(!LabelCheck.verify(&[], &mut meta, false));
        assert!(LabelCheck.verify(&[], &mut meta, true));
        assert!(LabelCheck.verify(&[], &mut meta, false));
    }

    #[test]
    fn md5_check_round_trips() {
        let mut meta = Meta::new("/tmp/x", "Vector<u32>", "grp", 1, 42);
        let bytes = [1u8, 2, 3, 4];
        assert!(!Md5Check.verify(&bytes, &mut meta, false));
        assert!(Md5Check.verify(&bytes, &mut meta, true));
        assert!(Md5Check.verify(&bytes, &mut meta, false));
    }

    #[test]
    fn meta_summary_carries_segment_marker() {
        let meta = Meta::new("/tmp/x", "Vector<u32>", "grp", 1, 42);
        assert!(meta.is_marked());
    }
}
