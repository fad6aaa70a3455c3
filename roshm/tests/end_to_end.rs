//! End-to-end scenarios through the public API: dump a container's bytes,
//! write it to a file, register it with a [`Manager`], and read it back.
//! Every scenario here uses a heap-backed [`SegmentKind::Heap`] so the
//! suite runs without touching the kernel's System V shared memory table.

use roshm::config::{Config, SegmentKind};
use roshm::container::Vector;
use roshm::container::hashmap::HashMap;
use roshm::container::map::Map;
use roshm::container::nested_hashmap::NestedHashMap;
use roshm::wire::{dump_hashmap, dump_map, dump_nested_hashmap, dump_vector, type_hash_of, write_container_file};
use roshm::{Manager, Session};
use std::path::{Path, PathBuf};

fn heap_config() -> Config {
    Config { segment_kind: SegmentKind::Heap, ..Config::default() }
}

fn write_file(dir: &Path, name: &str, type_hash: u64, body: &[u8]) -> PathBuf {
    let path = dir.join(name);
    write_container_file(&path, type_hash, body).unwrap();
    path
}

#[test]
fn vector_round_trip_through_manager() {
    let dir = tempfile::tempdir().unwrap();
    let body = dump_vector(&[1i64, 2, 3, 4, 5]);
    let path = write_file(dir.path(), "vec_small", type_hash_of::<Vector<i64>>(), &body);

    let manager = Manager::new(heap_config());
    let handle = manager.register::<Vector<i64>>(&path, "quotes", 1).unwrap();
    handle.with(|v| {
        assert_eq!(v.len(), 5);
        assert_eq!(*v.get(0).unwrap(), 1);
        assert_eq!(*v.get(4).unwrap(), 5);
        assert_eq!(v.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    });
}

#[test]
fn map_lookup_and_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let pairs: Vec<(u64, u32)> = vec![(1111, 1), (2222, 2), (3333, 3), (4444, 4), (5555, 5)];
    let body = dump_map(&pairs);
    let path = write_file(dir.path(), "sorted_map", type_hash_of::<Map<u64, u32>>(), &body);

    let manager = Manager::new(heap_config());
    let handle = manager.register::<Map<u64, u32>>(&path, "grp", 1).unwrap();
    handle.with(|m| {
        assert_eq!(*m.find(&3333).unwrap(), 3);
        assert_eq!(m.find(&9999), None);
        assert_eq!(m.entry_at(m.lower_bound(&2500)).unwrap().0, 3333);
        assert_eq!(m.entry_at(m.upper_bound(&3333)).unwrap().0, 4444);
    });
}

#[test]
fn hashmap_deterministic_bucketing() {
    let dir = tempfile::tempdir().unwrap();
    let entries: Vec<(u64, u64)> = vec![(11, 77), (77, 321), (111, 777), (1024, 2048), (10000, 11111), (77777, 88888)];
    let body = dump_hashmap(&entries);
    let path = write_file(dir.path(), "hash_map", type_hash_of::<HashMap<u64, u64>>(), &body);

    let manager = Manager::new(heap_config());
    let handle = manager.register::<HashMap<u64, u64>>(&path, "grp", 1).unwrap();
    handle.with(|m| {
        assert_eq!(m.bucket_count(), 17);
        for &(k, v) in &entries {
            assert_eq!(*m.find(&k).unwrap(), v);
            assert_eq!(m.count(&k), 1);
        }
        assert_eq!(m.count(&42), 0);
    });
}

#[test]
fn nested_hash_map_row_access() {
    let dir = tempfile::tempdir().unwrap();
    let rows: Vec<(u64, Vec<i32>)> = vec![(1, vec![10, 20]), (2, vec![]), (3, vec![30])];
    let body = dump_nested_hashmap(&rows);
    let path = write_file(dir.path(), "nested_hash_map", type_hash_of::<NestedHashMap<u64, i32>>(), &body);

    let manager = Manager::new(heap_config());
    let handle = manager.register::<NestedHashMap<u64, i32>>(&path, "grp", 1).unwrap();
    handle.with(|m| {
        assert_eq!(m.len(), 3);
        assert_eq!(m.find(&2).unwrap().len(), 0);
        let row = m.find(&1).unwrap();
        assert_eq!(*row.get(0).unwrap(), 10);
        assert_eq!(*row.get(1).unwrap(), 20);
        assert_eq!(m.iter().count(), 3);
    });
}

/// Scenario 5: a corrupted file fails `Load` and the manager discards the
/// half-registered entry rather than leaving it `Loading` forever.
#[test]
fn truncated_file_fails_load_and_removes_the_registration() {
    let dir = tempfile::tempdir().unwrap();
    let body = dump_vector(&[1i64, 2, 3, 4, 5]);
    let path = write_file(dir.path(), "vec_truncated", type_hash_of::<Vector<i64>>(), &body);

    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

    let manager = Manager::new(heap_config());
    assert!(manager.register::<Vector<i64>>(&path, "grp", 1).is_err());
    assert!(manager.get::<Vector<i64>>(&path).is_err());
}

/// Scenario 6 (dedup half): a second lookup of an already-registered path
/// returns a handle over the very same container, not a second copy.
#[test]
fn register_then_get_return_handles_to_the_same_container() {
    let dir = tempfile::tempdir().unwrap();
    let body = dump_vector(&[1i64, 2, 3]);
    let path = write_file(dir.path(), "vec_dedup", type_hash_of::<Vector<i64>>(), &body);

    let manager = Manager::new(heap_config());
    let a = manager.register::<Vector<i64>>(&path, "grp", 1).unwrap();
    let b = manager.get::<Vector<i64>>(&path).unwrap();

    let addr_a = a.with(|v| v as *const _ as usize);
    let addr_b = b.with(|v| v as *const _ as usize);
    assert_eq!(addr_a, addr_b);
}

/// Scenario 6 (reap half): once a session releases its only handle, the
/// background reaper reclaims the registration within a couple of ticks.
#[test]
fn session_release_lets_the_reaper_reclaim_the_container() {
    let dir = tempfile::tempdir().unwrap();
    let body = dump_vector(&[1i64, 2, 3]);
    let path = write_file(dir.path(), "vec_reap", type_hash_of::<Vector<i64>>(), &body);

    let config = Config { reap_interval: std::time::Duration::from_millis(30), ..heap_config() };
    let manager = Manager::new(config);
    manager.start_reaper();

    let session = Session::new(manager.clone(), "grp", 1);
    let handle = session.register::<Vector<i64>>(&path).unwrap();
    handle.with(|v| assert_eq!(v.len(), 3));
    drop(handle);
    session.release();

    std::thread::sleep(std::time::Duration::from_millis(300));
    manager.stop_reaper();

    assert!(manager.get::<Vector<i64>>(&path).is_err());
}

/// A released entry with no outstanding handles still waits out
/// `release_grace_period` before the reaper will remove it.
#[test]
fn release_grace_period_holds_off_the_reaper() {
    let dir = tempfile::tempdir().unwrap();
    let body = dump_vector(&[1i64, 2, 3]);
    let path = write_file(dir.path(), "vec_grace", type_hash_of::<Vector<i64>>(), &body);

    let config = Config {
        reap_interval: std::time::Duration::from_millis(20),
        release_grace_period: std::time::Duration::from_millis(300),
        ..heap_config()
    };
    let manager = Manager::new(config);
    manager.start_reaper();

    let session = Session::new(manager.clone(), "grp", 1);
    let handle = session.register::<Vector<i64>>(&path).unwrap();
    drop(handle);
    session.release();

    std::thread::sleep(std::time::Duration::from_millis(100));
    assert!(manager.get::<Vector<i64>>(&path).is_ok(), "reaped before its grace period elapsed");

    std::thread::sleep(std::time::Duration::from_millis(400));
    manager.stop_reaper();
    assert!(manager.get::<Vector<i64>>(&path).is_err(), "never reaped after its grace period elapsed");
}
