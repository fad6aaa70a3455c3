//! Process-wide `path ↔ shmid` registry. Grounded on `id_manager.h`/
//! `id_manager.cpp`: a bidirectional map behind a mutex, seeded at
//! startup by scanning every kernel segment this uid can see and
//! keeping only the ones this crate stamped.

use crate::config::SEGMENT_MARKER;
use crate::wire::Meta;
use parking_lot::Mutex;
use std::collections::HashMap;

struct Tables {
    id_to_path: HashMap<libc::c_int, String>,
    path_to_id: HashMap<String, libc::c_int>,
}

/// Bidirectional `path ↔ shmid` map, safe to share across threads. One
/// instance is expected per process (see [`crate::manager::Manager`]).
pub struct IdManager {
    tables: Mutex<Tables>,
}

impl Default for IdManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IdManager {
    /// Build an empty map. Call [`IdManager::bootstrap`] once afterward
    /// to seed it from the kernel's existing segment table.
    pub fn new() -> Self {
        IdManager { tables: Mutex::new(Tables { id_to_path: HashMap::new(), path_to_id: HashMap::new() }) }
    }

    /// Scan the kernel's segment table for every id stamped by this
    /// crate (marker `SEGMENT_MARKER`), recording `(shmid, path)`.
    /// Mirrors `IdManager::init`/`get_all_shmid` with `no_attach = false`
    /// — every segment is inspected, not just unattached ones, since
    /// this runs once at process start before any of our own attaches.
    pub fn bootstrap(&self) {
        for info in scan_marked_segments() {
            self.register(info.shmid, info.path);
        }
        tracing::info!(count = self.tables.lock().path_to_id.len(), "IdManager bootstrap done");
    }

    /// Look up the kernel shmid already registered for `path`, if any.
    pub fn get_id(&self, path: &str) -> Option<libc::c_int> {
        self.tables.lock().path_to_id.get(path).copied()
    }

    /// Record a new `(shmid, path)` pair. Returns `false`, leaving the
    /// tables unchanged, if either side is already registered.
    pub fn register(&self, shmid: libc::c_int, path: String) -> bool {
        let mut tables = self.tables.lock();
        if tables.id_to_path.contains_key(&shmid) || tables.path_to_id.contains_key(&path) {
            tracing::warn!(shmid, %path, "duplicate share memory in IdManager");
            return false;
        }
        tables.id_to_path.insert(shmid, path.clone());
        tables.path_to_id.insert(path, shmid);
        true
    }

    /// Remove a previously registered shmid. Returns `false` if it was
    /// not registered.
    pub fn deregister(&self, shmid: libc::c_int) -> bool {
        let mut tables = self.tables.lock();
        match tables.id_to_path.remove(&shmid) {
            Some(path) => {
                tables.path_to_id.remove(&path);
                true
            }
            None => {
                tracing::warn!(shmid, "not find share memory in IdManager");
                false
            }
        }
    }
}

/// One marked kernel segment found during a scan, with enough of its
/// stamped [`Meta`] copied out to drive administrative sweeps
/// ([`crate::manager::Manager::clear_by_file_list`] and friends) without
/// re-attaching.
pub struct SegmentInfo {
    /// Kernel shared-memory identifier.
    pub shmid: libc::c_int,
    /// Producer path stamped in the segment's meta block.
    pub path: String,
    /// Group name stamped in the segment's meta block.
    pub group: String,
    /// PID of the process that created the segment.
    pub app_id: i32,
}

/// Walk every live kernel shm segment (`shmctl(0, SHM_INFO, ..)` for the
/// high-water id, then `SHM_STAT` per id), attach each read-write long
/// enough to read its meta block, and keep the ones carrying
/// `SEGMENT_MARKER`. Mirrors `xsi_shm.hpp::get_all_shmid`.
pub fn scan_marked_segments() -> Vec<SegmentInfo> {
    let mut found = Vec::new();
    let mut shm_info: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let max_id = unsafe { libc::shmctl(0, libc::SHM_INFO, &mut shm_info) };
    if max_id < 0 {
        tracing::warn!("shmctl(SHM_INFO) failed, skipping IdManager bootstrap scan");
        return found;
    }
    for index in 0..=max_id {
        let mut shm_segment: libc::shmid_ds = unsafe { std::mem::zeroed() };
        let shmid = unsafe { libc::shmctl(index, libc::SHM_STAT, &mut shm_segment) };
        if shmid <= 0 {
            continue;
        }
        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if addr as isize == -1 {
            tracing::warn!(shmid, "attach shm failed during IdManager scan");
            continue;
        }
        let meta = unsafe { &*(addr as *const Meta) };
        if meta.is_marked() {
            found.push(SegmentInfo {
                shmid,
                path: meta.path_str().to_string(),
                group: meta.group_str().to_string(),
                app_id: meta.app_id,
            });
        } else {
            tracing::debug!(shmid, marker = SEGMENT_MARKER, "unmarked shm segment, skipping");
        }
        unsafe { libc::shmdt(addr) };
    }
    found
}
