//! System V shared-memory backend. Grounded on `xsi_shm.hpp`'s
//! `SharedMemory::init` (project-id derivation, create-exclusive then
//! open-on-`EEXIST`) and `shared_memory.hpp`'s `SharedMemory::init`
//! (dedup through [`super::id_manager::IdManager`] plus `check_path`).

use super::Segment;
use super::id_manager::IdManager;
use crate::config::MAX_SEGMENT_SIZE;
use crate::error::{RoshmError, RoshmResult};
use crate::wire::Meta;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A segment backed by a System V shared-memory region, deduplicated
/// across processes by path via a shared [`IdManager`].
pub struct SysVSegment {
    path: String,
    app_id: i32,
    shmid: libc::c_int,
    addr: *mut u8,
    size: usize,
    is_exist: bool,
    id_manager: Arc<IdManager>,
}

unsafe impl Send for SysVSegment {}

impl SysVSegment {
    /// Build an unattached segment for `path`, not yet backed by any
    /// kernel shared-memory identifier.
    pub fn new(path: impl Into<String>, app_id: i32, id_manager: Arc<IdManager>) -> Self {
        SysVSegment {
            path: path.into(),
            app_id,
            shmid: -1,
            addr: std::ptr::null_mut(),
            size: 0,
            is_exist: false,
            id_manager,
        }
    }

    /// Kernel shared-memory identifier, or `-1` before `init` runs.
    pub fn shmid(&self) -> libc::c_int {
        self.shmid
    }

    /// Whether the last `init` call attached to a pre-existing segment
    /// rather than creating a new one.
    pub fn is_exist(&self) -> bool {
        self.is_exist
    }

    /// XOR every byte of `hash(path)` into a single byte, then XOR in
    /// `app_id` — mirrors `make_proj_id`.
    fn proj_id(&self) -> u8 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.path.hash(&mut hasher);
        let hash_bytes = hasher.finish().to_ne_bytes();
        let xored = hash_bytes.iter().fold(0u8, |acc, &b| acc ^ b);
        xored ^ (self.app_id as u8)
    }

    /// Double-check the attached segment's stamped meta matches the path
    /// we asked for. Mirrors `SharedMemory::check_path`.
    fn check_path(&self) -> RoshmResult<()> {
        let meta = unsafe { &*(self.addr as *const Meta) };
        if meta.is_marked() && meta.path_str() == self.path {
            return Ok(());
        }
        tracing::warn!(
            path = %self.path, stamped = %meta.path_str(),
            "shm key conflict, attached segment belongs to a different path"
        );
        Err(RoshmError::KeyConflict { path: self.path.clone() })
    }
}

impl Segment for SysVSegment {
    fn init(&mut self, body_size: u64, extra_size: u64) -> RoshmResult<bool> {
        let total = body_size + extra_size;
        if total == 0 || total >= MAX_SEGMENT_SIZE {
            return Err(RoshmError::ShmSizeErr { size: total });
        }

        if let Some(existing_shmid) = self.id_manager.get_id(&self.path) {
            self.shmid = existing_shmid;
            self.is_exist = true;
        } else {
            let key = self.proj_id() as libc::key_t;
            let flags = 0o600 | libc::IPC_CREAT | libc::IPC_EXCL;
            let id = unsafe { libc::shmget(key, total as libc::size_t, flags) };
            if id >= 0 {
                self.shmid = id;
            } else {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() == Some(libc::EEXIST) {
                    let id = unsafe { libc::shmget(key, 0, 0o600) };
                    if id < 0 {
                        return Err(RoshmError::SysErr(format!(
                            "shmget(open-only) failed for {}: {}",
                            self.path,
                            std::io::Error::last_os_error()
                        )));
                    }
                    self.shmid = id;
                    self.is_exist = true;
                } else {
                    return Err(RoshmError::SysErr(format!(
                        "shmget(create) failed for {}: {errno}",
                        self.path
                    )));
                }
            }
            self.id_manager.register(self.shmid, self.path.clone());
        }

        let addr = unsafe { libc::shmat(self.shmid, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(RoshmError::SysErr(format!(
                "shmat failed for {}: {}",
                self.path,
                std::io::Error::last_os_error()
            )));
        }
        self.addr = addr as *mut u8;
        self.size = total as usize;

        tracing::info!(
            path = %self.path, shmid = self.shmid, size = self.size, is_exist = self.is_exist,
            "shm init succ"
        );

        if self.is_exist {
            self.check_path()?;
        }
        Ok(self.is_exist)
    }

    fn address(&self) -> Option<*mut u8> {
        if self.addr.is_null() { None } else { Some(self.addr) }
    }

    fn size(&self) -> usize {
        self.size
    }

    fn remove(&mut self) -> RoshmResult<()> {
        if !self.addr.is_null() {
            unsafe { libc::shmdt(self.addr as *const libc::c_void) };
            self.addr = std::ptr::null_mut();
        }
        if self.shmid >= 0 {
            let ret = unsafe { libc::shmctl(self.shmid, libc::IPC_RMID, std::ptr::null_mut()) };
            if ret != 0 {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() != Some(libc::EINVAL) {
                    tracing::warn!(path = %self.path, shmid = self.shmid, %errno, "remove shm failed");
                    return Err(RoshmError::SysErr(format!(
                        "shmctl(IPC_RMID) failed for shmid {}: {errno}",
                        self.shmid
                    )));
                }
            }
            self.id_manager.deregister(self.shmid);
        }
        Ok(())
    }
}

impl Drop for SysVSegment {
    fn drop(&mut self) {
        if !self.addr.is_null() {
            unsafe { libc::shmdt(self.addr as *const libc::c_void) };
        }
    }
}
