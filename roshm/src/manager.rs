//! C6: process-wide container registry, plus a per-`(group, app_id)`
//! session that tracks the local handles it holds.
//!
//! Grounded on `shared_manager.h`'s `SharedContainerManager`: a global
//! write lock around the registry, a second lock serializing `Init`
//! against `Init` (so two containers racing to create the same memory
//! region never interleave allocator resets), and a background reaper
//! thread that sweeps `Releasing`/`Deleting` entries — mirrored here with
//! `std::thread::spawn` the way `monitoring.rs`'s `MemoryMonitor` runs its
//! own periodic sweep.

use crate::config::{Config, IntegrityMode, SegmentKind};
use crate::container::ContainerMemSize;
use crate::error::{RoshmError, RoshmResult};
use crate::segment::heap::HeapSegment;
use crate::segment::id_manager::{IdManager, scan_marked_segments};
use crate::segment::sysv::SysVSegment;
use crate::segment::Segment;
use crate::shared_base::SharedBase;
use crate::wire::{IntegrityCheck, LabelCheck, Md5Check};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle status of one registered path, tracked process-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// `Init`/`Load` is in progress; other callers must wait.
    Loading,
    /// Container is loaded and safe to read.
    Ready,
    /// Marked for removal; no new handles should be issued.
    Deleting,
    /// Every known caller has released its handles; eligible for reap.
    Releasing,
}

/// A cloneable, type-checked reference to one `Ready` container. Access
/// goes through a short read-lock rather than a bare `&T`, so `Destroy`
/// can safely reclaim the segment once the last `Handle` is dropped.
pub struct Handle<T> {
    base: Arc<RwLock<SharedBase<T>>>,
}

impl<T: ContainerMemSize + 'static> Handle<T> {
    /// Run `f` against the live container under a read lock.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.base.read();
        f(guard.container())
    }

    /// Path this handle's container was registered under.
    pub fn path(&self) -> String {
        self.base.read().path().to_string()
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle { base: Arc::clone(&self.base) }
    }
}

/// Type-erased registry entry, downcast by [`Manager::get`] via
/// [`Any`].
trait AnyEntry: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn strong_count(&self) -> usize;
    fn destroy(&self) -> RoshmResult<()>;
}

struct TypedEntry<T> {
    base: Arc<RwLock<SharedBase<T>>>,
}

impl<T: ContainerMemSize + Send + Sync + 'static> AnyEntry for TypedEntry<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn strong_count(&self) -> usize {
        Arc::strong_count(&self.base)
    }

    fn destroy(&self) -> RoshmResult<()> {
        self.base.write().destroy()
    }
}

struct RegistryEntry {
    status: ContainerStatus,
    entry: Arc<dyn AnyEntry>,
    /// When `status` last became `Releasing`. Consulted by the reaper so
    /// a handle that is immediately re-registered after `Release` gets a
    /// [`Config::release_grace_period`] window before it can be reaped.
    released_at: Option<std::time::Instant>,
}

/// A configured verifier for one path's expected digest, used by
/// [`Manager::verify_files`].
type Verifier = Arc<dyn Fn(&Path, &str) -> RoshmResult<bool> + Send + Sync>;

/// Process-wide container registry. One instance is expected per
/// process; [`Manager::start_reaper`] should be called once at startup
/// and [`Manager::stop_reaper`] once at shutdown.
pub struct Manager {
    containers: RwLock<HashMap<String, RegistryEntry>>,
    init_lock: Mutex<()>,
    checks: RwLock<HashMap<String, (String, Verifier)>>,
    verified: Mutex<HashSet<String>>,
    id_manager: Arc<IdManager>,
    reaper_running: Arc<AtomicBool>,
    config: Config,
}

impl Manager {
    /// Build a fresh, empty registry under `config`. Bootstraps the
    /// `IdManager`'s kernel-segment scan immediately.
    pub fn new(config: Config) -> Arc<Self> {
        let id_manager = Arc::new(IdManager::new());
        id_manager.bootstrap();
        Arc::new(Manager {
            containers: RwLock::new(HashMap::new()),
            init_lock: Mutex::new(()),
            checks: RwLock::new(HashMap::new()),
            verified: Mutex::new(HashSet::new()),
            id_manager,
            reaper_running: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// Start the background reaper thread. A no-op if already running.
    pub fn start_reaper(self: &Arc<Self>) {
        if self.reaper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let running = Arc::clone(&self.reaper_running);
        std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                manager.reap_once();
                std::thread::sleep(manager.config.reap_interval);
            }
        });
    }

    /// Signal the background reaper thread to stop after its current
    /// sweep. Does not block for the thread to exit.
    pub fn stop_reaper(&self) {
        self.reaper_running.store(false, Ordering::SeqCst);
    }

    fn reap_once(&self) {
        let mut containers = self.containers.write();
        let mut cleared = Vec::new();
        containers.retain(|path, entry| match entry.status {
            ContainerStatus::Releasing
                if entry.entry.strong_count() <= 1
                    && entry.released_at.is_some_and(|at| at.elapsed() >= self.config.release_grace_period) =>
            {
                if let Err(err) = entry.entry.destroy() {
                    tracing::warn!(path = %path, %err, "reaper failed to destroy releasing container");
                }
                cleared.push(path.clone());
                false
            }
            ContainerStatus::Deleting => {
                if let Err(err) = entry.entry.destroy() {
                    tracing::warn!(path = %path, %err, "reaper failed to destroy deleting container");
                }
                cleared.push(path.clone());
                false
            }
            _ => true,
        });
        drop(containers);
        if !cleared.is_empty() {
            let mut checks = self.checks.write();
            let mut verified = self.verified.lock();
            for path in &cleared {
                checks.remove(path);
                verified.remove(path);
            }
        }
    }

    /// Configure an expected digest and verifier for `path`, consulted by
    /// [`Manager::verify_files`] and, before `Load`, by [`Manager::register`].
    pub fn set_check(&self, path: impl Into<String>, digest: impl Into<String>, verifier: Verifier) {
        self.checks.write().insert(path.into(), (digest.into(), verifier));
    }

    fn build_segment(&self, abs_path: &str, app_id: i32) -> Box<dyn Segment> {
        match self.config.segment_kind {
            SegmentKind::SysV => Box::new(SysVSegment::new(abs_path, app_id, Arc::clone(&self.id_manager))),
            SegmentKind::Heap => Box::new(HeapSegment::new(abs_path)),
        }
    }

    fn build_integrity(&self) -> Box<dyn IntegrityCheck + Send> {
        match self.config.integrity_mode {
            IntegrityMode::Label => Box::new(LabelCheck),
            IntegrityMode::Md5 => Box::new(Md5Check),
        }
    }

    fn verify_one_file(&self, abs_path: &str) -> RoshmResult<()> {
        let check = self.checks.read().get(abs_path).cloned();
        let Some((digest, verifier)) = check else {
            return Ok(());
        };
        match verifier(Path::new(abs_path), &digest) {
            Ok(true) => {
                self.verified.lock().insert(abs_path.to_string());
                Ok(())
            }
            Ok(false) => Err(RoshmError::FileCheckFail { path: abs_path.to_string() }),
            Err(err) => Err(err),
        }
    }

    /// Resolve `path` to absolute, attach-or-create the backing segment,
    /// and bring it to `Ready`. Fails `AlreadyRegistered` if `path` is
    /// already present. Retries once, after reclaiming orphan segments,
    /// if `Init` reports `Oom`.
    pub fn register<T>(self: &Arc<Self>, path: impl AsRef<Path>, group: &str, app_id: i32) -> RoshmResult<Handle<T>>
    where
        T: ContainerMemSize + Send + Sync + 'static,
    {
        let abs_path = resolve_path(path.as_ref())?;

        {
            let mut containers = self.containers.write();
            if containers.contains_key(&abs_path) {
                return Err(RoshmError::AlreadyRegistered { path: abs_path });
            }
            let base: SharedBase<T> = SharedBase::new(
                abs_path.clone(),
                group,
                app_id,
                self.build_segment(&abs_path, app_id),
                self.build_integrity(),
            );
            let typed = Arc::new(TypedEntry { base: Arc::new(RwLock::new(base)) });
            containers.insert(abs_path.clone(), RegistryEntry { status: ContainerStatus::Loading, entry: typed, released_at: None });
        }

        match self.init_and_load::<T>(&abs_path, app_id) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                self.containers.write().remove(&abs_path);
                Err(err)
            }
        }
    }

    fn init_and_load<T>(self: &Arc<Self>, abs_path: &str, app_id: i32) -> RoshmResult<Handle<T>>
    where
        T: ContainerMemSize + Send + Sync + 'static,
    {
        let base_arc = self.base_of::<T>(abs_path)?;

        let _init_guard = self.init_lock.lock();
        // Bind the result before matching: leaving the write guard inside
        // the match scrutinee would keep it alive across every arm
        // (Rust's temporary-lifetime-extension for match heads), which
        // would deadlock the retry arm's own `write()` below.
        let init_result = base_arc.write().init();
        let already_ready = match init_result {
            Ok(ready) => ready,
            Err(RoshmError::Oom { .. }) => {
                self.clear_unregistered(app_id);
                base_arc.write().init()?
            }
            Err(err) => return Err(err),
        };

        if !already_ready {
            self.verify_one_file(abs_path)?;
            base_arc.write().load()?;
        }
        drop(_init_guard);

        if let Some(entry) = self.containers.write().get_mut(abs_path) {
            entry.status = ContainerStatus::Ready;
        }

        Ok(Handle { base: base_arc })
    }

    fn base_of<T>(&self, abs_path: &str) -> RoshmResult<Arc<RwLock<SharedBase<T>>>>
    where
        T: ContainerMemSize + Send + Sync + 'static,
    {
        let containers = self.containers.read();
        let entry = containers.get(abs_path).ok_or_else(|| RoshmError::NotRegistered { path: abs_path.to_string() })?;
        let typed = entry
            .entry
            .as_any()
            .downcast_ref::<TypedEntry<T>>()
            .ok_or_else(|| RoshmError::WrongType { path: abs_path.to_string() })?;
        Ok(Arc::clone(&typed.base))
    }

    /// Read-locked lookup of a container that is readable right now.
    /// `Releasing` is accepted alongside `Ready`: it is purely a
    /// registry-level reap-eligibility marker set by [`Session::release`],
    /// and the segment behind it stays fully valid until the reaper
    /// actually runs `Destroy`. `Loading` and `Deleting` are rejected.
    pub fn get<T>(&self, path: impl AsRef<Path>) -> RoshmResult<Handle<T>>
    where
        T: ContainerMemSize + Send + Sync + 'static,
    {
        let abs_path = resolve_path(path.as_ref())?;
        let containers = self.containers.read();
        let entry = containers.get(&abs_path).ok_or_else(|| RoshmError::NotRegistered { path: abs_path.clone() })?;
        if !matches!(entry.status, ContainerStatus::Ready | ContainerStatus::Releasing) {
            return Err(RoshmError::WrongStatus { path: abs_path });
        }
        let typed = entry
            .entry
            .as_any()
            .downcast_ref::<TypedEntry<T>>()
            .ok_or_else(|| RoshmError::WrongType { path: abs_path.clone() })?;
        Ok(Handle { base: Arc::clone(&typed.base) })
    }

    /// Mark `path` `Deleting`; the reaper removes it on its next sweep
    /// regardless of outstanding handles.
    pub fn mark_deleting(&self, path: impl AsRef<Path>) -> RoshmResult<()> {
        let abs_path = resolve_path(path.as_ref())?;
        let mut containers = self.containers.write();
        let entry = containers.get_mut(&abs_path).ok_or_else(|| RoshmError::NotRegistered { path: abs_path })?;
        entry.status = ContainerStatus::Deleting;
        Ok(())
    }

    fn mark_releasing(&self, path: &str) {
        if let Some(entry) = self.containers.write().get_mut(path) {
            if entry.status == ContainerStatus::Ready {
                entry.status = ContainerStatus::Releasing;
                entry.released_at = Some(std::time::Instant::now());
            }
        }
    }

    /// In parallel across `max(1, ncpus / verify_thread_divisor)`
    /// workers, verify every `(path, digest)` pair not already attached
    /// as a live segment. The first failure encountered is returned, but
    /// workers already mid-chunk finish their own slice first.
    pub fn verify_files(&self, files: &HashMap<String, String>, verifier: Verifier) -> RoshmResult<()> {
        let containers = self.containers.read();
        let pending: Vec<(String, String)> =
            files.iter().filter(|(path, _)| !containers.contains_key(*path)).map(|(p, d)| (p.clone(), d.clone())).collect();
        drop(containers);

        let worker_count =
            std::cmp::max(1, std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) / self.config.verify_thread_divisor.max(1));
        let chunk_size = pending.len().div_ceil(worker_count).max(1);
        let failure: Mutex<Option<RoshmError>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for chunk in pending.chunks(chunk_size) {
                let verifier = Arc::clone(&verifier);
                let failure = &failure;
                scope.spawn(move || {
                    for (path, digest) in chunk {
                        match verifier(Path::new(path), digest) {
                            Ok(true) => {
                                self.verified.lock().insert(path.clone());
                            }
                            Ok(false) => {
                                failure.lock().get_or_insert(RoshmError::FileCheckFail { path: path.clone() });
                            }
                            Err(err) => {
                                failure.lock().get_or_insert(err);
                            }
                        }
                    }
                });
            }
        });

        match failure.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn sweep(&self, app_id: i32, keep: impl Fn(&crate::segment::id_manager::SegmentInfo) -> bool) {
        for info in scan_marked_segments() {
            if info.app_id != app_id || keep(&info) {
                continue;
            }
            let ret = unsafe { libc::shmctl(info.shmid, libc::IPC_RMID, std::ptr::null_mut()) };
            if ret != 0 {
                tracing::warn!(shmid = info.shmid, path = %info.path, "failed to remove segment during administrative sweep");
            } else {
                self.id_manager.deregister(info.shmid);
                tracing::info!(shmid = info.shmid, path = %info.path, "removed segment during administrative sweep");
            }
        }
    }

    /// Remove every kernel segment tagged for `app_id` whose path is not
    /// in `reserve`.
    pub fn clear_by_file_list(&self, reserve: &HashSet<String>, app_id: i32) {
        self.sweep(app_id, |info| reserve.contains(&info.path));
    }

    /// Remove every kernel segment tagged for `app_id` whose group is not
    /// in `reserve_groups`.
    pub fn clear_by_group(&self, reserve_groups: &HashSet<String>, app_id: i32) {
        self.sweep(app_id, |info| reserve_groups.contains(&info.group));
    }

    /// Remove every kernel segment tagged for `app_id` with no entry in
    /// the process-wide registry — orphans left by a crashed producer.
    pub fn clear_unregistered(&self, app_id: i32) {
        let containers = self.containers.read();
        let known: HashSet<String> = containers.keys().cloned().collect();
        drop(containers);
        self.sweep(app_id, |info| known.contains(&info.path));
    }
}

fn resolve_path(path: &Path) -> RoshmResult<String> {
    let abs = std::fs::canonicalize(path).map_err(|_| RoshmError::FileNoExist { path: path.to_string_lossy().to_string() })?;
    Ok(abs.to_string_lossy().to_string())
}

/// One `(group, app_id)`'s local handle set, bound to a shared
/// [`Manager`]. `Release` drops every local reference; the reaper
/// reclaims each path once no other handle remains.
pub struct Session {
    manager: Arc<Manager>,
    group: String,
    app_id: i32,
    local: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl Session {
    /// Bind a new session to `manager` under `(group, app_id)`.
    pub fn new(manager: Arc<Manager>, group: impl Into<String>, app_id: i32) -> Self {
        Session { manager, group: group.into(), app_id, local: Mutex::new(HashMap::new()) }
    }

    /// Register `path` with the underlying manager and keep a local
    /// reference alive until [`Session::release`].
    pub fn register<T>(&self, path: impl AsRef<Path>) -> RoshmResult<Handle<T>>
    where
        T: ContainerMemSize + Send + Sync + 'static,
    {
        let handle = self.manager.register::<T>(path, &self.group, self.app_id)?;
        self.local.lock().insert(handle.path(), Box::new(handle.clone()));
        Ok(handle)
    }

    /// Look up an already-registered container through the underlying
    /// manager, without taking a local reference.
    pub fn get<T>(&self, path: impl AsRef<Path>) -> RoshmResult<Handle<T>>
    where
        T: ContainerMemSize + Send + Sync + 'static,
    {
        self.manager.get::<T>(path)
    }

    /// Mark every path held by this session `Releasing` and drop the
    /// local references. The reaper destroys each once uniquely held.
    pub fn release(&self) {
        let mut local = self.local.lock();
        for path in local.keys() {
            self.manager.mark_releasing(path);
        }
        local.clear();
    }
}
