//! C5: per-container lifecycle state machine.
//!
//! Grounded on `shared_base.hpp`'s `SharedBase<T>`: attach-or-create a
//! segment (C4), sub-allocate the meta block, file-header copy, and
//! container body inside it with the bump allocator (C1), and reconcile
//! against the backing file (C3) before handing out a `Ready` container.
//!
//! ```text
//!   [Fresh] --Init--> [RegionReserved] --(exists ∧ check OK)--> [Ready]
//!                                     \--(¬exists ∨ check fail)--> [Constructed] --Load--> [Loaded] --check--> [Ready]
//!   [Ready] --Destroy--> [Removed]
//! ```

use crate::alloc::Region;
use crate::config::FORMAT_VERSION;
use crate::container::ContainerMemSize;
use crate::error::{RoshmError, RoshmResult};
use crate::segment::Segment;
use crate::wire::{self, FileHeader, IntegrityCheck, Meta};
use std::marker::PhantomData;
use std::path::Path;

/// Where a [`SharedBase`] sits in its lifecycle. `Constructed` is the only
/// phase in which `Load` is expected to be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseStatus {
    /// No segment attached yet.
    Fresh,
    /// Segment reserved and sub-allocated; a `Load` is required before
    /// the container is readable.
    Constructed,
    /// Container is loaded, checked, and safe to read.
    Ready,
    /// `Destroy` has run; the segment is gone.
    Removed,
}

/// Binds C1–C4 for one container of type `C`: a segment, a bump allocator
/// over it, and the fixed meta/header/container layout within.
pub struct SharedBase<C> {
    path: String,
    group: String,
    app_id: i32,
    segment: Box<dyn Segment>,
    integrity: Box<dyn IntegrityCheck + Send>,
    region: Option<Region>,
    meta: *mut Meta,
    header: *mut FileHeader,
    container_ptr: *mut u8,
    container_len: usize,
    status: BaseStatus,
    _marker: PhantomData<fn() -> C>,
}

// SAFETY: the raw pointers all address a `Region`'s window, which is
// either heap-allocated or shared-memory-backed; both are valid to send
// or share between threads as long as access is serialized, which the
// Manager wraps every `SharedBase` in an `RwLock` to guarantee — mutation
// (`init`/`load`/`destroy`) only ever happens under a write lock, and the
// container is immutable from the moment it reaches `Ready` until
// `Destroy`, so concurrent readers under a read lock are sound.
unsafe impl<C> Send for SharedBase<C> {}
unsafe impl<C> Sync for SharedBase<C> {}

impl<C: ContainerMemSize + 'static> SharedBase<C> {
    /// Build a `Fresh` base over `segment`, not yet attached to anything.
    pub fn new(
        path: impl Into<String>,
        group: impl Into<String>,
        app_id: i32,
        segment: Box<dyn Segment>,
        integrity: Box<dyn IntegrityCheck + Send>,
    ) -> Self {
        SharedBase {
            path: path.into(),
            group: group.into(),
            app_id,
            segment,
            integrity,
            region: None,
            meta: std::ptr::null_mut(),
            header: std::ptr::null_mut(),
            container_ptr: std::ptr::null_mut(),
            container_len: 0,
            status: BaseStatus::Fresh,
            _marker: PhantomData,
        }
    }

    /// Current lifecycle phase.
    pub fn status(&self) -> BaseStatus {
        self.status
    }

    /// Whether the container is currently safe to read.
    pub fn is_ready(&self) -> bool {
        self.status == BaseStatus::Ready
    }

    /// Path this base was constructed with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Borrow the live container. Callers (the Manager) must not hand
    /// this out before `Init`/`Load` have brought the base to `Ready`.
    pub fn container(&self) -> &C {
        assert!(self.is_ready(), "container accessed before Ready");
        unsafe { &*(self.container_ptr as *const C) }
    }

    fn container_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.container_ptr, self.container_len) }
    }

    /// Attach or create the backing segment and sub-allocate meta,
    /// file-header copy, and container body inside it.
    ///
    /// Returns `Ok(true)` if an existing, valid segment was found (the
    /// base is now `Ready`, no file read needed) or `Ok(false)` if the
    /// base is now `Constructed` and the caller must call [`Self::load`].
    pub fn init(&mut self) -> RoshmResult<bool> {
        let file_path = Path::new(&self.path);
        let body_size = wire::peek_body_size(file_path)?;
        let extra = wire::fixed_preamble_size() as u64;
        let existed = self.segment.init(body_size, extra)?;

        let base = self.segment.address().ok_or_else(|| RoshmError::Oom { path: self.path.clone() })?;
        let cap = self.segment.size();
        let mut region = unsafe { Region::new(base, cap) };

        let meta_ptr = region.reserve::<Meta>(&self.path)?;
        let header_ptr = region.reserve::<FileHeader>(&self.path)?;
        let container_len = cap.saturating_sub(region.used_size());
        let container_ptr = region.reserve_n::<u8>(container_len, &self.path)?;

        self.meta = meta_ptr;
        self.header = header_ptr;
        self.container_ptr = container_ptr;
        self.container_len = container_len;

        if existed && self.check_existing() {
            self.region = Some(region);
            self.status = BaseStatus::Ready;
            tracing::info!(path = %self.path, "shared base attached existing segment, already ready");
            return Ok(true);
        }

        if existed {
            tracing::warn!(path = %self.path, "existing segment failed validation, reconstructing in place");
            region.reset();
            let meta_ptr = unsafe { region.construct(Meta::new(&self.path, std::any::type_name::<C>(), &self.group, self.app_id, wire::type_hash_of::<C>()), &self.path)? };
            let header_ptr = region.reserve::<FileHeader>(&self.path)?;
            let container_len = cap.saturating_sub(region.used_size());
            let container_ptr = region.reserve_n::<u8>(container_len, &self.path)?;
            self.meta = meta_ptr;
            self.header = header_ptr;
            self.container_ptr = container_ptr;
            self.container_len = container_len;
        } else {
            let meta_value = Meta::new(&self.path, std::any::type_name::<C>(), &self.group, self.app_id, wire::type_hash_of::<C>());
            unsafe { meta_ptr.write(meta_value) };
        }

        self.region = Some(region);
        self.status = BaseStatus::Constructed;
        Ok(false)
    }

    /// Validate an already-attached, pre-existing segment without
    /// reading the file: marker, path, type hash, version, integrity,
    /// and tightness must all agree.
    fn check_existing(&mut self) -> bool {
        let expected_type_hash = wire::type_hash_of::<C>();
        let meta_ptr = self.meta;
        {
            let meta = unsafe { &*meta_ptr };
            if !meta.is_marked() || meta.path_str() != self.path {
                return false;
            }
            if meta.type_hash != expected_type_hash || meta.version() != FORMAT_VERSION {
                return false;
            }
        }
        let bytes = unsafe { std::slice::from_raw_parts(self.container_ptr as *const u8, self.container_len) };
        let meta_mut = unsafe { &mut *meta_ptr };
        if !self.integrity.verify(bytes, meta_mut, false) {
            return false;
        }
        let container = unsafe { &*(self.container_ptr as *const C) };
        container.memsize() == self.container_len
    }

    /// Idempotent when already `Ready`. Reads the file header and body,
    /// verifies type hash and fit, copies the body into the container
    /// region, stamps the integrity check, and checks tightness. On any
    /// failure the segment is destroyed.
    pub fn load(&mut self) -> RoshmResult<()> {
        if self.status == BaseStatus::Ready {
            return Ok(());
        }
        if self.status != BaseStatus::Constructed {
            return Err(RoshmError::WrongStatus { path: self.path.clone() });
        }

        let result = self.load_inner();
        if result.is_err() {
            let _ = self.destroy();
        }
        result
    }

    fn load_inner(&mut self) -> RoshmResult<()> {
        let expected_type_hash = wire::type_hash_of::<C>();
        let (header, body) = wire::read_container_file(Path::new(&self.path), expected_type_hash)?;
        if body.len() > self.container_len {
            return Err(RoshmError::LoadFail { path: self.path.clone() });
        }
        unsafe { self.header.write(header) };
        unsafe { std::ptr::copy_nonoverlapping(body.as_ptr(), self.container_ptr, body.len()) };
        if body.len() < self.container_len {
            unsafe { std::ptr::write_bytes(self.container_ptr.add(body.len()), 0, self.container_len - body.len()) };
        }

        let bytes = unsafe { std::slice::from_raw_parts(self.container_ptr as *const u8, self.container_len) };
        let meta_mut = unsafe { &mut *self.meta };
        if !self.integrity.verify(bytes, meta_mut, true) {
            return Err(RoshmError::CheckFail { path: self.path.clone() });
        }

        let container = unsafe { &*(self.container_ptr as *const C) };
        if container.memsize() != self.container_len {
            return Err(RoshmError::LoadFail { path: self.path.clone() });
        }

        self.status = BaseStatus::Ready;
        tracing::info!(path = %self.path, bytes = body.len(), "shared base loaded container from file");
        Ok(())
    }

    /// Clear the meta pointer and ask the segment to remove itself.
    /// Safe to call repeatedly.
    pub fn destroy(&mut self) -> RoshmResult<()> {
        if self.status == BaseStatus::Removed {
            return Ok(());
        }
        self.meta = std::ptr::null_mut();
        self.header = std::ptr::null_mut();
        self.container_ptr = std::ptr::null_mut();
        self.container_len = 0;
        self.region = None;
        self.segment.remove()?;
        self.status = BaseStatus::Removed;
        Ok(())
    }

    /// Inverse of `load`: write the exact container bytes, preceded by a
    /// fresh `FileHeader`, to `path`. Used to reserialize a read segment.
    pub fn export(&self, path: &Path) -> RoshmResult<()> {
        assert!(self.is_ready(), "export called before Ready");
        wire::write_container_file(path, wire::type_hash_of::<C>(), self.container_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Vector;
    use crate::segment::heap::HeapSegment;
    use crate::wire::LabelCheck;

    fn write_vector_file(dir: &std::path::Path, name: &str, values: &[u32]) -> std::path::PathBuf {
        let body = wire::dump_vector(values);
        let path = dir.join(name);
        wire::write_container_file(&path, wire::type_hash_of::<Vector<u32, u64>>(), &body).unwrap();
        path
    }

    #[test]
    fn fresh_file_loads_into_heap_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vector_file(dir.path(), "vec1", &[1, 2, 3, 4, 5]);
        let segment = Box::new(HeapSegment::new(path.to_string_lossy().to_string()));
        let mut base: SharedBase<Vector<u32, u64>> =
            SharedBase::new(path.to_string_lossy().to_string(), "grp", 1, segment, Box::new(LabelCheck));

        let already_ready = base.init().unwrap();
        assert!(!already_ready);
        assert_eq!(base.status(), BaseStatus::Constructed);

        base.load().unwrap();
        assert!(base.is_ready());
        assert_eq!(base.container().as_slice(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn load_is_idempotent_once_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vector_file(dir.path(), "vec2", &[9, 8, 7]);
        let segment = Box::new(HeapSegment::new(path.to_string_lossy().to_string()));
        let mut base: SharedBase<Vector<u32, u64>> =
            SharedBase::new(path.to_string_lossy().to_string(), "grp", 1, segment, Box::new(LabelCheck));
        base.init().unwrap();
        base.load().unwrap();
        base.load().unwrap();
        assert!(base.is_ready());
    }

    #[test]
    fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vector_file(dir.path(), "vec3", &[1]);
        let segment = Box::new(HeapSegment::new(path.to_string_lossy().to_string()));
        let mut base: SharedBase<Vector<u32, u64>> =
            SharedBase::new(path.to_string_lossy().to_string(), "grp", 1, segment, Box::new(LabelCheck));
        base.init().unwrap();
        base.load().unwrap();
        base.destroy().unwrap();
        base.destroy().unwrap();
        assert_eq!(base.status(), BaseStatus::Removed);
    }

    #[test]
    fn export_reproduces_a_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vector_file(dir.path(), "vec4", &[3, 1, 4, 1, 5]);
        let segment = Box::new(HeapSegment::new(path.to_string_lossy().to_string()));
        let mut base: SharedBase<Vector<u32, u64>> =
            SharedBase::new(path.to_string_lossy().to_string(), "grp", 1, segment, Box::new(LabelCheck));
        base.init().unwrap();
        base.load().unwrap();

        let export_path = dir.path().join("vec4.export");
        base.export(&export_path).unwrap();

        let segment2 = Box::new(HeapSegment::new(export_path.to_string_lossy().to_string()));
        let mut base2: SharedBase<Vector<u32, u64>> =
            SharedBase::new(export_path.to_string_lossy().to_string(), "grp", 1, segment2, Box::new(LabelCheck));
        base2.init().unwrap();
        base2.load().unwrap();
        assert_eq!(base2.container().as_slice(), &[3, 1, 4, 1, 5]);
    }

    #[test]
    fn malformed_type_hash_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrong_type");
        let body = wire::dump_vector(&[1u32, 2, 3]);
        // Write with a type hash that doesn't match Vector<u32, u64>.
        wire::write_container_file(&path, 0xdead_beef, &body).unwrap();
        let segment = Box::new(HeapSegment::new(path.to_string_lossy().to_string()));
        let mut base: SharedBase<Vector<u32, u64>> =
            SharedBase::new(path.to_string_lossy().to_string(), "grp", 1, segment, Box::new(LabelCheck));
        base.init().unwrap();
        assert!(base.load().is_err());
        assert_eq!(base.status(), BaseStatus::Removed);
    }
}
