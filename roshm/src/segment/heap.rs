//! Process-private alternate backend. Mirrors `shared_memory.hpp`'s
//! `HeapMemory`: same size semantics as the SysV backend, `is_exist`
//! always `false`, no cross-process sharing.

use super::Segment;
use crate::config::MAX_SEGMENT_SIZE;
use crate::error::{RoshmError, RoshmResult};

/// A single boxed byte buffer standing in for a shared segment, scoped
/// to this process.
pub struct HeapSegment {
    path: String,
    buf: Option<Box<[u8]>>,
}

impl HeapSegment {
    /// Build an unattached heap segment for `path` (used only for log
    /// messages; no file is touched here).
    pub fn new(path: impl Into<String>) -> Self {
        HeapSegment { path: path.into(), buf: None }
    }
}

impl Segment for HeapSegment {
    fn init(&mut self, body_size: u64, extra_size: u64) -> RoshmResult<bool> {
        let total = body_size + extra_size;
        if total == 0 || total >= MAX_SEGMENT_SIZE {
            return Err(RoshmError::ShmSizeErr { size: total });
        }
        self.buf = Some(vec![0u8; total as usize].into_boxed_slice());
        tracing::info!(path = %self.path, bytes = total, "heap memory init succ");
        Ok(false)
    }

    fn address(&self) -> Option<*mut u8> {
        self.buf.as_ref().map(|b| b.as_ptr() as *mut u8)
    }

    fn size(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    fn remove(&mut self) -> RoshmResult<()> {
        self.buf = None;
        Ok(())
    }
}
