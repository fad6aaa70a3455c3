//! Tunables for the segment backend and the process-wide manager.
//!
//! The original implementation hard-codes these as file-scope constants;
//! this crate collects them into one `Config` so an embedding application
//! can override them (for tests, a smaller reaper period is useful; for a
//! constrained host, a lower segment ceiling might be wanted).
//!
//! [`Config::from_toml_str`]/[`Config::load`] parse a plain `serde`-derived
//! file shape with `toml`, then convert it into the runtime `Config`
//! (millisecond fields become `Duration`s).

use serde::{Deserialize, Serialize};

use crate::error::RoshmResult;

/// Minimum legal segment size, in bytes. Zero-sized segments are rejected.
pub const MIN_SEGMENT_SIZE: u64 = 1;

/// Hard ceiling on any single segment's size: 60 GB.
pub const MAX_SEGMENT_SIZE: u64 = 60_000_000_000;

/// Byte alignment the bump allocator rounds every reservation up to.
pub const ALLOC_ALIGNMENT: usize = 8;

/// Current on-disk/in-segment format version, stamped into the high byte
/// of every `flags` field.
pub const FORMAT_VERSION: u8 = 2;

/// Marker substring every segment's meta `summary` field must contain for
/// the IdManager's kernel-table scan to recognize it as one of ours.
pub const SEGMENT_MARKER: &str = "roshm";

/// Magic label stamped into a meta block for the fast ("label") integrity
/// check mode.
pub const INTEGRITY_LABEL_MAGIC: u64 = 0x1_2345_6789;

/// Which [`crate::segment::Segment`] implementation the manager hands
/// out for new registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// Cross-process, kernel-backed System V shared memory.
    SysV,
    /// Process-private heap buffer; same layout, no cross-process sharing.
    Heap,
}

/// Which [`crate::wire::IntegrityCheck`] strategy the manager hands out
/// for new registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityMode {
    /// Fast path: a magic label stamped once, checked for presence only.
    Label,
    /// Slow path: a full MD5 digest of the container region.
    Md5,
}

/// Process-wide tunables for the [`crate::manager::Manager`] and the
/// segment backend.
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the background reaper sweeps the registry.
    pub reap_interval: std::time::Duration,
    /// Worker pool divisor for `VerifyFiles`: `max(1, num_cpus / divisor)`.
    pub verify_thread_divisor: usize,
    /// Grace period held before a `Releasing` entry is eligible for reap
    /// even once its strong count drops to one (guards against a
    /// just-registered handle being reaped before its first real use).
    pub release_grace_period: std::time::Duration,
    /// Segment backend new registrations are built on.
    pub segment_kind: SegmentKind,
    /// Integrity strategy new registrations are built with.
    pub integrity_mode: IntegrityMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reap_interval: std::time::Duration::from_secs(1),
            verify_thread_divisor: 2,
            release_grace_period: std::time::Duration::from_millis(0),
            segment_kind: SegmentKind::SysV,
            integrity_mode: IntegrityMode::Label,
        }
    }
}

/// On-disk shape of [`Config`], the way an embedding application would
/// check it into a TOML file. Durations are spelled out in milliseconds
/// since `Duration` has no native TOML representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// See [`Config::reap_interval`], in milliseconds.
    pub reap_interval_ms: u64,
    /// See [`Config::verify_thread_divisor`].
    pub verify_thread_divisor: usize,
    /// See [`Config::release_grace_period`], in milliseconds.
    pub release_grace_period_ms: u64,
    /// See [`Config::segment_kind`].
    pub segment_kind: SegmentKind,
    /// See [`Config::integrity_mode`].
    pub integrity_mode: IntegrityMode,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let defaults = Config::default();
        ConfigFile {
            reap_interval_ms: defaults.reap_interval.as_millis() as u64,
            verify_thread_divisor: defaults.verify_thread_divisor,
            release_grace_period_ms: defaults.release_grace_period.as_millis() as u64,
            segment_kind: defaults.segment_kind,
            integrity_mode: defaults.integrity_mode,
        }
    }
}

impl From<ConfigFile> for Config {
    fn from(file: ConfigFile) -> Self {
        Config {
            reap_interval: std::time::Duration::from_millis(file.reap_interval_ms),
            verify_thread_divisor: file.verify_thread_divisor,
            release_grace_period: std::time::Duration::from_millis(file.release_grace_period_ms),
            segment_kind: file.segment_kind,
            integrity_mode: file.integrity_mode,
        }
    }
}

impl Config {
    /// Parse a TOML document into a `Config`. Unknown fields are ignored;
    /// missing fields fall back to [`Config::default`].
    pub fn from_toml_str(text: &str) -> RoshmResult<Config> {
        let file: ConfigFile = toml::from_str(text)?;
        Ok(file.into())
    }

    /// Read and parse a TOML config file from `path`.
    pub fn load(path: impl AsRef<std::path::Path>) -> RoshmResult<Config> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
