//! # roshm — read-only shared containers
//!
//! Vectors, nested vectors, sorted maps/sets, and hash maps/sets that are
//! built once by a producer, published as a flat byte blob, and then
//! attached by any number of readers either over System V shared memory
//! or, for single-process use and tests, a private heap buffer. A
//! reader's view is just an offset-addressed header over those bytes —
//! there is no deserialization step and no synchronization needed once a
//! segment reaches `Ready`, since nothing is mutated after publication.
//!
//! ## Pieces
//!
//! - [`alloc`]: a bump allocator over a raw byte window (shared-memory or
//!   heap), used once per segment to lay out its fixed preamble and body.
//! - [`container`]: the offset-addressed container family itself —
//!   [`container::Vector`], [`container::nested_hashmap`], sorted
//!   [`container::map`]/[`container::set`], and hash
//!   [`container::hashmap`]/[`container::hashset`] — read-only headers
//!   over bytes produced by [`wire`].
//! - [`wire`]: the on-disk/on-segment format — file header, segment meta
//!   block, per-container `Dump` builders, and the two integrity check
//!   strategies ([`wire::LabelCheck`], [`wire::Md5Check`]).
//! - [`segment`]: the two backends a [`shared_base::SharedBase`] can sit
//!   on — [`segment::sysv::SysVSegment`] (kernel shared memory, deduped
//!   by [`segment::id_manager::IdManager`]) and
//!   [`segment::heap::HeapSegment`] (process-private).
//! - [`shared_base`]: the per-container `Init`/`Load`/`Destroy` state
//!   machine that ties a segment to its wire format and integrity check.
//! - [`manager`]: the process-wide registry ([`manager::Manager`]) that
//!   dedups, reaps, and administers every registered path, plus
//!   [`manager::Session`], a per-`(group, app_id)` handle set.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use roshm::config::Config;
//! use roshm::container::Vector;
//! use roshm::manager::Manager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Manager::new(Config::default());
//! manager.start_reaper();
//!
//! let handle = manager.register::<Vector<i64>>("/data/prices.bin", "quotes", 1)?;
//! let last = handle.with(|v| v.get(v.len() - 1).copied());
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety
//!
//! - **Process safety**: every segment stamps the registering process's
//!   identity in its meta block; [`segment::id_manager::IdManager`]
//!   dedups kernel segments by path at startup so a crashed producer's
//!   orphan is found and reused rather than leaked.
//! - **Memory safety**: containers are read-only from the moment they
//!   reach `Ready`; the bump allocator and the integrity checks run once,
//!   before publication, and are never re-entered on the read path.
//! - **Corruption detection**: [`wire::LabelCheck`] (presence-only) and
//!   [`wire::Md5Check`] (full digest) both run against the file on disk
//!   before `Load`, and again against the live segment on re-attach.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod config;
pub mod container;
pub mod error;
pub mod manager;
pub mod segment;
pub mod shared_base;
pub mod wire;

pub use config::Config;
pub use error::{RoshmError, RoshmResult};
pub use manager::{Handle, Manager, Session};
pub use shared_base::{BaseStatus, SharedBase};

/// Install a process-wide `tracing` subscriber driven by `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber =
        fmt::Subscriber::builder().with_env_filter(EnvFilter::from_default_env()).with_target(false).with_thread_ids(true).finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
