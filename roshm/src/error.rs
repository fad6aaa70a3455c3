//! Error types for the shared-container lifecycle.
//!
//! The variant set mirrors the status-code taxonomy in the external wire
//! format: every code a producer or consumer may see on the wire has a
//! corresponding variant here, plus the ambient I/O/OS-call wrappers the
//! rest of the crate needs.

use thiserror::Error;

/// Errors that can occur while creating, loading, or managing a shared
/// container.
#[derive(Error, Debug)]
pub enum RoshmError {
    /// The backing file for a container does not exist.
    #[error("container file not found: {path}")]
    FileNoExist {
        /// Path that was requested.
        path: String,
    },

    /// A requested segment size is zero or exceeds the hard ceiling.
    #[error("illegal shared segment size: {size} bytes")]
    ShmSizeErr {
        /// Size that was rejected.
        size: u64,
    },

    /// The backing allocator or segment ran out of room.
    #[error("out of memory allocating segment for {path}")]
    Oom {
        /// Path the allocation was for.
        path: String,
    },

    /// Reading the container file failed or returned a short read.
    #[error("failed to read container file: {path}")]
    ReadFail {
        /// Path that failed to read.
        path: String,
    },

    /// Addressing or placement-construction inside the region failed.
    #[error("allocation inside shared region failed for {path}")]
    AllocFail {
        /// Path the allocation was for.
        path: String,
    },

    /// An existing segment failed its integrity re-validation.
    #[error("integrity check failed for existing segment: {path}")]
    CheckFail {
        /// Path that failed the check.
        path: String,
    },

    /// Loading the file body into a freshly created segment failed.
    #[error("failed to load container body: {path}")]
    LoadFail {
        /// Path that failed to load.
        path: String,
    },

    /// Another thread or process is already loading the same path.
    #[error("container already loading: {path}")]
    Loading {
        /// Path that is loading.
        path: String,
    },

    /// The runtime type requested does not match the registered type.
    #[error("wrong container type requested for {path}")]
    WrongType {
        /// Path whose type mismatched.
        path: String,
    },

    /// Lookup found no registration for the requested path.
    #[error("container not registered: {path}")]
    NotRegistered {
        /// Path that was not found.
        path: String,
    },

    /// `Register` was called twice for the same path from the same
    /// instance without an intervening `Release`.
    #[error("container already registered: {path}")]
    AlreadyRegistered {
        /// Path that was already registered.
        path: String,
    },

    /// The container is in a status that forbids the requested operation.
    #[error("container in wrong status for this operation: {path}")]
    WrongStatus {
        /// Path whose status forbade the operation.
        path: String,
    },

    /// External file verification (digest/MD5) failed.
    #[error("file verification failed: {path}")]
    FileCheckFail {
        /// Path that failed verification.
        path: String,
    },

    /// Construction raised an exception-equivalent the caller must see.
    #[error("internal exception constructing container: {path}")]
    Exception {
        /// Path being constructed when the failure occurred.
        path: String,
    },

    /// A raw OS/libc call returned an error this crate could not recover
    /// from.
    #[error("system error during shared memory operation: {0}")]
    SysErr(String),

    /// Two distinct paths collided on the same derived segment key, or
    /// an attached segment's stored path does not match the requested
    /// path.
    #[error("shared memory key conflict for path: {path}")]
    KeyConflict {
        /// Path that collided.
        path: String,
    },

    /// Wrapped `std::io::Error`.
    #[error("IO error: {source}")]
    Io {
        /// Source IO error.
        #[from]
        source: std::io::Error,
    },

    /// Wrapped `nix` system call error.
    #[error("system call error: {source}")]
    Nix {
        /// Source nix error.
        #[from]
        source: nix::Error,
    },

    /// A `Config` TOML document failed to parse.
    #[error("failed to parse config: {source}")]
    Toml {
        /// Source TOML parse error.
        #[from]
        source: toml::de::Error,
    },
}

/// Result type for every operation in this crate.
pub type RoshmResult<T> = Result<T, RoshmError>;
