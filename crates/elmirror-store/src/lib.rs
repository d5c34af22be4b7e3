//! On-disk state of an elmirror mirror.
//!
//! This crate provides the storage layer: `MirrorLayout` for the directory
//! structure, `RegistryStore` for crash-consistent checkpoints of the ordered
//! `RegistryState`, `PackageStore` for the per-release content triple
//! (`elm.json`, `hash.json`, `package.zip`) published by atomic directory rename,
//! `IndexStore` for the full-index document, and `verify_mirror` for
//! re-checking stored archives against their recorded checksums.

pub mod index;
pub mod integrity;
pub mod layout;
pub mod packages;
pub mod registry;

pub use index::IndexStore;
pub use integrity::{
    check_package, verify_mirror, verify_store_integrity, IntegrityFailure, IntegrityProblem,
    IntegrityReport,
};
pub use layout::{MirrorLayout, STORE_FORMAT_VERSION};
pub use packages::{sha1_hex, PackageFiles, PackageStore, Published};
pub use registry::{
    ErrorKind, PackageError, PackageRecord, PackageStatus, RegistryState, RegistryStore,
    StatusCounts,
};

use elmirror_schema::PackageId;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// On Linux with ext4 `data=ordered` (the default), renames are usually
/// durable without an explicit dir fsync, but POSIX does not guarantee this.
/// Calling `fsync()` on the parent directory makes the rename durable on
/// all filesystems and mount configurations.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Replace `path` with `data` so that readers see either the old or the new
/// file, never a torn one.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("schema error: {0}")]
    Schema(#[from] elmirror_schema::SchemaError),
    #[error("integrity check failed for '{what}': expected {expected}, got {actual}")]
    IntegrityFailure {
        what: String,
        expected: String,
        actual: String,
    },
    #[error("checksum mismatch for {id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        id: PackageId,
        expected: String,
        actual: String,
    },
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("package not found: {0}")]
    PackageNotFound(String),
    #[error("package {id} is {status}: {reason}")]
    PackageUnavailable {
        id: PackageId,
        status: PackageStatus,
        reason: String,
    },
    #[error("package {0} is already recorded")]
    DuplicateRecord(PackageId),
    #[error("inconsistent registry: {0}")]
    Inconsistent(String),
}
