use crate::StoreError;
use elmirror_schema::PackageId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current mirror format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

pub const METADATA_FILE: &str = "elm.json";
pub const CHECKSUM_FILE: &str = "hash.json";
pub const ARCHIVE_FILE: &str = "package.zip";

/// Directory layout of a mirror.
///
/// ```text
/// <root>/registry.json                         registry state checkpoint
/// <root>/all-packages                          full-index document
/// <root>/packages/<author>/<name>/<version>/   elm.json, hash.json, package.zip
/// <root>/.staging/                             in-progress publishes
/// <root>/.lock                                 single-writer lock
/// <root>/version                               format marker
/// ```
///
/// The `registry.json`, `all-packages` and `packages/` paths are what the
/// serving layer reads; they stay stable across versions.
#[derive(Debug, Clone)]
pub struct MirrorLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl MirrorLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    #[inline]
    pub fn all_packages_file(&self) -> PathBuf {
        self.root.join("all-packages")
    }

    #[inline]
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    #[inline]
    pub fn package_dir(&self, id: &PackageId) -> PathBuf {
        self.packages_dir()
            .join(id.author())
            .join(id.name())
            .join(id.version().to_string())
    }

    #[inline]
    pub fn metadata_file(&self, id: &PackageId) -> PathBuf {
        self.package_dir(id).join(METADATA_FILE)
    }

    #[inline]
    pub fn checksum_file(&self, id: &PackageId) -> PathBuf {
        self.package_dir(id).join(CHECKSUM_FILE)
    }

    #[inline]
    pub fn archive_file(&self, id: &PackageId) -> PathBuf {
        self.package_dir(id).join(ARCHIVE_FILE)
    }

    /// Staging area for publishes. Lives inside the root so the final
    /// `rename()` never crosses a filesystem boundary.
    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(".staging")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.packages_dir())?;
        fs::create_dir_all(self.staging_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            crate::write_atomic(&version_path, content.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.root.join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }

    /// Remove publishes abandoned by an interrupted run, and temp files left by
    /// an interrupted checkpoint. Returns how many entries were removed. Only
    /// call while holding the writer lock.
    pub fn clean_staging(&self) -> Result<usize, StoreError> {
        let mut leftovers = Vec::new();
        let staging = self.staging_dir();
        if staging.exists() {
            for entry in fs::read_dir(&staging)? {
                leftovers.push(entry?.path());
            }
        }
        if self.root.exists() {
            for entry in fs::read_dir(&self.root)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with(".tmp") {
                    leftovers.push(entry.path());
                }
            }
        }

        let mut removed = 0;
        for path in leftovers {
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    debug!("removed stale staging entry {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("failed to remove stale staging entry {}: {e}", path.display()),
            }
        }
        Ok(removed)
    }
}
