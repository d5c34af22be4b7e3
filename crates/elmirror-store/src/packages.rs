use crate::integrity::check_package;
use crate::layout::{MirrorLayout, ARCHIVE_FILE, CHECKSUM_FILE, METADATA_FILE};
use crate::registry::{PackageStatus, RegistryState};
use crate::{fsync_dir, StoreError};
use elmirror_schema::{ContentHash, HashDocument, PackageId};
use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Lowercase hex SHA-1 of `data`, the content hash the registry publishes.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Outcome of a successful [`PackageStore::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Written,
    /// A verified triple with the same hash was already in place.
    AlreadyPresent,
}

/// Paths of a stored content triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFiles {
    pub metadata: PathBuf,
    pub checksum: PathBuf,
    pub archive: PathBuf,
}

/// Per-release content store.
///
/// A release lives in its own directory `packages/<author>/<name>/<version>/`.
/// Publishing assembles the three files in `.staging/` and commits them with a
/// single directory `rename()`, so readers see the whole triple or nothing.
/// There is no delete operation.
pub struct PackageStore {
    layout: MirrorLayout,
}

impl PackageStore {
    pub fn new(layout: MirrorLayout) -> Self {
        Self { layout }
    }

    pub fn files(&self, id: &PackageId) -> PackageFiles {
        PackageFiles {
            metadata: self.layout.metadata_file(id),
            checksum: self.layout.checksum_file(id),
            archive: self.layout.archive_file(id),
        }
    }

    /// Whether the final directory of `id` holds all three files.
    pub fn exists(&self, id: &PackageId) -> bool {
        let files = self.files(id);
        files.metadata.is_file() && files.checksum.is_file() && files.archive.is_file()
    }

    /// Verify `archive` against `expected` and commit the triple.
    ///
    /// On a hash mismatch nothing is written and `ChecksumMismatch` is
    /// returned. Safe to call concurrently for distinct identifiers.
    pub fn publish(
        &self,
        id: &PackageId,
        metadata: &[u8],
        archive: &[u8],
        expected: &ContentHash,
    ) -> Result<Published, StoreError> {
        let actual = sha1_hex(archive);
        let expected = expected.to_ascii_lowercase();
        if actual != expected {
            return Err(StoreError::ChecksumMismatch {
                id: id.clone(),
                expected,
                actual,
            });
        }

        let dest = self.layout.package_dir(id);
        let existing_valid = dest.exists()
            && check_package(&self.layout, id).is_ok()
            && stored_hash(&self.layout.checksum_file(id)).as_deref() == Some(actual.as_str());
        if existing_valid {
            debug!("{id} already present");
            return Ok(Published::AlreadyPresent);
        }

        let staging = self.layout.staging_dir();
        fs::create_dir_all(&staging)?;
        let tmp = tempfile::Builder::new()
            .prefix(&staging_prefix(id))
            .tempdir_in(&staging)?;

        let checksum_doc = serde_json::to_vec(&HashDocument {
            hash: ContentHash::new(actual),
        })?;
        write_synced(&tmp.path().join(METADATA_FILE), metadata)?;
        write_synced(&tmp.path().join(CHECKSUM_FILE), &checksum_doc)?;
        write_synced(&tmp.path().join(ARCHIVE_FILE), archive)?;
        fsync_dir(tmp.path())?;

        let parent = dest
            .parent()
            .ok_or_else(|| StoreError::Inconsistent(format!("no parent for {}", dest.display())))?;
        fs::create_dir_all(parent)?;

        // An invalid leftover is moved aside first; rename() cannot replace a
        // non-empty directory.
        let displaced = if dest.exists() {
            let mut aside = tmp.path().as_os_str().to_owned();
            aside.push(".replaced");
            let aside = PathBuf::from(aside);
            fs::rename(&dest, &aside)?;
            warn!("replacing unverifiable content for {id}");
            Some(aside)
        } else {
            None
        };

        fs::rename(tmp.path(), &dest)?;
        fsync_dir(parent)?;

        if let Some(aside) = displaced {
            if let Err(e) = fs::remove_dir_all(&aside) {
                warn!("failed to remove displaced {}: {e}", aside.display());
            }
        }

        debug!("published {id}");
        Ok(Published::Written)
    }

    /// Locate the stored triple of `id` for serving.
    ///
    /// Only `success` records resolve. A known record in another status is
    /// `PackageUnavailable` with its reason; an unknown one is `PackageNotFound`.
    pub fn locate(&self, state: &RegistryState, id: &PackageId) -> Result<PackageFiles, StoreError> {
        let record = state
            .get(id)
            .ok_or_else(|| StoreError::PackageNotFound(id.to_string()))?;
        if record.status != PackageStatus::Success {
            return Err(StoreError::PackageUnavailable {
                id: id.clone(),
                status: record.status,
                reason: record.unavailable_reason(),
            });
        }
        if !self.exists(id) {
            return Err(StoreError::PackageNotFound(format!("{id} (content missing)")));
        }
        Ok(self.files(id))
    }
}

fn staging_prefix(id: &PackageId) -> String {
    format!("{}-{}-{}.", id.author(), id.name(), id.version())
}

fn write_synced(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut f = File::create(path)?;
    f.write_all(data)?;
    f.sync_all()?;
    Ok(())
}

fn stored_hash(path: &Path) -> Option<String> {
    let data = fs::read(path).ok()?;
    let doc: HashDocument = serde_json::from_slice(&data).ok()?;
    Some(doc.hash.to_ascii_lowercase())
}
