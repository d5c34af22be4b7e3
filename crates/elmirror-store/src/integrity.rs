use crate::layout::MirrorLayout;
use crate::registry::{PackageStatus, RegistryState, RegistryStore};
use crate::StoreError;
use elmirror_schema::{HashDocument, PackageId};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::fmt;
use std::fs::{self, File};
use std::io;

#[derive(Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub passed: usize,
    pub failed: Vec<IntegrityFailure>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Serialize)]
pub struct IntegrityFailure {
    pub id: PackageId,
    pub problem: IntegrityProblem,
}

/// What is wrong with a `success` record's content triple.
///
/// A deleted archive and a corrupted one are distinct: the former means the
/// content is gone, the latter that it is still there but altered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityProblem {
    MissingArchive,
    MissingChecksum,
    MalformedChecksum { detail: String },
    HashMismatch { expected: String, actual: String },
    MissingMetadata,
    Unreadable { detail: String },
}

impl fmt::Display for IntegrityProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityProblem::MissingArchive => write!(f, "archive is missing"),
            IntegrityProblem::MissingChecksum => write!(f, "checksum document is missing"),
            IntegrityProblem::MalformedChecksum { detail } => {
                write!(f, "checksum document is malformed: {detail}")
            }
            IntegrityProblem::HashMismatch { expected, actual } => {
                write!(f, "archive hash mismatch: expected {expected}, got {actual}")
            }
            IntegrityProblem::MissingMetadata => write!(f, "metadata document is missing"),
            IntegrityProblem::Unreadable { detail } => write!(f, "unreadable: {detail}"),
        }
    }
}

/// Check one stored triple. Read-only.
pub fn check_package(layout: &MirrorLayout, id: &PackageId) -> Result<(), IntegrityProblem> {
    let archive_path = layout.archive_file(id);
    let mut archive = match File::open(&archive_path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(IntegrityProblem::MissingArchive)
        }
        Err(e) => {
            return Err(IntegrityProblem::Unreadable {
                detail: format!("{}: {e}", archive_path.display()),
            })
        }
    };

    let checksum = match fs::read(layout.checksum_file(id)) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(IntegrityProblem::MissingChecksum)
        }
        Err(e) => {
            return Err(IntegrityProblem::Unreadable {
                detail: e.to_string(),
            })
        }
    };
    let expected = serde_json::from_slice::<HashDocument>(&checksum)
        .map_err(|e| IntegrityProblem::MalformedChecksum {
            detail: e.to_string(),
        })?
        .hash
        .to_ascii_lowercase();

    let mut hasher = Sha1::new();
    io::copy(&mut archive, &mut hasher).map_err(|e| IntegrityProblem::Unreadable {
        detail: format!("{}: {e}", archive_path.display()),
    })?;
    let actual = hex::encode(hasher.finalize());
    if actual != expected {
        return Err(IntegrityProblem::HashMismatch { expected, actual });
    }

    if !layout.metadata_file(id).is_file() {
        return Err(IntegrityProblem::MissingMetadata);
    }
    Ok(())
}

/// Walk every `success` record of `state` and check its triple.
pub fn verify_mirror(layout: &MirrorLayout, state: &RegistryState) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    for record in state.with_status(PackageStatus::Success) {
        report.checked += 1;
        match check_package(layout, &record.id) {
            Ok(()) => report.passed += 1,
            Err(problem) => report.failed.push(IntegrityFailure {
                id: record.id.clone(),
                problem,
            }),
        }
    }
    report
}

/// Load the committed registry and verify it.
pub fn verify_store_integrity(layout: &MirrorLayout) -> Result<IntegrityReport, StoreError> {
    let state = RegistryStore::new(layout.clone()).load()?;
    Ok(verify_mirror(layout, &state))
}
