use crate::layout::MirrorLayout;
use crate::StoreError;
use elmirror_schema::PackageId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use tracing::{debug, info};

const REGISTRY_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    /// Known upstream, not attempted yet.
    Pending,
    /// Content triple stored and verified at write time.
    Success,
    /// Attempted and did not complete.
    Failed,
    /// Excluded by the selection filter.
    Ignored,
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageStatus::Pending => write!(f, "pending"),
            PackageStatus::Success => write!(f, "success"),
            PackageStatus::Failed => write!(f, "failed"),
            PackageStatus::Ignored => write!(f, "ignored"),
        }
    }
}

/// Why the last attempt on a release failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    ChecksumMismatch,
    MissingContent,
    MalformedResponse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::ChecksumMismatch => write!(f, "checksum mismatch"),
            ErrorKind::MissingContent => write!(f, "missing content"),
            ErrorKind::MalformedResponse => write!(f, "malformed response"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl PackageError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for PackageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageRecord {
    pub id: PackageId,
    pub status: PackageStatus,
    /// Last failure, kept only while the record is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PackageError>,
}

impl PackageRecord {
    /// Human-readable reason a non-`success` record cannot be served.
    pub fn unavailable_reason(&self) -> String {
        match (self.status, &self.error) {
            (PackageStatus::Pending, _) => "has not been downloaded yet".to_owned(),
            (PackageStatus::Failed, Some(err)) => format!("failed to download ({err})"),
            (PackageStatus::Failed, None) => "failed to download".to_owned(),
            (PackageStatus::Ignored, _) => "is not available on this mirror".to_owned(),
            (PackageStatus::Success, _) => "is available".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub success: usize,
    pub failed: usize,
    pub ignored: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.success + self.failed + self.ignored
    }
}

/// Every release ever observed upstream, oldest first, plus the anchor total.
///
/// Records live in an append-only sequence; `index` maps an identifier to its
/// position so lookups do not depend on scanning. Nothing removes or reorders
/// a record once it has been pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryState {
    records: Vec<PackageRecord>,
    index: HashMap<PackageId, usize>,
    known_total: u64,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<PackageRecord>, known_total: u64) -> Result<Self, StoreError> {
        if known_total != records.len() as u64 {
            return Err(StoreError::Inconsistent(format!(
                "known_total is {known_total} but {} records are stored",
                records.len()
            )));
        }
        let mut index = HashMap::with_capacity(records.len());
        for (pos, record) in records.iter().enumerate() {
            if index.insert(record.id.clone(), pos).is_some() {
                return Err(StoreError::DuplicateRecord(record.id.clone()));
            }
        }
        Ok(Self {
            records,
            index,
            known_total,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Count of every identifier ever observed upstream, regardless of status.
    /// This, not the number of successes, anchors incremental queries.
    #[inline]
    pub fn known_total(&self) -> u64 {
        self.known_total
    }

    /// All records, oldest observed first.
    #[inline]
    pub fn records(&self) -> &[PackageRecord] {
        &self.records
    }

    pub fn contains(&self, id: &PackageId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &PackageId) -> Option<&PackageRecord> {
        self.index.get(id).map(|&pos| &self.records[pos])
    }

    pub fn status(&self, id: &PackageId) -> Option<PackageStatus> {
        self.get(id).map(|r| r.status)
    }

    /// Append a newly observed identifier. Advances `known_total` by one.
    pub fn push(&mut self, id: PackageId, status: PackageStatus) -> Result<(), StoreError> {
        if self.index.contains_key(&id) {
            return Err(StoreError::DuplicateRecord(id));
        }
        self.index.insert(id.clone(), self.records.len());
        self.records.push(PackageRecord {
            id,
            status,
            error: None,
        });
        self.known_total += 1;
        Ok(())
    }

    /// Change the status of an existing record. `error` is kept only for
    /// `failed`; any other status clears it.
    pub fn set_status(
        &mut self,
        id: &PackageId,
        status: PackageStatus,
        error: Option<PackageError>,
    ) -> Result<(), StoreError> {
        let pos = *self
            .index
            .get(id)
            .ok_or_else(|| StoreError::PackageNotFound(id.to_string()))?;
        let record = &mut self.records[pos];
        record.status = status;
        record.error = if status == PackageStatus::Failed {
            error
        } else {
            None
        };
        Ok(())
    }

    /// Identifiers published after `anchor` releases, newest first.
    ///
    /// This is the answer to the upstream `since/{anchor}` query and covers
    /// records of every status.
    pub fn since(&self, anchor: u64) -> Vec<&PackageId> {
        let start = usize::try_from(anchor).unwrap_or(usize::MAX);
        if start >= self.records.len() {
            return Vec::new();
        }
        self.records[start..].iter().rev().map(|r| &r.id).collect()
    }

    pub fn with_status(&self, status: PackageStatus) -> impl Iterator<Item = &PackageRecord> {
        self.records.iter().filter(move |r| r.status == status)
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in &self.records {
            match record.status {
                PackageStatus::Pending => counts.pending += 1,
                PackageStatus::Success => counts.success += 1,
                PackageStatus::Failed => counts.failed += 1,
                PackageStatus::Ignored => counts.ignored += 1,
            }
        }
        counts
    }

    pub fn failing(&self) -> Vec<&PackageRecord> {
        self.with_status(PackageStatus::Failed).collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryDocument {
    format_version: u32,
    known_total: u64,
    updated_at: String,
    packages: Vec<PackageRecord>,
    /// blake3 over the document without this field. `None` only while computing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

impl RegistryDocument {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let copy = RegistryDocument {
            format_version: self.format_version,
            known_total: self.known_total,
            updated_at: self.updated_at.clone(),
            packages: self.packages.clone(),
            checksum: None,
        };
        let json = serde_json::to_vec(&copy)?;
        Ok(blake3::hash(&json).to_hex().to_string())
    }
}

/// Registry files written by the first generation of the mirror script:
/// `{"packages": [{"id", "status"}]}`, newest first, no anchor.
#[derive(Debug, Deserialize)]
struct LegacyDocument {
    packages: Vec<LegacyRecord>,
}

#[derive(Debug, Deserialize)]
struct LegacyRecord {
    id: PackageId,
    status: PackageStatus,
}

/// Durable home of the [`RegistryState`].
///
/// Each [`checkpoint`](Self::checkpoint) is a complete replacement of
/// `registry.json` through write-temp-then-rename, so a concurrent reader
/// (the serving layer) or a crash never observes a torn document.
pub struct RegistryStore {
    layout: MirrorLayout,
}

impl RegistryStore {
    pub fn new(layout: MirrorLayout) -> Self {
        Self { layout }
    }

    /// Load the last checkpoint. A missing file is an empty registry.
    pub fn load(&self) -> Result<RegistryState, StoreError> {
        let path = self.layout.registry_file();
        if !path.exists() {
            return Ok(RegistryState::new());
        }
        let data = fs::read(&path)?;
        let value: serde_json::Value = serde_json::from_slice(&data)?;

        if value.get("format_version").is_none() {
            let legacy: LegacyDocument = serde_json::from_value(value)?;
            info!(
                "reading legacy registry with {} records",
                legacy.packages.len()
            );
            let mut records: Vec<PackageRecord> = legacy
                .packages
                .into_iter()
                .map(|r| PackageRecord {
                    id: r.id,
                    status: r.status,
                    error: None,
                })
                .collect();
            records.reverse();
            let total = records.len() as u64;
            return RegistryState::from_records(records, total);
        }

        let doc: RegistryDocument = serde_json::from_value(value)?;
        if doc.format_version != REGISTRY_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: REGISTRY_FORMAT_VERSION,
                found: doc.format_version,
            });
        }
        if let Some(ref expected) = doc.checksum {
            let actual = doc.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    what: "registry.json".to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        RegistryState::from_records(doc.packages, doc.known_total)
    }

    /// Atomically replace the durable registry with `state`.
    pub fn checkpoint(&self, state: &RegistryState) -> Result<(), StoreError> {
        let mut doc = RegistryDocument {
            format_version: REGISTRY_FORMAT_VERSION,
            known_total: state.known_total,
            updated_at: chrono::Utc::now().to_rfc3339(),
            packages: state.records.clone(),
            checksum: None,
        };
        doc.checksum = Some(doc.compute_checksum()?);
        let content = serde_json::to_vec_pretty(&doc)?;
        crate::write_atomic(&self.layout.registry_file(), &content)?;
        debug!(
            "checkpoint: {} records, known_total {}",
            state.len(),
            state.known_total
        );
        Ok(())
    }
}
