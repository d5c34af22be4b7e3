//! Identifiers, selection filters, and upstream document shapes for elmirror.
//!
//! This crate defines the schema layer shared by every other crate: the
//! `author/name@version` package identifier (`PackageId`) with semantic-version
//! ordering, the operator-supplied allowlist (`SelectionFilter`), and the JSON
//! documents exchanged with the upstream registry (`Endpoint`, `AllPackages`,
//! `HashDocument`).

pub mod filter;
pub mod protocol;
pub mod types;

pub use filter::{FilterEntry, SelectionFilter};
pub use protocol::{flatten_index, AllPackages, Endpoint, HashDocument};
pub use types::{ContentHash, PackageId, PackageName};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid package identifier '{0}': expected author/name@version")]
    InvalidId(String),
    #[error("invalid package name '{0}': expected author/name")]
    InvalidName(String),
    #[error("invalid version '{version}' in '{input}': {source}")]
    InvalidVersion {
        input: String,
        version: String,
        #[source]
        source: semver::Error,
    },
    #[error("failed to read package list: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse package list: {0}")]
    Json(#[from] serde_json::Error),
}
