//! Access to the upstream package registry.
//!
//! This crate provides the `Upstream` trait describing the registry protocol
//! (`all-packages/since/N`, `all-packages`, `endpoint.json`, `elm.json` and
//! the archive download), the `HttpUpstream` implementation over `ureq`, the
//! process-wide `RateBudget` every outbound request draws from, and an
//! in-memory `MockUpstream` for tests.

pub mod budget;
pub mod config;
pub mod http;
pub mod mock;

pub use budget::RateBudget;
pub use config::UpstreamConfig;
pub use http::HttpUpstream;
pub use mock::{MockFailure, MockUpstream};

use elmirror_schema::{AllPackages, Endpoint, PackageId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("request budget exhausted before the deadline")]
    BudgetExhausted,
    #[error("upstream config error: {0}")]
    Config(String),
}

impl RemoteError {
    /// Whether a later attempt might succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Http(_) | RemoteError::Io(_))
    }
}

/// The upstream registry protocol.
///
/// Every method is one outbound request and draws one unit from the rate
/// budget of the implementation, whether it succeeds or not.
pub trait Upstream: Send + Sync {
    /// Identifiers published after the first `anchor` releases, newest first.
    fn since(&self, anchor: u64) -> Result<Vec<PackageId>, RemoteError>;

    /// The unordered full index.
    fn all_packages(&self) -> Result<AllPackages, RemoteError>;

    /// Location and hash of a release's archive.
    fn endpoint(&self, id: &PackageId) -> Result<Endpoint, RemoteError>;

    /// The release's `elm.json`, as published.
    fn metadata(&self, id: &PackageId) -> Result<Vec<u8>, RemoteError>;

    /// Archive bytes from the content origin named by `endpoint.json`.
    fn archive(&self, url: &str) -> Result<Vec<u8>, RemoteError>;
}
