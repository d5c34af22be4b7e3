//! Sync and integrity engine for an Elm package registry mirror.
//!
//! This crate ties the remote and store layers together into the `Engine`:
//! the `Planner` diffs upstream against the local registry state, the engine
//! fetches candidates with a bounded worker pool under the shared rate budget,
//! checkpoints progress, retries failures once, and re-verifies stored content.
//! It also provides the single-writer store lock, Ctrl-C cancellation, and the
//! package status state machine.

pub mod concurrency;
pub mod engine;
pub mod lifecycle;
pub mod plan;

pub use concurrency::{install_signal_handler, shutdown_requested, StoreLock};
pub use engine::{Engine, FailingPackage, StopReason, SyncOptions, SyncReport};
pub use lifecycle::validate_transition;
pub use plan::{Planner, SyncPlan};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("schema error: {0}")]
    Schema(#[from] elmirror_schema::SchemaError),
    #[error("store error: {0}")]
    Store(#[from] elmirror_store::StoreError),
    #[error("remote error: {0}")]
    Remote(#[from] elmirror_remote::RemoteError),
    #[error("upstream protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("mirror at {0} is locked by another process")]
    Locked(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
