//! Diff planning: what upstream has that the mirror does not.

use crate::CoreError;
use elmirror_remote::{RemoteError, Upstream};
use elmirror_schema::{filter, flatten_index, AllPackages, PackageId, SelectionFilter};
use elmirror_store::{PackageStatus, RegistryState};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Output of [`Planner::plan`].
#[derive(Debug)]
pub struct SyncPlan {
    /// Identifiers to attempt this run, oldest observed first.
    pub candidates: Vec<PackageId>,
    /// Newly observed identifiers, including ignored ones.
    pub discovered: usize,
    /// Newly observed identifiers the filter rejected.
    pub ignored: usize,
    /// The full index as fetched this run.
    pub index: AllPackages,
}

pub struct Planner<'a> {
    upstream: &'a dyn Upstream,
}

impl<'a> Planner<'a> {
    pub fn new(upstream: &'a dyn Upstream) -> Self {
        Self { upstream }
    }

    /// Query upstream and append every newly published identifier to `state`.
    ///
    /// New identifiers are pushed oldest first: `pending` when the filter
    /// accepts them, `ignored` otherwise. Both advance `known_total`. Nothing
    /// is pushed unless the whole upstream answer is consistent, so on error
    /// `state` is untouched.
    pub fn plan(
        &self,
        state: &mut RegistryState,
        selection: Option<&SelectionFilter>,
    ) -> Result<SyncPlan, CoreError> {
        let anchor = state.known_total();

        let index = self.upstream.all_packages().map_err(protocol)?;
        let index_total = flatten_index(&index)
            .map_err(|e| CoreError::ProtocolViolation(format!("full index: {e}")))?
            .len() as u64;
        if index_total < anchor {
            return Err(CoreError::ProtocolViolation(format!(
                "upstream total decreased from {anchor} to {index_total}"
            )));
        }

        // The newest known release must still be the oldest entry of
        // `since(anchor - 1)`; the index count alone can be padded by aliases.
        let mut fresh = match state.records().last() {
            None => self.upstream.since(anchor).map_err(protocol)?,
            Some(newest) => {
                let mut answer = self.upstream.since(anchor - 1).map_err(protocol)?;
                match answer.pop() {
                    Some(id) if id == newest.id => answer,
                    Some(id) => {
                        return Err(CoreError::ProtocolViolation(format!(
                            "upstream lists {id} as release {anchor}, expected {}",
                            newest.id
                        )));
                    }
                    None => {
                        return Err(CoreError::ProtocolViolation(format!(
                            "upstream total decreased below {anchor}; {} is no longer listed",
                            newest.id
                        )));
                    }
                }
            }
        };
        fresh.reverse();

        let mut seen = HashSet::with_capacity(fresh.len());
        for id in &fresh {
            if state.contains(id) {
                return Err(CoreError::ProtocolViolation(format!(
                    "{id} was returned as new but is already known"
                )));
            }
            if !seen.insert(id) {
                return Err(CoreError::ProtocolViolation(format!(
                    "{id} appears twice in one answer"
                )));
            }
        }

        let new_total = anchor + fresh.len() as u64;
        if anchor == 0 {
            info!("full sync: {new_total} releases upstream");
            if index_total != new_total {
                warn!(
                    "full index lists {index_total} releases but the ordered list has {new_total}; using {new_total}"
                );
            }
        } else {
            info!("incremental sync: {} new since {anchor}", fresh.len());
        }

        let discovered = fresh.len();
        let mut ignored = 0;
        for id in fresh {
            let status = if filter::accepts(selection, &id) {
                PackageStatus::Pending
            } else {
                ignored += 1;
                PackageStatus::Ignored
            };
            debug!("observed {id} ({status})");
            state.push(id, status)?;
        }

        let candidates: Vec<PackageId> = state
            .records()
            .iter()
            .filter(|r| matches!(r.status, PackageStatus::Pending | PackageStatus::Failed))
            .filter(|r| filter::accepts(selection, &r.id))
            .map(|r| r.id.clone())
            .collect();

        Ok(SyncPlan {
            candidates,
            discovered,
            ignored,
            index,
        })
    }
}

/// A malformed answer breaks the protocol; anything else is passed through.
fn protocol(e: RemoteError) -> CoreError {
    match e {
        RemoteError::Malformed { url, reason } => {
            CoreError::ProtocolViolation(format!("malformed response from {url}: {reason}"))
        }
        other => CoreError::Remote(other),
    }
}
