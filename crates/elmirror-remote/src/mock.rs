use crate::{RateBudget, RemoteError, Upstream};
use elmirror_schema::{AllPackages, ContentHash, Endpoint, PackageId};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How an injected failure presents itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// `endpoint.json` answers with a transient HTTP error.
    Network,
    /// `endpoint.json` is missing.
    Missing,
    /// The archive does not match the published hash.
    Corrupt,
}

/// In-memory registry implementing [`Upstream`].
///
/// Releases are kept in publication order; archives and metadata are derived
/// from the identifier so they are stable across instances.
pub struct MockUpstream {
    state: Mutex<MockState>,
    budget: Option<(Arc<RateBudget>, Option<Instant>)>,
    latency: Duration,
}

#[derive(Default)]
struct MockState {
    releases: Vec<PackageId>,
    failures: HashMap<PackageId, (MockFailure, Option<u32>)>,
    aliases: HashSet<PackageId>,
    requests: u64,
    archive_fetches: u64,
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            budget: None,
            latency: Duration::ZERO,
        }
    }
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that has published `ids`, oldest first.
    pub fn with_releases<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mock = Self::new();
        for id in ids {
            mock.publish(id.as_ref());
        }
        mock
    }

    /// Draw every request from `budget`, giving up at `deadline`.
    #[must_use]
    pub fn with_budget(mut self, budget: Arc<RateBudget>, deadline: Option<Instant>) -> Self {
        self.budget = Some((budget, deadline));
        self
    }

    /// Sleep this long inside every request.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Append a newly published release.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a valid identifier.
    pub fn publish(&self, id: &str) {
        let id: PackageId = id.parse().expect("valid package id");
        self.lock().releases.push(id);
    }

    /// Drop the newest `n` releases, as a registry violating append-only would.
    pub fn retract(&self, n: usize) {
        let mut state = self.lock();
        let keep = state.releases.len().saturating_sub(n);
        state.releases.truncate(keep);
    }

    /// Inject `failure` for `id`; `times: None` fails on every attempt.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a valid identifier.
    pub fn fail(&self, id: &str, failure: MockFailure, times: Option<u32>) {
        let id: PackageId = id.parse().expect("valid package id");
        self.lock().failures.insert(id, (failure, times));
    }

    /// List `id` in `all-packages` without it appearing in `since`, the way
    /// renamed packages show up twice upstream.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a valid identifier.
    pub fn alias(&self, id: &str) {
        let id: PackageId = id.parse().expect("valid package id");
        self.lock().aliases.insert(id);
    }

    pub fn requests(&self) -> u64 {
        self.lock().requests
    }

    pub fn archive_fetches(&self) -> u64 {
        self.lock().archive_fetches
    }

    /// The archive this registry serves for `id`.
    pub fn archive_bytes(id: &PackageId) -> Vec<u8> {
        format!("PK mock archive of {id}").into_bytes()
    }

    pub fn metadata_bytes(id: &PackageId) -> Vec<u8> {
        format!(
            r#"{{"type":"package","name":"{}","version":"{}"}}"#,
            id.package_name(),
            id.version()
        )
        .into_bytes()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn charge(&self) -> Result<(), RemoteError> {
        if let Some((budget, deadline)) = &self.budget {
            budget.acquire(*deadline)?;
        }
        self.lock().requests += 1;
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        Ok(())
    }

    fn known(&self, id: &PackageId) -> Result<(), RemoteError> {
        if self.lock().releases.contains(id) {
            Ok(())
        } else {
            Err(RemoteError::NotFound(id.to_string()))
        }
    }

    /// Consume one injected failure for `id` if any applies to `stage`.
    fn take_failure(&self, id: &PackageId, stage: MockFailure) -> bool {
        let mut state = self.lock();
        let Some((failure, times)) = state.failures.get_mut(id) else {
            return false;
        };
        if *failure != stage {
            return false;
        }
        match times {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}

impl Upstream for MockUpstream {
    fn since(&self, anchor: u64) -> Result<Vec<PackageId>, RemoteError> {
        self.charge()?;
        let state = self.lock();
        let start = usize::try_from(anchor).unwrap_or(usize::MAX);
        if start >= state.releases.len() {
            return Ok(Vec::new());
        }
        Ok(state.releases[start..].iter().rev().cloned().collect())
    }

    fn all_packages(&self) -> Result<AllPackages, RemoteError> {
        self.charge()?;
        let state = self.lock();
        let mut index = AllPackages::new();
        for id in state.releases.iter().chain(state.aliases.iter()) {
            index
                .entry(id.package_name().into_inner())
                .or_default()
                .push(id.version().to_string());
        }
        Ok(index)
    }

    fn endpoint(&self, id: &PackageId) -> Result<Endpoint, RemoteError> {
        self.charge()?;
        self.known(id)?;
        if self.take_failure(id, MockFailure::Network) {
            return Err(RemoteError::Http(format!("HTTP 503 for {id}/endpoint.json")));
        }
        if self.take_failure(id, MockFailure::Missing) {
            return Err(RemoteError::NotFound(format!("{id}/endpoint.json")));
        }
        Ok(Endpoint {
            url: format!("mock://{id}"),
            hash: ContentHash::new(hex::encode(Sha1::digest(Self::archive_bytes(id)))),
        })
    }

    fn metadata(&self, id: &PackageId) -> Result<Vec<u8>, RemoteError> {
        self.charge()?;
        self.known(id)?;
        Ok(Self::metadata_bytes(id))
    }

    fn archive(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        self.charge()?;
        let id: PackageId = url
            .strip_prefix("mock://")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RemoteError::NotFound(url.to_owned()))?;
        self.known(&id)?;
        self.lock().archive_fetches += 1;
        let mut bytes = Self::archive_bytes(&id);
        if self.take_failure(&id, MockFailure::Corrupt) {
            bytes.extend_from_slice(b" (corrupted in transit)");
        }
        Ok(bytes)
    }
}
