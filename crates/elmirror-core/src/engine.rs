use crate::concurrency::StoreLock;
use crate::lifecycle::validate_transition;
use crate::plan::Planner;
use crate::CoreError;
use elmirror_remote::{RemoteError, Upstream};
use elmirror_schema::{filter, PackageId, SelectionFilter};
use elmirror_store::{
    verify_mirror, ErrorKind, IndexStore, IntegrityReport, MirrorLayout, PackageError,
    PackageFiles, PackageStatus, PackageStore, Published, RegistryState, RegistryStore,
    StatusCounts, StoreError,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub filter: Option<SelectionFilter>,
    /// Parallel fetch workers.
    pub workers: usize,
    /// Checkpoint after this many package outcomes.
    pub checkpoint_every: usize,
    pub deadline: Option<Instant>,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            filter: None,
            workers: 4,
            checkpoint_every: 10,
            deadline: None,
            cancel: None,
        }
    }
}

impl SyncOptions {
    fn should_stop(&self) -> Option<StopReason> {
        if self
            .cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::SeqCst))
        {
            return Some(StopReason::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(StopReason::Deadline);
        }
        None
    }
}

/// Why a run ended before every candidate was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BudgetExhausted,
    Deadline,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::BudgetExhausted => write!(f, "request budget exhausted"),
            StopReason::Deadline => write!(f, "deadline reached"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailingPackage {
    pub id: PackageId,
    pub error: Option<PackageError>,
}

/// Summary of one [`Engine::sync`] run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub known_total: u64,
    pub discovered: usize,
    pub newly_ignored: usize,
    /// Fetch attempts made, retries included.
    pub attempted: usize,
    pub written: usize,
    pub already_present: usize,
    pub retried: usize,
    pub counts: StatusCounts,
    pub failing: Vec<FailingPackage>,
    pub stopped_early: Option<StopReason>,
}

/// Result of fetching one candidate, as seen by the coordinator.
enum Attempt {
    Stored(Published),
    Failed(PackageError),
    /// Not attempted to completion; status stays as it was.
    Deferred(StopReason),
    Fatal(StoreError),
}

enum Event {
    Outcome(PackageId, Attempt),
    Stopped(StopReason),
}

#[derive(Default)]
struct PassOutcome {
    failed: Vec<PackageId>,
    stopped: Option<StopReason>,
    fatal: Option<CoreError>,
}

/// Sync & integrity engine over one mirror root.
///
/// Holds the writer lock for its whole lifetime. All registry mutations go
/// through the engine's in-memory state and reach disk only via full
/// checkpoints.
pub struct Engine {
    layout: MirrorLayout,
    registry: RegistryStore,
    packages: PackageStore,
    index: IndexStore,
    state: RegistryState,
    _lock: StoreLock,
}

impl Engine {
    /// Open the mirror at `root` for writing, creating it if needed.
    ///
    /// Fails with `CoreError::Locked` if another process holds the mirror.
    /// Leftovers of interrupted publishes are removed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let layout = MirrorLayout::new(root);
        let lock = StoreLock::try_acquire(&layout.lock_file())?
            .ok_or_else(|| CoreError::Locked(layout.root().to_path_buf()))?;

        layout.initialize()?;
        let removed = layout.clean_staging()?;
        if removed > 0 {
            info!("removed {removed} interrupted publishes from staging");
        }

        let registry = RegistryStore::new(layout.clone());
        let state = registry.load()?;
        debug!(
            "opened mirror at {} ({} records)",
            layout.root().display(),
            state.len()
        );

        Ok(Self {
            packages: PackageStore::new(layout.clone()),
            index: IndexStore::new(layout.clone()),
            registry,
            state,
            layout,
            _lock: lock,
        })
    }

    pub fn layout(&self) -> &MirrorLayout {
        &self.layout
    }

    pub fn state(&self) -> &RegistryState {
        &self.state
    }

    /// Identifiers published after `anchor`, newest first, every status.
    pub fn since(&self, anchor: u64) -> Vec<&PackageId> {
        self.state.since(anchor)
    }

    pub fn locate(&self, id: &PackageId) -> Result<PackageFiles, CoreError> {
        Ok(self.packages.locate(&self.state, id)?)
    }

    /// Re-check every `success` record's content. Never mutates anything.
    pub fn verify(&self) -> IntegrityReport {
        verify_mirror(&self.layout, &self.state)
    }

    /// Bring the mirror up to date with `upstream`.
    ///
    /// Plans and checkpoints, attempts every candidate, retries this run's
    /// failures once, and checkpoints the end state. Per-package problems
    /// become `failed` records; only protocol violations and storage errors
    /// abort the run, always leaving the last checkpoint intact.
    pub fn sync(
        &mut self,
        upstream: &dyn Upstream,
        options: &SyncOptions,
    ) -> Result<SyncReport, CoreError> {
        let mut report = SyncReport::default();

        let mut planned = self.state.clone();
        let plan = match Planner::new(upstream).plan(&mut planned, options.filter.as_ref()) {
            Ok(plan) => plan,
            Err(CoreError::Remote(RemoteError::BudgetExhausted)) => {
                warn!("request budget exhausted while planning");
                report.stopped_early = Some(StopReason::BudgetExhausted);
                self.summarize(&mut report);
                return Ok(report);
            }
            Err(e) => return Err(e),
        };
        self.registry.checkpoint(&planned)?;
        self.index.save(&plan.index)?;
        self.state = planned;

        report.discovered = plan.discovered;
        report.newly_ignored = plan.ignored;
        info!(
            "{} new releases ({} ignored), {} candidates",
            plan.discovered,
            plan.ignored,
            plan.candidates.len()
        );

        let first = self.attempt_pass(upstream, plan.candidates, options, &mut report);
        if let Some(e) = first.fatal {
            return Err(e);
        }
        report.stopped_early = first.stopped;

        if report.stopped_early.is_none() && !first.failed.is_empty() {
            info!("retrying {} failed packages", first.failed.len());
            report.retried = first.failed.len();
            let retry = self.attempt_pass(upstream, first.failed, options, &mut report);
            if let Some(e) = retry.fatal {
                return Err(e);
            }
            report.stopped_early = retry.stopped;
        }

        self.registry.checkpoint(&self.state)?;
        self.summarize(&mut report);
        if let Some(reason) = report.stopped_early {
            warn!("sync stopped early: {reason}");
        }
        info!(
            "sync done: {} success, {} failed, {} pending, {} ignored",
            report.counts.success, report.counts.failed, report.counts.pending, report.counts.ignored
        );
        Ok(report)
    }

    /// Move `ignored` records the filter now accepts back to `pending`.
    ///
    /// Separate from [`sync`](Self::sync) so widening a filter never changes
    /// what an ordinary run does. Returns the reconciled identifiers.
    pub fn reconcile(
        &mut self,
        selection: Option<&SelectionFilter>,
    ) -> Result<Vec<PackageId>, CoreError> {
        let widened: Vec<PackageId> = self
            .state
            .with_status(PackageStatus::Ignored)
            .filter(|r| filter::accepts(selection, &r.id))
            .map(|r| r.id.clone())
            .collect();
        if widened.is_empty() {
            return Ok(widened);
        }

        let mut next = self.state.clone();
        for id in &widened {
            validate_transition(PackageStatus::Ignored, PackageStatus::Pending)?;
            next.set_status(id, PackageStatus::Pending, None)?;
        }
        self.registry.checkpoint(&next)?;
        self.state = next;
        info!("reconciled {} ignored releases to pending", widened.len());
        Ok(widened)
    }

    fn summarize(&self, report: &mut SyncReport) {
        report.known_total = self.state.known_total();
        report.counts = self.state.counts();
        report.failing = self
            .state
            .failing()
            .into_iter()
            .map(|r| FailingPackage {
                id: r.id.clone(),
                error: r.error.clone(),
            })
            .collect();
    }

    /// Fetch `candidates` with a bounded worker pool.
    ///
    /// Workers only fetch and publish; every status change is applied here on
    /// the calling thread, which also checkpoints every `checkpoint_every`
    /// outcomes.
    fn attempt_pass(
        &mut self,
        upstream: &dyn Upstream,
        candidates: Vec<PackageId>,
        options: &SyncOptions,
        report: &mut SyncReport,
    ) -> PassOutcome {
        let mut outcome = PassOutcome::default();
        if candidates.is_empty() {
            return outcome;
        }

        let workers = options.workers.clamp(1, candidates.len());
        let every = options.checkpoint_every.max(1);
        let queue = Mutex::new(VecDeque::from(candidates));
        let halt = AtomicBool::new(false);
        let packages = &self.packages;
        let registry = &self.registry;
        let state = &mut self.state;

        std::thread::scope(|s| {
            let (tx, rx) = mpsc::channel::<Event>();

            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let halt = &halt;
                s.spawn(move || loop {
                    if halt.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Some(reason) = options.should_stop() {
                        let _ = tx.send(Event::Stopped(reason));
                        break;
                    }
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(id) = next else { break };

                    let attempt = fetch_one(upstream, packages, &id);
                    if matches!(attempt, Attempt::Deferred(_) | Attempt::Fatal(_)) {
                        halt.store(true, Ordering::SeqCst);
                    }
                    if tx.send(Event::Outcome(id, attempt)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            let mut since_checkpoint = 0;
            for event in rx {
                let (id, attempt) = match event {
                    Event::Outcome(id, attempt) => (id, attempt),
                    Event::Stopped(reason) => {
                        outcome.stopped.get_or_insert(reason);
                        continue;
                    }
                };
                let applied = match attempt {
                    Attempt::Deferred(reason) => {
                        outcome.stopped.get_or_insert(reason);
                        halt.store(true, Ordering::SeqCst);
                        continue;
                    }
                    Attempt::Fatal(e) => {
                        outcome.fatal.get_or_insert(CoreError::Store(e));
                        halt.store(true, Ordering::SeqCst);
                        continue;
                    }
                    Attempt::Stored(published) => {
                        report.attempted += 1;
                        match published {
                            Published::Written => report.written += 1,
                            Published::AlreadyPresent => report.already_present += 1,
                        }
                        apply(state, &id, PackageStatus::Success, None)
                    }
                    Attempt::Failed(error) => {
                        report.attempted += 1;
                        warn!("{id}: {error}");
                        outcome.failed.push(id.clone());
                        apply(state, &id, PackageStatus::Failed, Some(error))
                    }
                };
                if let Err(e) = applied {
                    outcome.fatal.get_or_insert(e);
                    halt.store(true, Ordering::SeqCst);
                    continue;
                }

                since_checkpoint += 1;
                if since_checkpoint >= every {
                    since_checkpoint = 0;
                    if let Err(e) = registry.checkpoint(state) {
                        outcome.fatal.get_or_insert(CoreError::Store(e));
                        halt.store(true, Ordering::SeqCst);
                    }
                }
            }
        });

        if outcome.fatal.is_some() {
            // Keep whatever progress can still be recorded.
            if let Err(e) = self.registry.checkpoint(&self.state) {
                warn!("checkpoint after fatal error failed: {e}");
            }
        }
        outcome
    }
}

fn apply(
    state: &mut RegistryState,
    id: &PackageId,
    to: PackageStatus,
    error: Option<PackageError>,
) -> Result<(), CoreError> {
    let from = state
        .status(id)
        .ok_or_else(|| CoreError::Store(StoreError::PackageNotFound(id.to_string())))?;
    validate_transition(from, to)?;
    state.set_status(id, to, error)?;
    Ok(())
}

/// Fetch endpoint, metadata and archive for `id`, then publish.
fn fetch_one(upstream: &dyn Upstream, packages: &PackageStore, id: &PackageId) -> Attempt {
    let fetched = upstream.endpoint(id).and_then(|endpoint| {
        let metadata = upstream.metadata(id)?;
        let archive = upstream.archive(&endpoint.url)?;
        Ok((endpoint, metadata, archive))
    });
    let (endpoint, metadata, archive) = match fetched {
        Ok(parts) => parts,
        Err(e) => return remote_failure(e),
    };

    match packages.publish(id, &metadata, &archive, &endpoint.hash) {
        Ok(published) => {
            debug!("{id}: {published:?}");
            Attempt::Stored(published)
        }
        Err(StoreError::ChecksumMismatch {
            expected, actual, ..
        }) => Attempt::Failed(PackageError::new(
            ErrorKind::ChecksumMismatch,
            format!("expected {expected}, got {actual}"),
        )),
        Err(e) => Attempt::Fatal(e),
    }
}

fn remote_failure(e: RemoteError) -> Attempt {
    let kind = match e {
        RemoteError::BudgetExhausted => return Attempt::Deferred(StopReason::BudgetExhausted),
        RemoteError::NotFound(_) => ErrorKind::MissingContent,
        RemoteError::Malformed { .. } => ErrorKind::MalformedResponse,
        RemoteError::Http(_) | RemoteError::Io(_) | RemoteError::Config(_) => ErrorKind::Network,
    };
    Attempt::Failed(PackageError::new(kind, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use elmirror_remote::{MockFailure, MockUpstream};

    fn id(s: &str) -> PackageId {
        s.parse().unwrap()
    }

    fn test_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        (dir, engine)
    }

    #[test]
    fn sync_fetches_everything() {
        let (_dir, mut engine) = test_engine();
        let upstream = MockUpstream::with_releases(["a/x@1.0.0", "b/y@1.0.0"]);
        let report = engine.sync(&upstream, &SyncOptions::default()).unwrap();

        assert_eq!(report.discovered, 2);
        assert_eq!(report.written, 2);
        assert_eq!(report.counts.success, 2);
        assert!(report.failing.is_empty());
        assert!(engine.verify().is_clean());
        assert!(engine.locate(&id("a/x@1.0.0")).is_ok());
    }

    #[test]
    fn failed_checkpoint_leaves_index_unpublished() {
        let (_dir, mut engine) = test_engine();
        std::fs::create_dir(engine.layout().registry_file()).unwrap();
        let upstream = MockUpstream::with_releases(["a/x@1.0.0"]);

        assert!(engine.sync(&upstream, &SyncOptions::default()).is_err());
        assert!(!engine.layout().all_packages_file().exists());
        assert_eq!(upstream.archive_fetches(), 0);
    }

    #[test]
    fn second_open_is_locked() {
        let (dir, _engine) = test_engine();
        assert!(matches!(
            Engine::open(dir.path()),
            Err(CoreError::Locked(_))
        ));
    }

    #[test]
    fn transient_failure_recovers_on_retry() {
        let (_dir, mut engine) = test_engine();
        let upstream = MockUpstream::with_releases(["a/x@1.0.0"]);
        upstream.fail("a/x@1.0.0", MockFailure::Network, Some(1));
        let report = engine.sync(&upstream, &SyncOptions::default()).unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.counts.success, 1);
    }

    #[test]
    fn persistent_failure_is_recorded_with_kind() {
        let (_dir, mut engine) = test_engine();
        let upstream = MockUpstream::with_releases(["a/x@1.0.0", "b/y@1.0.0"]);
        upstream.fail("a/x@1.0.0", MockFailure::Corrupt, None);
        let report = engine.sync(&upstream, &SyncOptions::default()).unwrap();

        assert_eq!(report.counts.success, 1);
        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.failing.len(), 1);
        assert_eq!(
            report.failing[0].error.as_ref().unwrap().kind,
            ErrorKind::ChecksumMismatch
        );
        assert!(!engine.layout().package_dir(&id("a/x@1.0.0")).exists());
        assert!(matches!(
            engine.locate(&id("a/x@1.0.0")),
            Err(CoreError::Store(StoreError::PackageUnavailable { .. }))
        ));
    }

    #[test]
    fn cancelled_before_start_leaves_candidates_pending() {
        let (_dir, mut engine) = test_engine();
        let upstream = MockUpstream::with_releases(["a/x@1.0.0", "b/y@1.0.0"]);
        let options = SyncOptions {
            cancel: Some(Arc::new(AtomicBool::new(true))),
            ..SyncOptions::default()
        };
        let report = engine.sync(&upstream, &options).unwrap();
        assert_eq!(report.stopped_early, Some(StopReason::Cancelled));
        assert_eq!(report.counts.pending, 2);
        assert_eq!(report.known_total, 2);
        assert_eq!(upstream.archive_fetches(), 0);
    }

    #[test]
    fn reconcile_moves_ignored_to_pending() {
        let (_dir, mut engine) = test_engine();
        let upstream = MockUpstream::with_releases(["a/x@1.0.0", "b/y@1.0.0"]);
        let narrow = SyncOptions {
            filter: Some(SelectionFilter::from_entries(["a/x"]).unwrap()),
            ..SyncOptions::default()
        };
        engine.sync(&upstream, &narrow).unwrap();
        assert_eq!(
            engine.state().status(&id("b/y@1.0.0")),
            Some(PackageStatus::Ignored)
        );

        let wide = SelectionFilter::from_entries(["a/x", "b/y"]).unwrap();
        let moved = engine.reconcile(Some(&wide)).unwrap();
        assert_eq!(moved, vec![id("b/y@1.0.0")]);
        assert_eq!(
            engine.state().status(&id("b/y@1.0.0")),
            Some(PackageStatus::Pending)
        );
        assert!(engine.reconcile(Some(&wide)).unwrap().is_empty());
    }
}
