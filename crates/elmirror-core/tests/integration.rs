#![allow(unsafe_code)]

use elmirror_core::{CoreError, Engine, StopReason, SyncOptions};
use elmirror_remote::{MockFailure, MockUpstream, RateBudget};
use elmirror_schema::{PackageId, SelectionFilter};
use elmirror_store::{
    ErrorKind, IntegrityProblem, MirrorLayout, PackageStatus, RegistryStore, StoreError,
};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Skip test if running as root; root bypasses filesystem permission checks,
/// so read-only directory tests are meaningless in containers running as uid 0.
fn skip_if_root() -> bool {
    #[allow(unsafe_code)]
    unsafe {
        libc::getuid() == 0
    }
}

fn id(s: &str) -> PackageId {
    s.parse().unwrap()
}

fn ids(engine: &Engine) -> Vec<String> {
    engine
        .state()
        .records()
        .iter()
        .map(|r| r.id.to_string())
        .collect()
}

/// Every file under `packages/`, relative path → bytes.
fn content_snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap().flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(base, &path, out);
            } else {
                let rel = path.strip_prefix(base).unwrap().to_string_lossy().into_owned();
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, &root.join("packages"), &mut out);
    out
}

#[test]
fn second_sync_is_a_noop() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0", "b/y@1.0.0", "a/x@2.0.0"]);

    engine.sync(&upstream, &SyncOptions::default()).unwrap();
    let first = engine.state().clone();
    let fetches = upstream.archive_fetches();

    let report = engine.sync(&upstream, &SyncOptions::default()).unwrap();
    assert_eq!(engine.state(), &first);
    assert_eq!(upstream.archive_fetches(), fetches);
    assert_eq!(report.discovered, 0);
    assert_eq!(report.attempted, 0);
}

#[test]
fn state_survives_reopen() {
    let mirror = tempfile::tempdir().unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0", "b/y@1.0.0"]);
    let before = {
        let mut engine = Engine::open(mirror.path()).unwrap();
        engine.sync(&upstream, &SyncOptions::default()).unwrap();
        engine.state().clone()
    };
    let engine = Engine::open(mirror.path()).unwrap();
    assert_eq!(engine.state(), &before);
}

#[test]
fn decreasing_total_is_a_protocol_violation() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0", "a/x@2.0.0", "a/x@3.0.0"]);
    engine.sync(&upstream, &SyncOptions::default()).unwrap();

    upstream.retract(2);
    let err = engine.sync(&upstream, &SyncOptions::default()).unwrap_err();
    assert!(matches!(err, CoreError::ProtocolViolation(_)));

    // Neither memory nor disk were truncated.
    assert_eq!(engine.state().known_total(), 3);
    let on_disk = RegistryStore::new(MirrorLayout::new(mirror.path()))
        .load()
        .unwrap();
    assert_eq!(on_disk.known_total(), 3);
}

#[test]
fn known_total_never_decreases_across_runs() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0"]);
    let mut last = 0;
    for i in 1..5 {
        upstream.publish(&format!("a/x@1.{i}.0"));
        let report = engine.sync(&upstream, &SyncOptions::default()).unwrap();
        assert!(report.known_total >= last);
        last = report.known_total;
    }
    assert_eq!(last, 5);
}

#[test]
fn filter_ignores_rejected_packages() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0", "a/x@2.0.0", "b/y@1.0.0"]);
    let options = SyncOptions {
        filter: Some(SelectionFilter::from_entries(["a/x"]).unwrap()),
        ..SyncOptions::default()
    };

    let report = engine.sync(&upstream, &options).unwrap();
    let state = engine.state();
    assert_eq!(state.status(&id("a/x@1.0.0")), Some(PackageStatus::Success));
    assert_eq!(state.status(&id("a/x@2.0.0")), Some(PackageStatus::Success));
    assert_eq!(state.status(&id("b/y@1.0.0")), Some(PackageStatus::Ignored));
    assert_eq!(state.known_total(), 3);
    assert_eq!(report.newly_ignored, 1);
    assert!(!engine.layout().package_dir(&id("b/y@1.0.0")).exists());
}

#[test]
fn narrowed_filter_leaves_existing_records_alone() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0", "b/y@1.0.0"]);
    upstream.fail("b/y@1.0.0", MockFailure::Network, None);
    engine.sync(&upstream, &SyncOptions::default()).unwrap();
    assert_eq!(
        engine.state().status(&id("b/y@1.0.0")),
        Some(PackageStatus::Failed)
    );

    let narrow = SyncOptions {
        filter: Some(SelectionFilter::from_entries(["a/x"]).unwrap()),
        ..SyncOptions::default()
    };
    let report = engine.sync(&upstream, &narrow).unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(
        engine.state().status(&id("b/y@1.0.0")),
        Some(PackageStatus::Failed)
    );
}

#[test]
fn incremental_matches_full_sync() {
    let releases: Vec<String> = (0..20).map(|i| format!("p{}/lib@1.0.{i}", i % 3)).collect();

    let full_dir = tempfile::tempdir().unwrap();
    let mut full = Engine::open(full_dir.path()).unwrap();
    full.sync(
        &MockUpstream::with_releases(&releases),
        &SyncOptions::default(),
    )
    .unwrap();
    assert!(full.verify().is_clean());

    let inc_dir = tempfile::tempdir().unwrap();
    let mut inc = Engine::open(inc_dir.path()).unwrap();
    let upstream = MockUpstream::with_releases(&releases[..10]);
    inc.sync(&upstream, &SyncOptions::default()).unwrap();
    for r in &releases[10..] {
        upstream.publish(r);
    }
    inc.sync(&upstream, &SyncOptions::default()).unwrap();
    assert!(inc.verify().is_clean());

    assert_eq!(full.state(), inc.state());
    assert_eq!(
        content_snapshot(full_dir.path()),
        content_snapshot(inc_dir.path())
    );
}

#[test]
fn since_answers_newest_first() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/a@1.0.0"]);
    engine.sync(&upstream, &SyncOptions::default()).unwrap();

    upstream.publish("b/b@1.0.0");
    upstream.publish("c/c@1.0.0");
    engine.sync(&upstream, &SyncOptions::default()).unwrap();

    assert_eq!(ids(&engine), vec!["a/a@1.0.0", "b/b@1.0.0", "c/c@1.0.0"]);
    let since: Vec<String> = engine.since(1).iter().map(ToString::to_string).collect();
    assert_eq!(since, vec!["c/c@1.0.0", "b/b@1.0.0"]);
}

#[test]
fn since_includes_every_status() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0", "b/y@1.0.0", "c/z@1.0.0"]);
    upstream.fail("c/z@1.0.0", MockFailure::Missing, None);
    let options = SyncOptions {
        filter: Some(SelectionFilter::from_entries(["a/x", "c/z"]).unwrap()),
        ..SyncOptions::default()
    };
    engine.sync(&upstream, &options).unwrap();
    assert_eq!(engine.since(0).len(), 3);
}

#[test]
fn verifier_distinguishes_deleted_from_corrupted() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0", "b/y@1.0.0", "c/z@1.0.0"]);
    engine.sync(&upstream, &SyncOptions::default()).unwrap();

    let layout = engine.layout().clone();
    fs::remove_file(layout.archive_file(&id("a/x@1.0.0"))).unwrap();
    fs::write(layout.archive_file(&id("b/y@1.0.0")), b"bit rot").unwrap();

    let before = engine.state().clone();
    let report = engine.verify();
    assert_eq!(report.checked, 3);
    assert_eq!(report.passed, 1);
    let problems: BTreeMap<String, IntegrityProblem> = report
        .failed
        .into_iter()
        .map(|f| (f.id.to_string(), f.problem))
        .collect();
    assert_eq!(problems["a/x@1.0.0"], IntegrityProblem::MissingArchive);
    assert!(matches!(
        problems["b/y@1.0.0"],
        IntegrityProblem::HashMismatch { .. }
    ));
    assert_eq!(engine.state(), &before, "verify must not mutate state");
}

#[test]
fn checksum_mismatch_is_failed_and_nothing_written() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0"]);
    upstream.fail("a/x@1.0.0", MockFailure::Corrupt, None);

    let report = engine.sync(&upstream, &SyncOptions::default()).unwrap();
    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.retried, 1);
    let record = engine.state().get(&id("a/x@1.0.0")).unwrap();
    assert_eq!(
        record.error.as_ref().unwrap().kind,
        ErrorKind::ChecksumMismatch
    );
    assert!(!engine.layout().package_dir(&id("a/x@1.0.0")).exists());
}

#[test]
fn failed_package_does_not_block_others() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream =
        MockUpstream::with_releases((0..10).map(|i| format!("p/lib@1.0.{i}")));
    upstream.fail("p/lib@1.0.3", MockFailure::Missing, None);

    let report = engine.sync(&upstream, &SyncOptions::default()).unwrap();
    assert_eq!(report.counts.success, 9);
    assert_eq!(report.failing.len(), 1);
    assert_eq!(report.failing[0].id, id("p/lib@1.0.3"));
    assert_eq!(
        report.failing[0].error.as_ref().unwrap().kind,
        ErrorKind::MissingContent
    );
}

#[test]
fn failed_packages_are_retried_next_run() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0"]);
    upstream.fail("a/x@1.0.0", MockFailure::Network, Some(2));

    let first = engine.sync(&upstream, &SyncOptions::default()).unwrap();
    assert_eq!(first.counts.failed, 1);
    assert_eq!(
        first.failing[0].error.as_ref().unwrap().kind,
        ErrorKind::Network
    );

    let second = engine.sync(&upstream, &SyncOptions::default()).unwrap();
    assert_eq!(second.counts.success, 1);
    assert!(second.failing.is_empty());
    assert!(engine.state().get(&id("a/x@1.0.0")).unwrap().error.is_none());
}

#[test]
fn budget_exhaustion_stops_gracefully() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    // 2 planning requests + 3 per package: room for exactly two packages.
    let budget = Arc::new(RateBudget::new(8, Duration::from_secs(3600)));
    let upstream = MockUpstream::with_releases((0..6).map(|i| format!("p/lib@1.0.{i}")))
        .with_budget(budget, Some(Instant::now() + Duration::from_secs(60)));
    let options = SyncOptions {
        workers: 1,
        ..SyncOptions::default()
    };

    let report = engine.sync(&upstream, &options).unwrap();
    assert_eq!(report.stopped_early, Some(StopReason::BudgetExhausted));
    assert_eq!(report.known_total, 6);
    assert_eq!(report.counts.success, 2);
    assert_eq!(report.counts.pending, 4);
    assert_eq!(report.counts.failed, 0);

    // The checkpoint reflects the same state.
    let on_disk = RegistryStore::new(MirrorLayout::new(mirror.path()))
        .load()
        .unwrap();
    assert_eq!(&on_disk, engine.state());
}

#[test]
fn budget_exhausted_during_planning_changes_nothing() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let budget = Arc::new(RateBudget::new(1, Duration::from_secs(3600)));
    let upstream = MockUpstream::with_releases(["a/x@1.0.0"])
        .with_budget(budget, Some(Instant::now() + Duration::from_secs(60)));

    let report = engine.sync(&upstream, &SyncOptions::default()).unwrap();
    assert_eq!(report.stopped_early, Some(StopReason::BudgetExhausted));
    assert_eq!(engine.state().known_total(), 0);
}

#[test]
fn deadline_leaves_remaining_candidates_pending() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases((0..50).map(|i| format!("p/lib@1.0.{i}")))
        .with_latency(Duration::from_millis(5));
    let options = SyncOptions {
        workers: 2,
        deadline: Some(Instant::now() + Duration::from_millis(100)),
        ..SyncOptions::default()
    };

    let report = engine.sync(&upstream, &options).unwrap();
    assert_eq!(report.stopped_early, Some(StopReason::Deadline));
    assert_eq!(report.known_total, 50);
    assert!(report.counts.pending > 0);
    assert_eq!(report.counts.success + report.counts.pending, 50);
    assert!(engine.verify().is_clean());
}

#[test]
fn reconcile_then_sync_fetches_widened_packages() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0", "b/y@1.0.0", "b/y@2.0.0"]);
    let narrow = SyncOptions {
        filter: Some(SelectionFilter::from_entries(["a/x"]).unwrap()),
        ..SyncOptions::default()
    };
    engine.sync(&upstream, &narrow).unwrap();
    assert_eq!(engine.state().counts().ignored, 2);

    // Widening alone does not change what sync does.
    let wide_filter = SelectionFilter::from_entries(["a/x", "b/y@2.0.0"]).unwrap();
    let wide = SyncOptions {
        filter: Some(wide_filter.clone()),
        ..SyncOptions::default()
    };
    let report = engine.sync(&upstream, &wide).unwrap();
    assert_eq!(report.attempted, 0);

    let moved = engine.reconcile(Some(&wide_filter)).unwrap();
    assert_eq!(moved, vec![id("b/y@2.0.0")]);
    let report = engine.sync(&upstream, &wide).unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(
        engine.state().status(&id("b/y@2.0.0")),
        Some(PackageStatus::Success)
    );
    assert_eq!(
        engine.state().status(&id("b/y@1.0.0")),
        Some(PackageStatus::Ignored)
    );
    assert_eq!(engine.state().known_total(), 3);
}

#[test]
fn storage_error_aborts_run_and_keeps_checkpoint() {
    if skip_if_root() {
        eprintln!("skipping: running as root");
        return;
    }
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0"]);
    engine.sync(&upstream, &SyncOptions::default()).unwrap();

    upstream.publish("b/y@1.0.0");
    let staging = engine.layout().staging_dir();
    fs::set_permissions(&staging, fs::Permissions::from_mode(0o555)).unwrap();
    let result = engine.sync(&upstream, &SyncOptions::default());
    fs::set_permissions(&staging, fs::Permissions::from_mode(0o755)).unwrap();

    assert!(matches!(
        result,
        Err(CoreError::Store(StoreError::Io(_)))
    ));
    let on_disk = RegistryStore::new(MirrorLayout::new(mirror.path()))
        .load()
        .unwrap();
    assert_eq!(on_disk.known_total(), 2);
    assert_eq!(on_disk.status(&id("a/x@1.0.0")), Some(PackageStatus::Success));
    assert_eq!(on_disk.status(&id("b/y@1.0.0")), Some(PackageStatus::Pending));
}

#[test]
fn concurrent_workers_checkpoint_consistently() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases((0..64).map(|i| format!("p{}/lib@2.0.{i}", i % 8)));
    let options = SyncOptions {
        workers: 8,
        checkpoint_every: 3,
        ..SyncOptions::default()
    };
    let report = engine.sync(&upstream, &options).unwrap();
    assert_eq!(report.counts.success, 64);
    assert_eq!(report.written, 64);

    let on_disk = RegistryStore::new(MirrorLayout::new(mirror.path()))
        .load()
        .unwrap();
    assert_eq!(&on_disk, engine.state());
    assert!(engine.verify().is_clean());
}

#[test]
fn full_index_document_is_refreshed() {
    let mirror = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(mirror.path()).unwrap();
    let upstream = MockUpstream::with_releases(["a/x@1.0.0"]);
    engine.sync(&upstream, &SyncOptions::default()).unwrap();
    upstream.publish("a/x@1.1.0");
    engine.sync(&upstream, &SyncOptions::default()).unwrap();

    let raw = fs::read(engine.layout().all_packages_file()).unwrap();
    let index: BTreeMap<String, Vec<String>> = serde_json::from_slice(&raw).unwrap();
    assert_eq!(index["a/x"], vec!["1.0.0", "1.1.0"]);
}
