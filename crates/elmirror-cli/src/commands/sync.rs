use super::{
    describe, json_pretty, load_filter, spin_fail, spin_ok, spinner, upstream_config,
    EXIT_FAILURE, EXIT_SUCCESS,
};
use elmirror_core::{install_signal_handler, Engine, SyncOptions};
use elmirror_remote::HttpUpstream;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct SyncArgs<'a> {
    pub package_list: Option<&'a Path>,
    pub upstream: Option<&'a str>,
    pub token: Option<&'a str>,
    pub workers: usize,
    pub deadline_secs: Option<u64>,
}

pub fn run(root: &Path, args: &SyncArgs<'_>, json: bool) -> Result<u8, String> {
    let filter = load_filter(args.package_list)?;
    let config = upstream_config(args.upstream, args.token)?;
    let deadline = args
        .deadline_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    debug!(
        "upstream {} ({} requests per {}s)",
        config.url, config.requests_per_window, config.window_secs
    );
    let budget = Arc::new(config.budget());
    let upstream = HttpUpstream::new(config, budget).with_deadline(deadline);

    let options = SyncOptions {
        filter,
        workers: args.workers.max(1),
        deadline,
        cancel: Some(install_signal_handler()),
        ..SyncOptions::default()
    };

    let mut engine = Engine::open(root).map_err(|e| describe(&e))?;
    let pb = (!json).then(|| spinner("syncing with upstream…"));
    let report = engine.sync(&upstream, &options).map_err(|e| {
        if let Some(pb) = &pb {
            spin_fail(pb, "sync failed");
        }
        describe(&e)
    })?;
    if let Some(pb) = &pb {
        match report.stopped_early {
            Some(reason) => spin_ok(pb, &format!("sync stopped early ({reason})")),
            None => spin_ok(pb, "sync complete"),
        }
    }

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        println!(
            "{} known, {} new ({} ignored): {} success, {} pending, {} failed",
            report.known_total,
            report.discovered,
            report.newly_ignored,
            report.counts.success,
            report.counts.pending,
            report.counts.failed
        );
        println!(
            "fetched {} packages ({} already present, {} retried)",
            report.written, report.already_present, report.retried
        );
        for failing in &report.failing {
            match &failing.error {
                Some(err) => println!("  FAIL {}: {err}", failing.id),
                None => println!("  FAIL {}", failing.id),
            }
        }
    }

    if report.failing.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_FAILURE)
    }
}
