use clap::Parser;
use elmirror_core::{CoreError, Engine, SyncOptions};
use elmirror_remote::{HttpUpstream, UpstreamConfig};
use elmirror_schema::SelectionFilter;
use elmirror_server::Mirror;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "elmirror-server",
    about = "Serve an elmirror mirror over the Elm package registry protocol"
)]
struct Cli {
    /// Mirror root directory.
    #[arg(long, default_value = ".")]
    mirror_content: PathBuf,

    /// Public URL of this server, used in generated endpoint.json documents.
    #[arg(long)]
    base_url: String,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Sync from upstream every N seconds in the background.
    #[arg(long)]
    sync_interval: Option<u64>,

    /// JSON list of packages to mirror; all packages when absent.
    #[arg(long)]
    package_list: Option<PathBuf>,

    /// Upstream registry URL (defaults to the saved upstream config).
    #[arg(long)]
    upstream: Option<String>,

    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn upstream_config(cli: &Cli) -> Result<UpstreamConfig, String> {
    let mut config = UpstreamConfig::load_default().map_err(|e| e.to_string())?;
    if let Some(url) = &cli.upstream {
        config.url = url.trim_end_matches('/').to_owned();
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn sync_once(
    root: &Path,
    upstream: &HttpUpstream,
    options: &SyncOptions,
) -> Result<(), CoreError> {
    let mut engine = Engine::open(root)?;
    let report = engine.sync(upstream, options)?;
    info!(
        "background sync: {} new, {} success, {} failed",
        report.discovered, report.counts.success, report.counts.failed
    );
    Ok(())
}

/// Run a sync every `interval`, then make the new checkpoint visible to readers.
fn spawn_sync_loop(
    mirror: Arc<Mirror>,
    upstream: HttpUpstream,
    options: SyncOptions,
    interval: Duration,
) {
    let root = mirror.layout().root().to_path_buf();
    std::thread::spawn(move || loop {
        match sync_once(&root, &upstream, &options) {
            Ok(()) => {}
            Err(CoreError::Locked(path)) => {
                warn!("skipping background sync, {} is locked", path.display());
            }
            Err(CoreError::Remote(e)) if e.is_transient() => {
                warn!("upstream unavailable, retrying next interval: {e}");
            }
            Err(e) => error!("background sync failed: {e}"),
        }
        if let Err(e) = mirror.reload() {
            error!("reload after sync failed: {e}");
        }
        std::thread::sleep(interval);
    });
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mirror = match Mirror::open(&cli.mirror_content, &cli.base_url) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            error!("cannot open mirror at {}: {e}", cli.mirror_content.display());
            return ExitCode::FAILURE;
        }
    };

    if let Some(secs) = cli.sync_interval {
        let filter = match cli.package_list.as_ref().map(SelectionFilter::load).transpose() {
            Ok(f) => f,
            Err(e) => {
                error!("invalid package list: {e}");
                return ExitCode::FAILURE;
            }
        };
        let config = match upstream_config(&cli) {
            Ok(c) => c,
            Err(e) => {
                error!("invalid upstream config: {e}");
                return ExitCode::FAILURE;
            }
        };
        info!("syncing from {} every {secs}s", config.url);
        // Shared by every run.
        let budget = Arc::new(config.budget());
        let options = SyncOptions {
            filter,
            workers: cli.workers,
            ..SyncOptions::default()
        };
        spawn_sync_loop(
            Arc::clone(&mirror),
            HttpUpstream::new(config, budget),
            options,
            Duration::from_secs(secs.max(1)),
        );
    }

    let addr = format!("{}:{}", cli.host, cli.port);
    info!("mirror root: {}", cli.mirror_content.display());
    match elmirror_server::run_server(&mirror, &addr) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
