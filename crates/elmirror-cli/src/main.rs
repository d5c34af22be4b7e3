mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_FAILURE, EXIT_INTEGRITY_ERROR, EXIT_STORE_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "elmirror",
    version,
    about = "Crash-safe, rate-limited mirror for the Elm package registry"
)]
struct Cli {
    /// Mirror root directory.
    #[arg(long, default_value = ".", global = true)]
    mirror_content: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bring the mirror up to date with upstream.
    Sync {
        /// JSON list of `author/name` or `author/name@version` entries to mirror.
        #[arg(long)]
        package_list: Option<PathBuf>,
        /// Upstream registry URL (overrides config file).
        #[arg(long)]
        upstream: Option<String>,
        /// Bearer token for archive downloads (overrides config file).
        #[arg(long)]
        token: Option<String>,
        /// Parallel download workers.
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Stop starting new downloads after this many seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Re-check the content of every mirrored package.
    Verify,
    /// Requeue ignored releases that the package list now accepts.
    Reconcile {
        /// Package list to reconcile against; omit to accept everything.
        #[arg(long)]
        package_list: Option<PathBuf>,
    },
    /// Show counts per status and failing releases.
    Status,
    /// Print releases published after the first N, newest first.
    Since {
        /// Number of releases the client already knows.
        #[arg(default_value_t = 0)]
        anchor: u64,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ELMIRROR_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let root = cli.mirror_content.as_path();
    let json_output = cli.json;

    let result = match &cli.command {
        Commands::Sync {
            package_list,
            upstream,
            token,
            workers,
            deadline_secs,
        } => commands::sync::run(
            root,
            &commands::sync::SyncArgs {
                package_list: package_list.as_deref(),
                upstream: upstream.as_deref(),
                token: token.as_deref(),
                workers: *workers,
                deadline_secs: *deadline_secs,
            },
            json_output,
        ),
        Commands::Verify => commands::verify::run(root, json_output),
        Commands::Reconcile { package_list } => {
            commands::reconcile::run(root, package_list.as_deref(), json_output)
        }
        Commands::Status => commands::status::run(root, json_output),
        Commands::Since { anchor } => commands::since::run(root, *anchor, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(*shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("protocol violation:") {
                EXIT_INTEGRITY_ERROR
            } else if msg.starts_with("store error:") || msg.starts_with("store lock:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
