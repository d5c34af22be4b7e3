pub mod completions;
pub mod man_pages;
pub mod reconcile;
pub mod since;
pub mod status;
pub mod sync;
pub mod verify;

use elmirror_core::CoreError;
use elmirror_remote::UpstreamConfig;
use elmirror_schema::SelectionFilter;
use elmirror_store::{MirrorLayout, PackageStatus, RegistryState, RegistryStore};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_INTEGRITY_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: PackageStatus) -> String {
    use console::Style;
    let text = status.to_string();
    match status {
        PackageStatus::Success => Style::new().green().apply_to(text).to_string(),
        PackageStatus::Pending => Style::new().yellow().apply_to(text).to_string(),
        PackageStatus::Failed => Style::new().red().bold().apply_to(text).to_string(),
        PackageStatus::Ignored => Style::new().dim().apply_to(text).to_string(),
    }
}

/// Render an engine error with the prefix `main` maps to an exit code.
pub fn describe(err: &CoreError) -> String {
    match err {
        CoreError::ProtocolViolation(_) => format!("protocol violation: {err}"),
        CoreError::Locked(_) => format!("store lock: {err}"),
        CoreError::Io(_) => format!("store error: {err}"),
        _ => err.to_string(),
    }
}

/// Committed registry state, read without taking the writer lock.
pub fn load_state(root: &Path) -> Result<RegistryState, String> {
    RegistryStore::new(MirrorLayout::new(root))
        .load()
        .map_err(|e| e.to_string())
}

pub fn load_filter(path: Option<&Path>) -> Result<Option<SelectionFilter>, String> {
    path.map(|p| {
        SelectionFilter::load(p).map_err(|e| format!("package list {}: {e}", p.display()))
    })
    .transpose()
}

pub fn upstream_config(url: Option<&str>, token: Option<&str>) -> Result<UpstreamConfig, String> {
    let mut config =
        UpstreamConfig::load_default().map_err(|e| format!("upstream config: {e}"))?;
    if let Some(url) = url {
        config.url = url.trim_end_matches('/').to_owned();
    }
    if let Some(token) = token {
        config = config.with_token(token);
    }
    config.validate().map_err(|e| format!("upstream config: {e}"))?;
    Ok(config)
}
