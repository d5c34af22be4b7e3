use crate::{RateBudget, RemoteError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_UPSTREAM: &str = "https://package.elm-lang.org";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    /// Sent as a bearer token to the content origin only.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_requests_per_window() -> u32 {
    3000
}

fn default_window_secs() -> u64 {
    3600
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("elmirror/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM)
    }
}

impl UpstreamConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_owned(),
            auth_token: None,
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    /// Load config from `~/.config/elmirror/upstream.json`, falling back to
    /// defaults when the file does not exist.
    pub fn load_default() -> Result<Self, RemoteError> {
        let path = default_config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, RemoteError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| RemoteError::Config(format!("invalid upstream config: {e}")))?;
        config.url = config.url.trim_end_matches('/').to_owned();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| RemoteError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RemoteError> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(RemoteError::Config(format!(
                "upstream url must be http(s): {}",
                self.url
            )));
        }
        if self.requests_per_window == 0 {
            return Err(RemoteError::Config(
                "requests_per_window must be at least 1".to_owned(),
            ));
        }
        if self.window_secs == 0 {
            return Err(RemoteError::Config(
                "window_secs must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// A fresh budget sized by this config.
    pub fn budget(&self) -> RateBudget {
        RateBudget::new(
            self.requests_per_window,
            Duration::from_secs(self.window_secs),
        )
    }
}

fn default_config_path() -> Result<PathBuf, RemoteError> {
    let home = std::env::var("HOME").map_err(|_| RemoteError::Config("HOME not set".to_owned()))?;
    Ok(PathBuf::from(home).join(".config/elmirror/upstream.json"))
}
