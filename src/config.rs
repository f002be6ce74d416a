//! Configuration file support for prwatch.
//!
//! Loads settings from `~/.config/prwatch/config.toml` (or platform equivalent).
//! CLI arguments take precedence over config file values.

use crate::credentials::DEFAULT_MAX_TOKEN_ATTEMPTS;
use crate::refresh::{
    DEFAULT_PAGE_SIZE, DEFAULT_REVIEW_WINDOW, FetchOptions, MAX_PAGE_SIZE, SearchScope, dedup_scopes,
};
use crate::schedule::RefreshSchedule;
use log::warn;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One search query per page with reviews inlined.
    #[default]
    Graphql,
    /// Issue search plus per-PR review lookups.
    Rest,
}

/// Configuration loaded from TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Search scopes to query. Default: `["involves"]`.
    pub scopes: Option<Vec<SearchScope>>,

    /// `graphql` (default) or `rest`.
    pub transport: Option<TransportKind>,

    /// Refresh schedule used until one is saved: `off`, milliseconds,
    /// `30s`/`5m`/`1h`, or a cron expression. Default: every 5 minutes.
    pub refresh: Option<String>,

    /// Results per search page, 1 to 100. Default: 50.
    pub page_size: Option<u32>,

    /// How many of your latest reviews to look at per PR. Default: 10.
    pub review_window: Option<u32>,

    /// Token prompts before giving up. Default: 3.
    pub max_token_attempts: Option<u32>,

    /// Disable OS desktop notifications.
    pub no_notifications: Option<bool>,
}

impl Config {
    pub fn fetch_options(&self) -> FetchOptions {
        let mut scopes = dedup_scopes(self.scopes.clone().unwrap_or_default());
        if scopes.is_empty() {
            scopes.push(SearchScope::Involves);
        }
        FetchOptions {
            scopes,
            page_size: self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            review_window: self.review_window.unwrap_or(DEFAULT_REVIEW_WINDOW).max(1),
        }
    }

    /// Falls back to the default when `refresh` does not parse.
    pub fn default_schedule(&self) -> RefreshSchedule {
        match self.refresh.as_deref().map(str::parse::<RefreshSchedule>) {
            Some(Ok(schedule)) => schedule,
            Some(Err(e)) => {
                warn!("Ignoring `refresh` in config: {e}");
                RefreshSchedule::default()
            }
            None => RefreshSchedule::default(),
        }
    }

    pub fn max_token_attempts(&self) -> u32 {
        self.max_token_attempts.unwrap_or(DEFAULT_MAX_TOKEN_ATTEMPTS).max(1)
    }
}

/// Returns the path to the config file.
/// Platform-specific: `~/.config/prwatch/config.toml` on Linux,
/// `%APPDATA%\prwatch\config.toml` on Windows.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("prwatch").join("config.toml"))
}

/// Load configuration from the config file.
/// Returns default config if the file doesn't exist or can't be parsed.
pub fn load_config() -> Config {
    let Some(path) = config_path() else {
        return Config::default();
    };

    if !path.exists() {
        return Config::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to parse config file at {}: {e}", path.display());
                Config::default()
            }
        },
        Err(e) => {
            warn!("Failed to read config file at {}: {e}", path.display());
            Config::default()
        }
    }
}
