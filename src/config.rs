//! Runtime configuration from the environment (and `.env` when present).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::api::normalize_base_url;
use crate::sync::DEFAULT_MAX_RETRIES;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3001/api";
const APP_DIR_NAME: &str = "garcom-pos";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Order service base URL (env: POS_API_BASE_URL)
    pub api_base_url: String,
    /// Local store and logs (env: POS_DATA_DIR)
    pub data_dir: PathBuf,
    /// env: POS_HTTP_TIMEOUT_SECS
    pub http_timeout: Duration,
    /// env: POS_MENU_FRESHNESS_SECS
    pub menu_freshness: Duration,
    /// Automatic send attempts per pending order (env: POS_SYNC_MAX_RETRIES)
    pub max_retries: u32,
    /// env: POS_CONNECTIVITY_PROBE_SECS
    pub probe_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            data_dir: default_data_dir(),
            http_timeout: Duration::from_secs(30),
            menu_freshness: Duration::from_secs(600),
            max_retries: DEFAULT_MAX_RETRIES,
            probe_interval: Duration::from_secs(15),
        }
    }
}

/// Platform data directory for the app, falling back to `./data`.
fn default_data_dir() -> PathBuf {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("APPDATA").map(PathBuf::from))
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("share"))
        });
    match base {
        Some(dir) => dir.join(APP_DIR_NAME),
        None => PathBuf::from("data"),
    }
}

fn parse_positive(name: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ConfigError::InvalidNumber {
            name,
            value: raw.to_string(),
        })
}

impl AppConfig {
    /// Load configuration from environment variables, after reading `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name -> value lookup. Unset or blank values use defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let secs = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match get(name) {
                Some(raw) => parse_positive(name, &raw).map(Duration::from_secs),
                None => Ok(default),
            }
        };

        let max_retries = match get("POS_SYNC_MAX_RETRIES") {
            Some(raw) => u32::try_from(parse_positive("POS_SYNC_MAX_RETRIES", &raw)?).map_err(
                |_| ConfigError::InvalidNumber {
                    name: "POS_SYNC_MAX_RETRIES",
                    value: raw.clone(),
                },
            )?,
            None => defaults.max_retries,
        };

        Ok(Self {
            api_base_url: normalize_base_url(
                &get("POS_API_BASE_URL").unwrap_or(defaults.api_base_url),
            ),
            data_dir: get("POS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            http_timeout: secs("POS_HTTP_TIMEOUT_SECS", defaults.http_timeout)?,
            menu_freshness: secs("POS_MENU_FRESHNESS_SECS", defaults.menu_freshness)?,
            max_retries,
            probe_interval: secs("POS_CONNECTIVITY_PROBE_SECS", defaults.probe_interval)?,
        })
    }
}
