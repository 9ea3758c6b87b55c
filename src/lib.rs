//! Garçom POS - offline-first order client for waitstaff
//!
//! Captures orders against open tabs, sends them to the order service when
//! it is reachable and queues them in a local SQLite store when it is not.
//! The sync engine drains the queue when connectivity returns.

use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod auth;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod diagnostics;
pub mod draft;
pub mod error;
pub mod menu;
pub mod models;
pub mod orders;
pub mod queue;
pub mod storage;
pub mod sync;
pub mod tabs;

#[cfg(test)]
pub(crate) mod testing;

use api::{OrderApi, RemoteGateway};
use config::AppConfig;
use connectivity::ConnectivityMonitor;
use db::DbState;
use orders::OrderCapture;
use storage::{CredentialStore, KeyringStore, Session};
use sync::SyncCoordinator;

// ---------------------------------------------------------------------------
// JSON probing helpers
// ---------------------------------------------------------------------------

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// First key holding a number or a numeric string.
pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|key| v.get(*key).and_then(models::parse_amount))
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    return Some(i);
                }
            }
            Some(serde_json::Value::String(s)) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Structured logging to the console and a daily rolling file in
/// `{data_dir}/logs`. Keep the returned guard alive until exit; dropping it
/// flushes the file writer.
pub fn init_logging(data_dir: &Path, json_console: bool) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,garcom_pos_lib=debug"));

    let log_dir = diagnostics::get_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir).ok();
    diagnostics::prune_old_logs(&log_dir);

    let file_appender = tracing_appender::rolling::daily(&log_dir, "pos");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_text = (!json_console)
        .then(|| fmt::layer().with_target(true).with_writer(std::io::stderr));
    let console_json = json_console.then(|| fmt::layer().json().with_writer(std::io::stderr));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_text)
        .with(console_json)
        .with(file_layer)
        .init();

    guard
}

// ---------------------------------------------------------------------------
// Application wiring
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Store(#[from] error::StoreError),

    #[error(transparent)]
    Gateway(#[from] error::GatewayError),
}

/// Everything one client session needs, wired together once at startup.
pub struct AppContext {
    pub config: AppConfig,
    pub db: Arc<DbState>,
    pub session: Arc<Session>,
    pub gateway: Arc<RemoteGateway>,
    pub connectivity: ConnectivityMonitor,
    pub sync: Arc<SyncCoordinator>,
}

impl AppContext {
    /// Open the store, restore the session from the OS keyring and probe the
    /// order service once so the online flag starts out accurate.
    pub async fn bootstrap(config: AppConfig) -> Result<Self, BootstrapError> {
        let store: Arc<dyn CredentialStore> = Arc::new(KeyringStore);
        Self::bootstrap_with(config, store).await
    }

    pub async fn bootstrap_with(
        config: AppConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, BootstrapError> {
        let build = diagnostics::build_info();
        info!(
            "Starting Garçom POS v{} ({} built {})",
            build.version, build.git_sha, build.built_at
        );

        let db = Arc::new(db::init(&config.data_dir)?);
        let session = Arc::new(Session::load(credentials));
        let gateway = Arc::new(RemoteGateway::new(
            &config.api_base_url,
            config.http_timeout,
            session.clone(),
        )?);

        let connectivity = ConnectivityMonitor::new(false);
        connectivity.probe(&gateway).await;
        info!(
            api = %gateway.base_url(),
            online = connectivity.is_online(),
            signed_in = session.is_authenticated(),
            "Client ready"
        );

        let api: Arc<dyn OrderApi> = gateway.clone();
        let sync = Arc::new(SyncCoordinator::new(
            db.clone(),
            api,
            connectivity.clone(),
            config.max_retries,
        ));

        Ok(Self {
            config,
            db,
            session,
            gateway,
            connectivity,
            sync,
        })
    }

    pub fn api(&self) -> Arc<dyn OrderApi> {
        self.gateway.clone()
    }

    pub fn order_capture(&self) -> OrderCapture {
        OrderCapture::new(
            self.db.clone(),
            self.api(),
            self.connectivity.clone(),
            self.session.clone(),
        )
    }
}
