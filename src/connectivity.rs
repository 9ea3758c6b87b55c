//! Online/offline tracking.
//!
//! The current reachability is held in a `watch` channel so any component
//! can read it synchronously and the sync engine can await transitions.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::RemoteGateway;

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the current reachability. Returns true when it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("Network restored");
            } else {
                info!("Network offline; remote calls deferred");
            }
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Probe the order service once and record the result.
    pub async fn probe(&self, gateway: &RemoteGateway) -> bool {
        let online = gateway.probe().await;
        self.set_online(online);
        online
    }

    /// Probe every `interval` until `cancel` fires.
    pub fn spawn_probe_loop(
        &self,
        gateway: Arc<RemoteGateway>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            info!("Connectivity probe started (interval: {}s)", interval.as_secs());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Connectivity probe stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                let online = monitor.probe(&gateway).await;
                debug!(online, "connectivity probe");
            }
        })
    }
}
