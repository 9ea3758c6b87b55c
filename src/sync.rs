//! Background sync engine.
//!
//! A full sync refreshes the open-tab cache and then drains the pending-order
//! queue, oldest first and one record at a time. Only one full sync runs at a
//! time; a second request while one is in flight returns immediately.
//!
//! Delivery is at-least-once: a crash after the service accepted an order
//! but before the local record was deleted leaves the record `sending`, and
//! an operator resend of it may duplicate the order on the service.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{CreateOrderRequest, OrderApi};
use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::error::{GatewayError, RetryError, StoreError};
use crate::models::PendingOrder;
use crate::queue;
use crate::storage::Session;
use crate::tabs::{self, TabRefresh};

/// Automatic send attempts before a record needs an operator.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

const STATUS_CHANNEL_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Reported state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    pub local_id: String,
    pub message: String,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    /// Records read at the start of the pass.
    pub total: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Records left untouched (in flight, or past the retry ceiling).
    pub skipped: usize,
    pub failures: Vec<FailureDetail>,
    /// Set when the pass ended before visiting every record.
    pub stopped: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResults {
    pub open_tabs: Option<TabRefresh>,
    pub orders: Option<DrainReport>,
}

/// Process-wide engine state, sent to every subscriber on each change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStatus {
    pub is_syncing: bool,
    pub last_error: Option<String>,
    pub last_results: Option<SyncResults>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// How a single claimed record fared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "message", rename_all = "snake_case")]
pub enum RecordOutcome {
    Sent,
    Failed(String),
    /// 401 from the service; the session is gone and nothing more can be sent.
    Unauthorized(String),
}

/// Clears the in-flight flag however the sync ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct SyncCoordinator {
    db: Arc<DbState>,
    api: Arc<dyn OrderApi>,
    connectivity: ConnectivityMonitor,
    max_retries: u32,
    is_syncing: AtomicBool,
    status: Mutex<EngineStatus>,
    tx: broadcast::Sender<EngineStatus>,
}

impl SyncCoordinator {
    pub fn new(
        db: Arc<DbState>,
        api: Arc<dyn OrderApi>,
        connectivity: ConnectivityMonitor,
        max_retries: u32,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            db,
            api,
            connectivity,
            max_retries,
            is_syncing: AtomicBool::new(false),
            status: Mutex::new(EngineStatus::default()),
            tx,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Every subscriber receives every status change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineStatus> {
        self.tx.subscribe()
    }

    pub fn status(&self) -> EngineStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    fn publish(&self, update: impl FnOnce(&mut EngineStatus)) -> EngineStatus {
        let snapshot = match self.status.lock() {
            Ok(mut status) => {
                update(&mut status);
                status.updated_at = Some(Utc::now());
                status.clone()
            }
            Err(_) => {
                error!("sync status lock poisoned");
                return EngineStatus::default();
            }
        };
        // No receivers is fine.
        let _ = self.tx.send(snapshot.clone());
        snapshot
    }

    /// Refresh the open-tab cache, then drain the pending-order queue.
    ///
    /// Cancellation is observed between the two steps and between records.
    pub async fn run_full_sync(&self, cancel: &CancellationToken) -> EngineStatus {
        if !self.connectivity.is_online() {
            debug!("sync requested while offline");
            // A run already in flight keeps its own is_syncing flag.
            return self.publish(|s| {
                s.last_error = Some("offline".to_string());
                s.last_results = None;
            });
        }

        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync already in progress, skipping");
            return self.status();
        }
        let _guard = SyncingGuard(&self.is_syncing);

        info!("Full sync started");
        self.publish(|s| {
            s.is_syncing = true;
            s.last_error = None;
        });

        let mut results = SyncResults::default();
        let mut errors: Vec<String> = Vec::new();

        if !cancel.is_cancelled() {
            let refresh =
                tabs::refresh_open_tabs(&self.db, self.api.as_ref(), &self.connectivity).await;
            if let Some(e) = &refresh.error {
                errors.push(format!("open tabs: {e}"));
            }
            results.open_tabs = Some(refresh);
        }

        if !cancel.is_cancelled() {
            match self.drain_pending_orders(cancel).await {
                Ok(report) => {
                    if report.failed > 0 {
                        errors.push(format!("orders: {} failed", report.failed));
                    }
                    if let Some(reason) = &report.stopped {
                        errors.push(format!("orders: {reason}"));
                    }
                    results.orders = Some(report);
                }
                Err(e) => {
                    error!(error = %e, "pending-order drain could not read the queue");
                    errors.push(e.user_message());
                }
            }
        }

        if cancel.is_cancelled() && results.orders.is_none() {
            errors.push("cancelled".to_string());
        }

        let last_error = (!errors.is_empty()).then(|| errors.join("; "));
        match &last_error {
            Some(e) => warn!(error = %e, "Full sync finished with errors"),
            None => info!("Full sync finished"),
        }
        self.publish(|s| {
            s.is_syncing = false;
            s.last_error = last_error;
            s.last_results = Some(results);
        })
    }

    /// One pass over the queue. A per-record failure never aborts the pass;
    /// a 401 does, since nothing after it could be sent either.
    pub async fn drain_pending_orders(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DrainReport, StoreError> {
        let orders = {
            let conn = self.db.lock()?;
            queue::get_all(&conn)?
        };
        let mut report = DrainReport {
            total: orders.len(),
            ..DrainReport::default()
        };
        if orders.is_empty() {
            return Ok(report);
        }
        info!(total = report.total, "Draining pending orders");

        for order in orders {
            if cancel.is_cancelled() {
                report.stopped = Some("cancelled".to_string());
                break;
            }
            if !order.is_drain_eligible(self.max_retries) {
                if order.needs_manual_discard(self.max_retries) {
                    debug!(local_id = %order.local_id, "retry ceiling reached, awaiting operator");
                }
                report.skipped += 1;
                continue;
            }

            let claimed = self.db.lock().and_then(|conn| {
                queue::claim_for_send(&conn, &order.local_id, self.max_retries, false)
            });
            let claimed = match claimed {
                Ok(Some(c)) => c,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(local_id = %order.local_id, error = %e, "could not claim pending order");
                    report.attempted += 1;
                    report.failed += 1;
                    report.failures.push(FailureDetail {
                        local_id: order.local_id.clone(),
                        message: e.user_message(),
                    });
                    continue;
                }
            };

            report.attempted += 1;
            match self.send_claimed(&claimed).await {
                RecordOutcome::Sent => report.succeeded += 1,
                RecordOutcome::Failed(message) => {
                    report.failed += 1;
                    report.failures.push(FailureDetail {
                        local_id: claimed.local_id.clone(),
                        message,
                    });
                }
                RecordOutcome::Unauthorized(message) => {
                    report.failed += 1;
                    report.failures.push(FailureDetail {
                        local_id: claimed.local_id.clone(),
                        message,
                    });
                    report.stopped = Some("session expired".to_string());
                    warn!("Drain stopped: session expired");
                    break;
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Drain pass complete"
        );
        Ok(report)
    }

    /// Send a record already marked `sending` and settle it.
    async fn send_claimed(&self, order: &PendingOrder) -> RecordOutcome {
        let request = CreateOrderRequest::from(order);
        match self.api.create_order(&request).await {
            Ok(_) => {
                let deleted = self
                    .db
                    .lock()
                    .and_then(|conn| queue::delete(&conn, &order.local_id));
                match deleted {
                    Ok(_) => info!(local_id = %order.local_id, tab = %order.tab_number, "pending order synchronized"),
                    // The service has it; leave the record `sending` so no
                    // automatic pass sends it again.
                    Err(e) => error!(
                        local_id = %order.local_id,
                        error = %e,
                        "order accepted remotely but local delete failed"
                    ),
                }
                RecordOutcome::Sent
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    local_id = %order.local_id,
                    attempt = order.retry_count,
                    error = %message,
                    "pending order send failed"
                );
                let recorded = self
                    .db
                    .lock()
                    .and_then(|conn| queue::record_failure(&conn, &order.local_id, &message));
                if let Err(store_err) = recorded {
                    error!(local_id = %order.local_id, error = %store_err, "could not record send failure");
                }
                if e == GatewayError::Unauthorized {
                    RecordOutcome::Unauthorized(message)
                } else {
                    RecordOutcome::Failed(message)
                }
            }
        }
    }

    /// Operator resend of one record, ignoring the retry ceiling.
    ///
    /// Not serialised against a running full sync; if both touch the same
    /// record the later status write wins.
    pub async fn retry_pending_order(&self, local_id: &str) -> Result<RecordOutcome, RetryError> {
        if !self.connectivity.is_online() {
            return Err(RetryError::Offline);
        }
        let claimed = {
            let conn = self.db.lock()?;
            queue::claim_for_send(&conn, local_id, self.max_retries, true)?
        };
        let Some(claimed) = claimed else {
            return Err(RetryError::NotFound(local_id.to_string()));
        };
        info!(local_id, attempt = claimed.retry_count, "manual resend");
        let outcome = self.send_claimed(&claimed).await;
        self.publish(|_| {});
        Ok(outcome)
    }

    /// Startup trigger: sync once if online and signed in.
    pub async fn startup_sync(
        &self,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Option<EngineStatus> {
        if !self.connectivity.is_online() || !session.is_authenticated() {
            debug!("startup sync skipped (offline or signed out)");
            return None;
        }
        Some(self.run_full_sync(cancel).await)
    }

    /// Reconnect trigger: run a full sync on every offline-to-online
    /// transition until `cancel` fires.
    pub fn spawn_reconnect_trigger(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut rx = self.connectivity.subscribe();
        let mut previous_online = *rx.borrow_and_update();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let online = *rx.borrow_and_update();
                if online && !previous_online {
                    info!("Network restored; resuming queued sync");
                    coordinator.run_full_sync(&cancel).await;
                }
                previous_online = online;
            }
            debug!("reconnect trigger stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{PendingOrderLine, SyncStatus};
    use crate::testing::{open_tab, FakeApi};

    fn pending(local_id: &str, created_at_ms: i64) -> PendingOrder {
        PendingOrder {
            local_id: local_id.to_string(),
            created_at_ms,
            user_id: 1,
            tab_number: "42".into(),
            tab_id: Some(1),
            customer_name: None,
            delivery_location: "Mesa 5".into(),
            note: None,
            lines: vec![PendingOrderLine {
                product_id: 7,
                product_name: "Chopp".into(),
                quantity: 2,
                unit_price: 12.5,
                note: None,
            }],
            status: SyncStatus::Pending,
            retry_count: 0,
            last_error: None,
        }
    }

    struct Harness {
        db: Arc<DbState>,
        api: Arc<FakeApi>,
        connectivity: ConnectivityMonitor,
        sync: Arc<SyncCoordinator>,
    }

    fn harness(online: bool, queued: &[PendingOrder]) -> Harness {
        let db = Arc::new(db::open_in_memory().unwrap());
        {
            let conn = db.lock().unwrap();
            for order in queued {
                queue::save(&conn, order).unwrap();
            }
        }
        let api = Arc::new(FakeApi::with_tabs(vec![open_tab(1, "42")]));
        let connectivity = ConnectivityMonitor::new(online);
        let sync = Arc::new(SyncCoordinator::new(
            db.clone(),
            api.clone(),
            connectivity.clone(),
            DEFAULT_MAX_RETRIES,
        ));
        Harness {
            db,
            api,
            connectivity,
            sync,
        }
    }

    fn stored(h: &Harness, local_id: &str) -> Option<PendingOrder> {
        queue::get(&h.db.lock().unwrap(), local_id).unwrap()
    }

    #[tokio::test]
    async fn test_full_sync_sends_and_deletes() {
        let h = harness(true, &[pending("a", 1)]);

        let status = h.sync.run_full_sync(&CancellationToken::new()).await;
        let results = status.last_results.unwrap();
        let orders = results.orders.unwrap();
        assert_eq!(orders.succeeded, 1);
        assert_eq!(orders.failed, 0);
        assert_eq!(results.open_tabs.unwrap().synchronized, 1);
        assert!(!status.is_syncing);
        assert_eq!(status.last_error, None);

        assert!(stored(&h, "a").is_none());
        assert_eq!(h.api.order_calls().len(), 1);
        assert_eq!(h.api.order_calls()[0].tab_identifier, "42");
    }

    #[tokio::test]
    async fn test_server_errors_climb_to_the_ceiling() {
        let h = harness(true, &[pending("a", 1)]);
        h.api.fail_orders(Some(GatewayError::Rejected {
            status: 500,
            message: "Order service error (HTTP 500)".into(),
        }));
        let cancel = CancellationToken::new();

        h.sync.run_full_sync(&cancel).await;
        let after_one = stored(&h, "a").unwrap();
        assert_eq!(after_one.status, SyncStatus::Error);
        assert_eq!(after_one.retry_count, 1);
        assert_eq!(after_one.last_error.as_deref(), Some("Order service error (HTTP 500)"));

        for _ in 0..4 {
            h.sync.run_full_sync(&cancel).await;
        }
        let exhausted = stored(&h, "a").unwrap();
        assert_eq!(exhausted.retry_count, 5);
        assert!(exhausted.needs_manual_discard(DEFAULT_MAX_RETRIES));

        let status = h.sync.run_full_sync(&cancel).await;
        let orders = status.last_results.unwrap().orders.unwrap();
        assert_eq!(orders.attempted, 0);
        assert_eq!(orders.skipped, 1);
        assert_eq!(h.api.order_calls().len(), 5);
        assert_eq!(stored(&h, "a").unwrap().retry_count, 5);
    }

    #[tokio::test]
    async fn test_each_record_sent_once_per_pass_oldest_first() {
        let h = harness(true, &[pending("c", 3), pending("a", 1), pending("b", 2)]);
        h.api.fail_orders(Some(GatewayError::Rejected {
            status: 503,
            message: "busy".into(),
        }));

        let report = h
            .sync
            .drain_pending_orders(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.failed, 3);
        let ids: Vec<&str> = report.failures.iter().map(|f| f.local_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(h.api.order_calls().len(), 3);
        for id in ["a", "b", "c"] {
            assert!(stored(&h, id).is_some(), "{id} must survive a failed send");
        }
    }

    #[tokio::test]
    async fn test_unauthorized_stops_the_pass() {
        let h = harness(true, &[pending("a", 1), pending("b", 2)]);
        h.api.fail_orders(Some(GatewayError::Unauthorized));

        let report = h
            .sync
            .drain_pending_orders(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.attempted, 1);
        assert!(report.stopped.is_some());

        assert_eq!(stored(&h, "a").unwrap().status, SyncStatus::Error);
        let untouched = stored(&h, "b").unwrap();
        assert_eq!(untouched.status, SyncStatus::Pending);
        assert_eq!(untouched.retry_count, 0);
    }

    #[tokio::test]
    async fn test_offline_sync_does_no_work() {
        let h = harness(false, &[pending("a", 1)]);

        let status = h.sync.run_full_sync(&CancellationToken::new()).await;
        assert_eq!(status.last_error.as_deref(), Some("offline"));
        assert_eq!(status.last_results, None);
        assert!(h.api.order_calls().is_empty());
        assert_eq!(stored(&h, "a").unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_offline_guard_keeps_in_flight_flag() {
        let h = harness(false, &[]);
        h.sync.is_syncing.store(true, Ordering::SeqCst);
        h.sync.publish(|s| s.is_syncing = true);

        let status = h.sync.run_full_sync(&CancellationToken::new()).await;
        assert_eq!(status.last_error.as_deref(), Some("offline"));
        assert!(status.is_syncing);
        assert!(h.sync.status().is_syncing);
    }

    #[tokio::test]
    async fn test_unclaimable_record_counts_as_attempted_failure() {
        let h = harness(true, &[pending("a", 1), pending("b", 2)]);
        h.db.lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER lock_a BEFORE UPDATE ON pending_orders
                 WHEN OLD.local_id = 'a'
                 BEGIN SELECT RAISE(ABORT, 'record locked'); END;",
            )
            .unwrap();

        let report = h.sync.drain_pending_orders(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.attempted, report.succeeded + report.failed);
        assert_eq!(report.failures[0].local_id, "a");
        assert_eq!(stored(&h, "a").unwrap().status, SyncStatus::Pending);
        assert!(stored(&h, "b").is_none());
    }

    #[tokio::test]
    async fn test_overlapping_sync_returns_immediately() {
        let h = harness(true, &[pending("a", 1)]);
        h.sync.is_syncing.store(true, Ordering::SeqCst);

        h.sync.run_full_sync(&CancellationToken::new()).await;
        assert!(h.api.order_calls().is_empty());
        assert!(h.sync.is_syncing());
    }

    #[tokio::test]
    async fn test_cancelled_sync_sends_nothing() {
        let h = harness(true, &[pending("a", 1)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let status = h.sync.run_full_sync(&cancel).await;
        assert_eq!(status.last_error.as_deref(), Some("cancelled"));
        assert!(h.api.order_calls().is_empty());
        assert!(!h.sync.is_syncing());
    }

    #[tokio::test]
    async fn test_manual_resend_ignores_ceiling_but_not_offline() {
        let mut stuck = pending("a", 1);
        stuck.status = SyncStatus::Error;
        stuck.retry_count = DEFAULT_MAX_RETRIES;
        let h = harness(true, &[stuck]);

        let outcome = h.sync.retry_pending_order("a").await.unwrap();
        assert_eq!(outcome, RecordOutcome::Sent);
        assert!(stored(&h, "a").is_none());

        assert!(matches!(
            h.sync.retry_pending_order("missing").await,
            Err(RetryError::NotFound(_))
        ));

        h.connectivity.set_online(false);
        assert!(matches!(
            h.sync.retry_pending_order("a").await,
            Err(RetryError::Offline)
        ));
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_updates() {
        let h = harness(true, &[]);
        let mut first = h.sync.subscribe();
        let mut second = h.sync.subscribe();

        h.sync.run_full_sync(&CancellationToken::new()).await;

        assert!(first.recv().await.unwrap().is_syncing);
        assert!(second.recv().await.unwrap().is_syncing);
        assert!(!first.recv().await.unwrap().is_syncing);
        assert!(!second.recv().await.unwrap().is_syncing);
    }

    #[tokio::test]
    async fn test_reconnect_triggers_a_full_sync() {
        let h = harness(false, &[pending("a", 1)]);
        let mut updates = h.sync.subscribe();
        let cancel = CancellationToken::new();
        let handle = h.sync.spawn_reconnect_trigger(cancel.clone());

        h.connectivity.set_online(true);
        loop {
            let status = updates.recv().await.unwrap();
            if !status.is_syncing && status.last_results.is_some() {
                break;
            }
        }
        assert!(stored(&h, "a").is_none());

        cancel.cancel();
        handle.await.unwrap();
    }
}
