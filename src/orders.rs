//! Order capture with the online/offline dual write path.
//!
//! Online, the order goes straight to the service. Only a failure with no
//! HTTP response at all (or being offline to begin with) queues it locally;
//! a rejection by the service is returned to the waiter and never queued.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{CreateOrderRequest, OrderApi};
use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::error::SubmitError;
use crate::models::{PendingOrder, PendingOrderLine, RemoteTab, SyncStatus, TabSnapshot, TabStatus};
use crate::queue;
use crate::storage::Session;
use crate::tabs;

/// The tab an order is placed on, as known at submission time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabRef {
    pub number: String,
    pub id: Option<i64>,
    pub customer_name: Option<String>,
    /// `None` when the tab came from the offline cache.
    pub status: Option<TabStatus>,
}

impl TabRef {
    pub fn from_remote(tab: &RemoteTab) -> Self {
        Self {
            number: tab.number.clone(),
            id: Some(tab.id),
            customer_name: tab.customer_name.clone(),
            status: Some(tab.status.clone()),
        }
    }

    pub fn from_snapshot(tab: &TabSnapshot) -> Self {
        Self {
            number: tab.number.clone(),
            id: Some(tab.id),
            customer_name: tab.customer_name.clone(),
            status: None,
        }
    }

    /// A tab known only by its number.
    pub fn by_number(number: &str) -> Self {
        Self {
            number: number.trim().to_string(),
            id: None,
            customer_name: None,
            status: None,
        }
    }
}

/// What to do with an order for a tab whose status is not known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TabStatusPolicy {
    /// Log a warning and let the service decide at send time.
    #[default]
    WarnAndQueue,
    Block,
}

#[derive(Debug, Clone)]
pub struct OrderSubmission {
    pub tab: TabRef,
    pub delivery_location: String,
    pub note: Option<String>,
    pub lines: Vec<PendingOrderLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Sent { response: Value },
    QueuedOffline { local_id: String },
}

impl SubmitOutcome {
    pub fn user_message(&self) -> String {
        match self {
            SubmitOutcome::Sent { .. } => "Order sent".to_string(),
            SubmitOutcome::QueuedOffline { .. } => {
                "Offline: order saved on this device and will be sent when the connection returns"
                    .to_string()
            }
        }
    }
}

/// Look up a tab for ordering. Online the service is asked, so the status is
/// known; offline the cached snapshot is used and the status is unknown.
pub async fn resolve_tab(
    db: &DbState,
    api: &dyn OrderApi,
    connectivity: &ConnectivityMonitor,
    number: &str,
) -> Result<Option<TabRef>, SubmitError> {
    let number = number.trim();
    if connectivity.is_online() {
        match api.fetch_tab_by_number(number).await {
            Ok(found) => return Ok(found.as_ref().map(TabRef::from_remote)),
            Err(e) if e.is_network() => {
                warn!(tab = %number, error = %e, "tab lookup unreachable, using cache");
            }
            Err(e) => return Err(SubmitError::Remote(e)),
        }
    }
    Ok(tabs::lookup_tab(db, number)?
        .as_ref()
        .map(TabRef::from_snapshot))
}

pub struct OrderCapture {
    db: Arc<DbState>,
    api: Arc<dyn OrderApi>,
    connectivity: ConnectivityMonitor,
    session: Arc<Session>,
    policy: TabStatusPolicy,
}

impl OrderCapture {
    pub fn new(
        db: Arc<DbState>,
        api: Arc<dyn OrderApi>,
        connectivity: ConnectivityMonitor,
        session: Arc<Session>,
    ) -> Self {
        Self {
            db,
            api,
            connectivity,
            session,
            policy: TabStatusPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: TabStatusPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn validate(&self, submission: &OrderSubmission) -> Result<(), SubmitError> {
        if submission.tab.number.trim().is_empty() {
            return Err(SubmitError::MissingTab);
        }
        let has_note = submission
            .note
            .as_deref()
            .is_some_and(|n| !n.trim().is_empty());
        if submission.lines.is_empty() && !has_note {
            return Err(SubmitError::EmptyOrder);
        }
        if let Some(line) = submission.lines.iter().find(|l| l.quantity == 0) {
            return Err(SubmitError::InvalidLine(format!(
                "{} has quantity 0",
                line.product_name
            )));
        }

        match &submission.tab.status {
            Some(TabStatus::Open) => Ok(()),
            Some(other) => Err(SubmitError::TabNotOpen {
                number: submission.tab.number.clone(),
                status: other.as_str().to_string(),
            }),
            None => match self.policy {
                TabStatusPolicy::WarnAndQueue => {
                    warn!(
                        tab = %submission.tab.number,
                        "tab status unknown; the service will check it when the order is sent"
                    );
                    Ok(())
                }
                TabStatusPolicy::Block => {
                    Err(SubmitError::TabStatusUnknown(submission.tab.number.clone()))
                }
            },
        }
    }

    /// Send the order, or queue it when the service cannot be reached.
    pub async fn submit_order(
        &self,
        submission: OrderSubmission,
    ) -> Result<SubmitOutcome, SubmitError> {
        self.validate(&submission)?;
        let note = submission
            .note
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        if self.connectivity.is_online() {
            let request = CreateOrderRequest::new(
                &submission.tab.number,
                submission.delivery_location.trim(),
                note.as_deref(),
                &submission.lines,
            );
            match self.api.create_order(&request).await {
                Ok(response) => {
                    info!(tab = %submission.tab.number, lines = submission.lines.len(), "order sent");
                    return Ok(SubmitOutcome::Sent { response });
                }
                Err(e) if e.is_network() => {
                    warn!(tab = %submission.tab.number, error = %e, "order send unreachable, queuing locally");
                }
                Err(e) => {
                    warn!(tab = %submission.tab.number, error = %e, "order rejected by service");
                    return Err(SubmitError::Remote(e));
                }
            }
        }

        let order = PendingOrder {
            local_id: Uuid::new_v4().to_string(),
            created_at_ms: Utc::now().timestamp_millis(),
            user_id: self.session.identity().map(|u| u.id).unwrap_or(0),
            tab_number: submission.tab.number.trim().to_string(),
            tab_id: submission.tab.id,
            customer_name: submission.tab.customer_name,
            delivery_location: submission.delivery_location.trim().to_string(),
            note,
            lines: submission.lines,
            status: SyncStatus::Pending,
            retry_count: 0,
            last_error: None,
        };

        let saved = self.db.lock().and_then(|conn| queue::save(&conn, &order));
        if let Err(e) = saved {
            error!(tab = %order.tab_number, error = %e, "could not queue order locally");
            return Err(SubmitError::Storage(e));
        }
        info!(local_id = %order.local_id, tab = %order.tab_number, "order queued offline");
        Ok(SubmitOutcome::QueuedOffline {
            local_id: order.local_id,
        })
    }
}
