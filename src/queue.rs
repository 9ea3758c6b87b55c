//! Pending-order queue.
//!
//! Rows are keyed by the locally generated `local_id`. Records are removed
//! only after the service confirms them or on an explicit discard.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{truncate_error, StoreError};
use crate::models::{PendingOrder, PendingOrderLine, SyncStatus};

const SELECT_COLUMNS: &str = "SELECT local_id, created_at_ms, user_id, tab_number, tab_id,
        customer_name, delivery_location, note, lines, sync_status, retry_count, last_error
    FROM pending_orders";

/// Raw row before the JSON lines and the status are decoded.
struct RawRow {
    order: PendingOrder,
    lines: String,
    status: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        order: PendingOrder {
            local_id: row.get(0)?,
            created_at_ms: row.get(1)?,
            user_id: row.get(2)?,
            tab_number: row.get(3)?,
            tab_id: row.get(4)?,
            customer_name: row.get(5)?,
            delivery_location: row.get(6)?,
            note: row.get(7)?,
            lines: Vec::new(),
            status: SyncStatus::Pending,
            retry_count: row.get(10)?,
            last_error: row.get(11)?,
        },
        lines: row.get(8)?,
        status: row.get(9)?,
    })
}

fn decode(raw: RawRow) -> Result<PendingOrder, String> {
    let RawRow {
        mut order,
        lines,
        status,
    } = raw;
    order.lines = serde_json::from_str::<Vec<PendingOrderLine>>(&lines)
        .map_err(|e| format!("unreadable lines: {e}"))?;
    order.status = SyncStatus::parse(&status).ok_or_else(|| format!("unknown status {status:?}"))?;
    Ok(order)
}

/// Insert or overwrite one record. An empty `local_id` is refused.
pub fn save(conn: &Connection, order: &PendingOrder) -> Result<(), StoreError> {
    if order.local_id.trim().is_empty() {
        return Err(StoreError::MissingKey {
            collection: "pending_orders",
            field: "local_id",
        });
    }
    conn.execute(
        "INSERT INTO pending_orders (local_id, created_at_ms, user_id, tab_number, tab_id,
            customer_name, delivery_location, note, lines, sync_status, retry_count,
            last_error, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, datetime('now'))
         ON CONFLICT(local_id) DO UPDATE SET
            created_at_ms = excluded.created_at_ms,
            user_id = excluded.user_id,
            tab_number = excluded.tab_number,
            tab_id = excluded.tab_id,
            customer_name = excluded.customer_name,
            delivery_location = excluded.delivery_location,
            note = excluded.note,
            lines = excluded.lines,
            sync_status = excluded.sync_status,
            retry_count = excluded.retry_count,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at",
        params![
            order.local_id,
            order.created_at_ms,
            order.user_id,
            order.tab_number,
            order.tab_id,
            order.customer_name,
            order.delivery_location,
            order.note,
            serde_json::to_string(&order.lines)?,
            order.status.as_str(),
            order.retry_count,
            order.last_error,
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, local_id: &str) -> Result<Option<PendingOrder>, StoreError> {
    let raw = conn
        .query_row(
            &format!("{SELECT_COLUMNS} WHERE local_id = ?1"),
            params![local_id],
            read_row,
        )
        .optional()?;
    match raw.map(decode) {
        None => Ok(None),
        Some(Ok(order)) => Ok(Some(order)),
        Some(Err(reason)) => {
            warn!(local_id, %reason, "pending order is unreadable");
            Ok(None)
        }
    }
}

/// Every readable record, oldest first. Unreadable rows are logged and left
/// in place.
pub fn get_all(conn: &Connection) -> Result<Vec<PendingOrder>, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY created_at_ms, local_id"))?;
    let rows = stmt.query_map([], read_row)?;
    let mut out = Vec::new();
    for row in rows {
        let raw = row?;
        let local_id = raw.order.local_id.clone();
        match decode(raw) {
            Ok(order) => out.push(order),
            Err(reason) => warn!(local_id = %local_id, %reason, "skipping unreadable pending order"),
        }
    }
    Ok(out)
}

pub fn delete(conn: &Connection, local_id: &str) -> Result<bool, StoreError> {
    let n = conn.execute(
        "DELETE FROM pending_orders WHERE local_id = ?1",
        params![local_id],
    )?;
    Ok(n > 0)
}

/// Explicit operator discard. The record is gone for good.
pub fn discard(conn: &Connection, local_id: &str) -> Result<bool, StoreError> {
    let existing = get(conn, local_id)?;
    let removed = delete(conn, local_id)?;
    if removed {
        warn!(
            local_id,
            tab = existing.as_ref().map(|o| o.tab_number.as_str()).unwrap_or("?"),
            retry_count = existing.as_ref().map(|o| o.retry_count).unwrap_or(0),
            "pending order discarded by operator"
        );
    }
    Ok(removed)
}

/// Re-read the record and, if it may be sent, mark it `sending` with the
/// retry counter bumped, in one transaction. `force` bypasses the
/// eligibility rule for a manual resend.
pub fn claim_for_send(
    conn: &Connection,
    local_id: &str,
    max_retries: u32,
    force: bool,
) -> Result<Option<PendingOrder>, StoreError> {
    let tx = conn.unchecked_transaction()?;
    let Some(mut order) = get(&tx, local_id)? else {
        return Ok(None);
    };
    if !force && !order.is_drain_eligible(max_retries) {
        return Ok(None);
    }

    order.status = SyncStatus::Sending;
    order.retry_count = order.retry_count.saturating_add(1);
    tx.execute(
        "UPDATE pending_orders
         SET sync_status = ?2, retry_count = ?3, updated_at = datetime('now')
         WHERE local_id = ?1",
        params![local_id, order.status.as_str(), order.retry_count],
    )?;
    tx.commit()?;
    Ok(Some(order))
}

/// Mark a claimed record `error` with a truncated message.
pub fn record_failure(conn: &Connection, local_id: &str, message: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE pending_orders
         SET sync_status = ?2, last_error = ?3, updated_at = datetime('now')
         WHERE local_id = ?1",
        params![local_id, SyncStatus::Error.as_str(), truncate_error(message)],
    )?;
    Ok(())
}

/// One row of the pending-orders screen.
#[derive(Debug, Clone, Serialize)]
pub struct PendingOrderView {
    #[serde(flatten)]
    pub order: PendingOrder,
    pub total: f64,
    pub needs_manual_discard: bool,
}

fn display_rank(status: SyncStatus) -> u8 {
    match status {
        SyncStatus::Pending => 0,
        SyncStatus::Error => 1,
        SyncStatus::Sending => 2,
        SyncStatus::Synchronized => 3,
    }
}

/// Pending first, then errors, then in-flight; oldest first within each.
pub fn list_for_display(
    conn: &Connection,
    max_retries: u32,
) -> Result<Vec<PendingOrderView>, StoreError> {
    let mut orders = get_all(conn)?;
    orders.sort_by_key(|o| (display_rank(o.status), o.created_at_ms));
    Ok(orders
        .into_iter()
        .map(|order| PendingOrderView {
            total: order.total(),
            needs_manual_discard: order.needs_manual_discard(max_retries),
            order,
        })
        .collect())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub sending: usize,
    pub error: usize,
    /// Errored records past the retry ceiling.
    pub needs_discard: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.sending + self.error
    }
}

pub fn status_counts(conn: &Connection, max_retries: u32) -> Result<StatusCounts, StoreError> {
    let mut counts = StatusCounts::default();
    for order in get_all(conn)? {
        match order.status {
            SyncStatus::Pending => counts.pending += 1,
            SyncStatus::Sending => counts.sending += 1,
            SyncStatus::Error => counts.error += 1,
            SyncStatus::Synchronized => {}
        }
        if order.needs_manual_discard(max_retries) {
            counts.needs_discard += 1;
        }
    }
    debug!(
        pending = counts.pending,
        sending = counts.sending,
        error = counts.error,
        "pending-order counts"
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn order(local_id: &str, created_at_ms: i64) -> PendingOrder {
        PendingOrder {
            local_id: local_id.to_string(),
            created_at_ms,
            user_id: 1,
            tab_number: "42".into(),
            tab_id: None,
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

    #[test]
    fn test_save_requires_local_id() {
        let db = db::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let err = save(&conn, &order("  ", 1)).unwrap_err();
        assert!(matches!(err, StoreError::MissingKey { field: "local_id", .. }));
        assert!(get_all(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_get_all_is_oldest_first() {
        let db = db::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        save(&conn, &order("b", 200)).unwrap();
        save(&conn, &order("a", 100)).unwrap();
        save(&conn, &order("c", 300)).unwrap();

        let ids: Vec<String> = get_all(&conn).unwrap().into_iter().map(|o| o.local_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(get(&conn, "a").unwrap().unwrap(), order("a", 100));
    }

    #[test]
    fn test_claim_marks_sending_and_counts_attempt() {
        let db = db::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        save(&conn, &order("a", 1)).unwrap();

        let claimed = claim_for_send(&conn, "a", 5, false).unwrap().unwrap();
        assert_eq!(claimed.status, SyncStatus::Sending);
        assert_eq!(claimed.retry_count, 1);

        // A record already in flight is not claimed again by a drain.
        assert!(claim_for_send(&conn, "a", 5, false).unwrap().is_none());
        let stored = get(&conn, "a").unwrap().unwrap();
        assert_eq!(stored.status, SyncStatus::Sending);
        assert_eq!(stored.retry_count, 1);
    }

    #[test]
    fn test_ceiling_blocks_drain_but_not_manual_resend() {
        let db = db::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let mut stuck = order("a", 1);
        stuck.status = SyncStatus::Error;
        stuck.retry_count = 5;
        save(&conn, &stuck).unwrap();

        assert!(claim_for_send(&conn, "a", 5, false).unwrap().is_none());
        let forced = claim_for_send(&conn, "a", 5, true).unwrap().unwrap();
        assert_eq!(forced.retry_count, 6);
    }

    #[test]
    fn test_record_failure_truncates_message() {
        let db = db::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        save(&conn, &order("a", 1)).unwrap();
        claim_for_send(&conn, "a", 5, false).unwrap();

        record_failure(&conn, "a", &"x".repeat(600)).unwrap();
        let stored = get(&conn, "a").unwrap().unwrap();
        assert_eq!(stored.status, SyncStatus::Error);
        assert_eq!(stored.last_error.unwrap().len(), 255);
    }

    #[test]
    fn test_unreadable_rows_are_skipped_not_fatal() {
        let db = db::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        save(&conn, &order("good", 2)).unwrap();
        conn.execute(
            "INSERT INTO pending_orders (local_id, created_at_ms, tab_number, lines)
             VALUES ('bad', 1, '42', 'not json')",
            [],
        )
        .unwrap();

        let all = get_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].local_id, "good");
    }

    #[test]
    fn test_display_order_and_counts() {
        let db = db::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let mut failed = order("failed", 1);
        failed.status = SyncStatus::Error;
        failed.retry_count = 5;
        let mut flight = order("flight", 0);
        flight.status = SyncStatus::Sending;
        save(&conn, &failed).unwrap();
        save(&conn, &flight).unwrap();
        save(&conn, &order("new", 3)).unwrap();

        let view = list_for_display(&conn, 5).unwrap();
        let ids: Vec<&str> = view.iter().map(|v| v.order.local_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "failed", "flight"]);
        assert!(view[1].needs_manual_discard);
        assert_eq!(view[0].total, 25.0);

        let counts = status_counts(&conn, 5).unwrap();
        assert_eq!(
            counts,
            StatusCounts { pending: 1, sending: 1, error: 1, needs_discard: 1 }
        );
    }

    #[test]
    fn test_discard_removes_record() {
        let db = db::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        save(&conn, &order("a", 1)).unwrap();
        assert!(discard(&conn, "a").unwrap());
        assert!(!discard(&conn, "a").unwrap());
        assert!(get(&conn, "a").unwrap().is_none());
    }
}
