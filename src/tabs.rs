//! Open-tab snapshot cache.
//!
//! The cache is only ever replaced wholesale: the previous snapshot is
//! cleared and the new one inserted inside a single transaction, so a reader
//! sees either the whole old set or the whole new set.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{info, warn};

use crate::api::{CreateTabRequest, OrderApi};
use crate::connectivity::ConnectivityMonitor;
use crate::db::{self, DbState, CONFIG_LAST_TABS_SYNC};
use crate::error::{StoreError, TabError};
use crate::models::{RemoteTab, TabSnapshot, TabStatus};

const SELECT_COLUMNS: &str =
    "SELECT id, number, customer_name, location, opened_at, running_total FROM open_tabs_cache";

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<TabSnapshot> {
    Ok(TabSnapshot {
        id: row.get(0)?,
        number: row.get(1)?,
        customer_name: row.get(2)?,
        location: row.get(3)?,
        opened_at: row.get(4)?,
        running_total: row.get(5)?,
    })
}

/// Clear the cache and insert `snapshots`, atomically.
///
/// Snapshots with an empty number, or a number/id already seen in this batch,
/// are skipped. Returns the number stored.
pub fn replace_all(conn: &Connection, snapshots: &[TabSnapshot]) -> Result<usize, StoreError> {
    let tx = conn.unchecked_transaction()?;
    let cleared = tx.execute("DELETE FROM open_tabs_cache", [])?;

    let mut stored = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO open_tabs_cache
                (id, number, customer_name, location, opened_at, running_total)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for tab in snapshots {
            let number = tab.number.trim();
            if number.is_empty() {
                warn!(tab_id = tab.id, "skipping open tab without a number");
                continue;
            }
            let inserted = stmt.execute(params![
                tab.id,
                number,
                tab.customer_name,
                tab.location,
                tab.opened_at,
                tab.running_total,
            ])?;
            if inserted == 0 {
                warn!(tab = %number, tab_id = tab.id, "skipping duplicate open tab");
            }
            stored += inserted;
        }
    }

    tx.commit()?;
    info!(cleared, stored, "open-tab cache replaced");
    Ok(stored)
}

/// Cached snapshots ordered by number.
pub fn get_all(conn: &Connection) -> Result<Vec<TabSnapshot>, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY number"))?;
    let rows = stmt.query_map([], row_to_snapshot)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn get_by_number(conn: &Connection, number: &str) -> Result<Option<TabSnapshot>, StoreError> {
    Ok(conn
        .query_row(
            &format!("{SELECT_COLUMNS} WHERE number = ?1"),
            params![number.trim()],
            row_to_snapshot,
        )
        .optional()?)
}

/// Offline lookup of a tab by display number.
pub fn lookup_tab(db: &DbState, number: &str) -> Result<Option<TabSnapshot>, StoreError> {
    let conn = db.lock()?;
    get_by_number(&conn, number)
}

pub fn list_cached(db: &DbState) -> Result<Vec<TabSnapshot>, StoreError> {
    let conn = db.lock()?;
    get_all(&conn)
}

/// Outcome of one refresh. A failed fetch reads as zero synchronized with
/// the error message attached; it never aborts the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TabRefresh {
    pub synchronized: usize,
    pub error: Option<String>,
}

impl TabRefresh {
    fn failed(message: String) -> Self {
        Self {
            synchronized: 0,
            error: Some(message),
        }
    }
}

/// Replace the cache with every tab the service reports as open.
pub async fn refresh_open_tabs(
    db: &DbState,
    api: &dyn OrderApi,
    connectivity: &ConnectivityMonitor,
) -> TabRefresh {
    if !connectivity.is_online() {
        return TabRefresh::failed("offline".to_string());
    }

    let remote = match api.fetch_open_tabs().await {
        Ok(tabs) => tabs,
        Err(e) => {
            warn!(error = %e, "open-tab fetch failed; cache left as is");
            return TabRefresh::failed(e.to_string());
        }
    };
    let snapshots: Vec<TabSnapshot> = remote.iter().map(|t| t.to_snapshot()).collect();

    let stored = db.lock().and_then(|conn| {
        let n = replace_all(&conn, &snapshots)?;
        db::set_config(
            &conn,
            CONFIG_LAST_TABS_SYNC,
            &serde_json::json!(Utc::now().timestamp_millis()),
        )?;
        Ok(n)
    });

    match stored {
        Ok(n) => TabRefresh {
            synchronized: n,
            error: None,
        },
        Err(e) => {
            warn!(error = %e, "open-tab cache write failed");
            TabRefresh::failed(e.user_message())
        }
    }
}

/// Open a new tab on the service and refresh the cache so the tab can take
/// orders offline as well. Only possible while online.
pub async fn open_tab(
    db: &DbState,
    api: &dyn OrderApi,
    connectivity: &ConnectivityMonitor,
    number: &str,
    customer_name: Option<&str>,
) -> Result<RemoteTab, TabError> {
    let number = number.trim();
    if number.is_empty() {
        return Err(TabError::MissingNumber);
    }
    if !connectivity.is_online() {
        return Err(TabError::Offline);
    }
    if api
        .find_open_tab(number)
        .await
        .map_err(TabError::Remote)?
        .is_some()
    {
        return Err(TabError::AlreadyOpen(number.to_string()));
    }

    let request = CreateTabRequest {
        number: number.to_string(),
        customer_name: customer_name
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string),
    };
    let id = api.create_tab(&request).await.map_err(TabError::Remote)?;
    info!(tab = %number, id, "tab opened");

    let tab = match api.fetch_tab_by_id(id).await {
        Ok(Some(tab)) => tab,
        other => {
            if let Err(e) = other {
                warn!(id, error = %e, "could not read back the new tab");
            }
            RemoteTab {
                id,
                number: request.number,
                customer_name: request.customer_name,
                location: None,
                opened_at: None,
                status: TabStatus::Open,
                running_total: Some(0.0),
                items: Vec::new(),
            }
        }
    };

    let refresh = refresh_open_tabs(db, api, connectivity).await;
    if let Some(e) = refresh.error {
        warn!(error = %e, "tab cache not refreshed after opening a tab");
    }
    Ok(tab)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::testing::{open_tab, FakeApi};

    fn snapshot(id: i64, number: &str) -> TabSnapshot {
        open_tab(id, number).to_snapshot()
    }

    #[test]
    fn test_replace_all_is_wholesale() {
        let db = db::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        replace_all(&conn, &[snapshot(1, "1"), snapshot(2, "2"), snapshot(3, "3")]).unwrap();

        replace_all(&conn, &[snapshot(4, "4")]).unwrap();

        let all = get_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].number, "4");
        assert!(get_by_number(&conn, "1").unwrap().is_none());
    }

    #[test]
    fn test_replace_all_skips_invalid_and_duplicate_numbers() {
        let db = db::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let stored =
            replace_all(&conn, &[snapshot(1, "42"), snapshot(2, " "), snapshot(3, "42")]).unwrap();
        assert_eq!(stored, 1);
        assert_eq!(get_by_number(&conn, "42").unwrap().unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_refresh_replaces_cache_and_stamps_time() {
        let db = db::open_in_memory().unwrap();
        {
            let conn = db.lock().unwrap();
            replace_all(&conn, &[snapshot(99, "99")]).unwrap();
        }
        let mut closed = open_tab(3, "3");
        closed.status = crate::models::TabStatus::Closed;
        let api = FakeApi::with_tabs(vec![open_tab(1, "1"), open_tab(2, "2"), closed]);
        let online = ConnectivityMonitor::new(true);

        let result = refresh_open_tabs(&db, &api, &online).await;
        assert_eq!(result, TabRefresh { synchronized: 2, error: None });

        let cached = list_cached(&db).unwrap();
        let numbers: Vec<&str> = cached.iter().map(|t| t.number.as_str()).collect();
        assert_eq!(numbers, vec!["1", "2"]);
        let conn = db.lock().unwrap();
        assert!(db::get_config_i64(&conn, CONFIG_LAST_TABS_SYNC).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fetch_failure_reports_zero_and_keeps_cache() {
        let db = db::open_in_memory().unwrap();
        {
            let conn = db.lock().unwrap();
            replace_all(&conn, &[snapshot(7, "7")]).unwrap();
        }
        let api = FakeApi::new();
        api.fail_tabs_fetch(GatewayError::Rejected {
            status: 503,
            message: "Order service error (HTTP 503)".into(),
        });
        let online = ConnectivityMonitor::new(true);

        let result = refresh_open_tabs(&db, &api, &online).await;
        assert_eq!(result.synchronized, 0);
        assert!(result.error.is_some());
        assert!(lookup_tab(&db, "7").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_does_nothing_offline() {
        let db = db::open_in_memory().unwrap();
        let api = FakeApi::with_tabs(vec![open_tab(1, "1")]);
        let offline = ConnectivityMonitor::new(false);

        let result = refresh_open_tabs(&db, &api, &offline).await;
        assert_eq!(result.error.as_deref(), Some("offline"));
        assert!(list_cached(&db).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_tab_creates_and_caches() {
        let db = db::open_in_memory().unwrap();
        let api = FakeApi::with_tabs(vec![open_tab(1, "42")]);
        let online = ConnectivityMonitor::new(true);

        let tab = super::open_tab(&db, &api, &online, " 12 ", Some("Ana")).await.unwrap();
        assert_eq!(tab.number, "12");
        assert_eq!(tab.customer_name.as_deref(), Some("Ana"));
        assert_eq!(tab.status, TabStatus::Open);

        let cached = lookup_tab(&db, "12").unwrap().unwrap();
        assert_eq!(cached.id, tab.id);
        assert!(lookup_tab(&db, "42").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_open_tab_refuses_duplicates_and_offline() {
        let db = db::open_in_memory().unwrap();
        let api = FakeApi::with_tabs(vec![open_tab(1, "42")]);

        let err = super::open_tab(&db, &api, &ConnectivityMonitor::new(true), "42", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TabError::AlreadyOpen(ref n) if n == "42"));

        let err = super::open_tab(&db, &api, &ConnectivityMonitor::new(false), "7", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TabError::Offline));

        let err = super::open_tab(&db, &api, &ConnectivityMonitor::new(true), "  ", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TabError::MissingNumber));
        assert!(list_cached(&db).unwrap().is_empty());
    }
}
