//! Local SQLite store for the order client.
//!
//! Uses rusqlite with WAL mode. Holds the menu mirror, the open-tab cache,
//! the pending-order queue and a free-form `config` key/value collection.
//! Opening the store applies pending migrations in version order before any
//! read or write is served; an open failure is returned to the caller and
//! never papered over by deleting the file.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::StoreError;

/// Shared handle to the session's single store connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Config key: epoch millis of the last successful menu refresh.
pub const CONFIG_LAST_MENU_SYNC: &str = "last_menu_sync_ms";
/// Config key: epoch millis of the last successful open-tab refresh.
pub const CONFIG_LAST_TABS_SYNC: &str = "last_tabs_sync_ms";

/// Open (or create) the store at `{data_dir}/orders.db`.
pub fn init(data_dir: &Path) -> Result<DbState, StoreError> {
    fs::create_dir_all(data_dir).map_err(|e| StoreError::Open {
        path: data_dir.display().to_string(),
        reason: format!("failed to create data dir: {e}"),
    })?;

    let db_path = data_dir.join("orders.db");
    info!("Opening local store at {}", db_path.display());

    let conn = open_and_configure(&db_path).map_err(|e| {
        error!(path = %db_path.display(), error = %e, "Local store open failed");
        e
    })?;
    run_migrations(&conn)?;

    info!("Local store initialized (schema v{CURRENT_SCHEMA_VERSION})");
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Fresh in-memory store with the full schema applied.
pub fn open_in_memory() -> Result<DbState, StoreError> {
    let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
        path: ":memory:".to_string(),
        reason: e.to_string(),
    })?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, StoreError> {
    let open_err = |e: rusqlite::Error| StoreError::Open {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    let conn = Connection::open(path).map_err(open_err)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(open_err)?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
pub(crate) fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Local store schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating local store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    let steps: [(i32, fn(&Connection) -> rusqlite::Result<()>); 4] = [
        (1, migrate_v1),
        (2, migrate_v2),
        (3, migrate_v3),
        (4, migrate_v4),
    ];
    for (version, migrate) in steps {
        if current >= version {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        migrate(&tx)
            .and_then(|_| {
                tx.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![version],
                )
                .map(|_| ())
            })
            .map_err(|e| {
                error!("Migration v{version} failed: {e}");
                StoreError::Migration {
                    version,
                    reason: e.to_string(),
                }
            })?;
        tx.commit()?;
        info!("Applied migration v{version}");
    }

    Ok(())
}

/// Migration v1: config and menu mirror.
fn migrate_v1(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS menu_categories (
            id INTEGER PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS menu_subcategories (
            id INTEGER PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS menu_products (
            id INTEGER PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        ",
    )
}

/// Migration v2: pending-order queue, keyed by the locally generated id.
fn migrate_v2(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(PENDING_ORDERS_DDL)
}

const PENDING_ORDERS_DDL: &str = "
    CREATE TABLE IF NOT EXISTS pending_orders (
        local_id TEXT PRIMARY KEY NOT NULL CHECK (length(local_id) > 0),
        created_at_ms INTEGER NOT NULL,
        user_id INTEGER NOT NULL DEFAULT 0,
        tab_number TEXT NOT NULL,
        tab_id INTEGER,
        customer_name TEXT,
        delivery_location TEXT NOT NULL DEFAULT '',
        note TEXT,
        lines TEXT NOT NULL DEFAULT '[]',
        sync_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (sync_status IN ('pending', 'sending', 'synchronized', 'error')),
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        updated_at TEXT DEFAULT (datetime('now'))
    );

    CREATE INDEX IF NOT EXISTS idx_pending_orders_created ON pending_orders(created_at_ms);
    CREATE INDEX IF NOT EXISTS idx_pending_orders_status ON pending_orders(sync_status);
";

/// Migration v3: open-tab snapshot cache, unique by display number.
fn migrate_v3(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS open_tabs_cache (
            number TEXT PRIMARY KEY NOT NULL,
            id INTEGER NOT NULL UNIQUE,
            customer_name TEXT,
            location TEXT,
            opened_at TEXT,
            running_total REAL
        );
        ",
    )
}

/// Migration v4: option groups, plus a key check on the pending-order queue.
///
/// A queue table whose primary key is not `local_id` cannot hold retrievable
/// records. It is dropped and recreated here, which deletes whatever it held;
/// this is the only place the store clears user data on its own.
fn migrate_v4(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS option_groups (
            id INTEGER PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        ",
    )?;

    match primary_key_column(conn, "pending_orders")? {
        Some(pk) if pk == "local_id" => {
            info!("pending_orders key verified (local_id)");
        }
        other => {
            let lost: i64 = conn
                .query_row("SELECT COUNT(*) FROM pending_orders", [], |row| row.get(0))
                .unwrap_or(0);
            error!(
                found_key = ?other,
                records_dropped = lost,
                "pending_orders is keyed incorrectly; dropping and recreating it"
            );
            conn.execute_batch("DROP TABLE IF EXISTS pending_orders;")?;
            conn.execute_batch(PENDING_ORDERS_DDL)?;
        }
    }
    Ok(())
}

fn primary_key_column(conn: &Connection, table: &str) -> rusqlite::Result<Option<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| {
        let name: String = row.get(1)?;
        let pk: i64 = row.get(5)?;
        Ok((name, pk))
    })?;
    for row in rows {
        let (name, pk) = row?;
        if pk == 1 {
            return Ok(Some(name));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Keyed JSON collections
// ---------------------------------------------------------------------------

/// A record stored as JSON in an `(id INTEGER PRIMARY KEY, data TEXT)` table.
pub trait Keyed: Serialize + DeserializeOwned {
    const COLLECTION: &'static str;

    fn key(&self) -> i64;
}

/// All records of a collection, ordered by key.
pub fn get_all<T: Keyed>(conn: &Connection) -> Result<Vec<T>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT data FROM {} ORDER BY id",
        T::COLLECTION
    ))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        let raw = row?;
        match serde_json::from_str::<T>(&raw) {
            Ok(record) => out.push(record),
            Err(e) => warn!(
                collection = T::COLLECTION,
                error = %e,
                "skipping unreadable record"
            ),
        }
    }
    Ok(out)
}

pub fn get_by_key<T: Keyed>(conn: &Connection, key: i64) -> Result<Option<T>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            &format!("SELECT data FROM {} WHERE id = ?1", T::COLLECTION),
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
        .transpose()
}

/// Upsert every record in one transaction. Nothing is written on error.
pub fn bulk_upsert<T: Keyed>(conn: &Connection, records: &[T]) -> Result<usize, StoreError> {
    let tx = conn.unchecked_transaction()?;
    let n = bulk_upsert_in(&tx, records)?;
    tx.commit()?;
    Ok(n)
}

/// Upsert inside a caller-owned transaction.
pub fn bulk_upsert_in<T: Keyed>(tx: &Transaction<'_>, records: &[T]) -> Result<usize, StoreError> {
    let sql = format!(
        "INSERT INTO {} (id, data, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        T::COLLECTION
    );
    let mut stmt = tx.prepare(&sql)?;
    for record in records {
        let data = serde_json::to_string(record)?;
        stmt.execute(params![record.key(), data])?;
    }
    Ok(records.len())
}

/// Delete records whose key is not in `records`, inside a caller-owned
/// transaction. Used after an upsert to make a refresh a wholesale replace.
pub fn prune_missing_in<T: Keyed>(tx: &Transaction<'_>, records: &[T]) -> Result<usize, StoreError> {
    tx.execute_batch("CREATE TEMP TABLE IF NOT EXISTS keep_ids (id INTEGER PRIMARY KEY); DELETE FROM keep_ids;")?;
    {
        let mut stmt = tx.prepare("INSERT OR IGNORE INTO keep_ids (id) VALUES (?1)")?;
        for record in records {
            stmt.execute(params![record.key()])?;
        }
    }
    let removed = tx.execute(
        &format!(
            "DELETE FROM {} WHERE id NOT IN (SELECT id FROM keep_ids)",
            T::COLLECTION
        ),
        [],
    )?;
    tx.execute_batch("DELETE FROM keep_ids;")?;
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<Value>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
        .transpose()
}

pub fn get_config_i64(conn: &Connection, key: &str) -> Result<Option<i64>, StoreError> {
    Ok(get_config(conn, key)?.and_then(|v| v.as_i64()))
}

pub fn set_config(conn: &Connection, key: &str, value: &Value) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}
