//! Menu cache layer.
//!
//! Reads the mirrored menu (categories, subcategories, products, option
//! groups) from the local store and refreshes it from the remote service
//! when it is stale and the device is online. A refresh is all-or-nothing:
//! the four collections are fetched in parallel and written in a single
//! transaction only after every fetch succeeded.

use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::OrderApi;
use crate::connectivity::ConnectivityMonitor;
use crate::db::{self, DbState, Keyed, CONFIG_LAST_MENU_SYNC};
use crate::error::{GatewayError, MenuError, StoreError};
use crate::models::{MenuCategory, MenuProduct, MenuSubcategory, OptionGroup};

/// Default freshness window for the local menu mirror.
pub const DEFAULT_MENU_FRESHNESS: Duration = Duration::from_secs(10 * 60);

impl Keyed for MenuCategory {
    const COLLECTION: &'static str = "menu_categories";
    fn key(&self) -> i64 {
        self.id
    }
}

impl Keyed for MenuSubcategory {
    const COLLECTION: &'static str = "menu_subcategories";
    fn key(&self) -> i64 {
        self.id
    }
}

impl Keyed for MenuProduct {
    const COLLECTION: &'static str = "menu_products";
    fn key(&self) -> i64 {
        self.id
    }
}

impl Keyed for OptionGroup {
    const COLLECTION: &'static str = "option_groups";
    fn key(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Menu {
    pub categories: Vec<MenuCategory>,
    pub subcategories: Vec<MenuSubcategory>,
    pub products: Vec<MenuProduct>,
    pub option_groups: Vec<OptionGroup>,
}

impl Menu {
    /// True when any of the reference collections is empty.
    pub fn is_incomplete(&self) -> bool {
        self.categories.is_empty() || self.subcategories.is_empty() || self.products.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.subcategories.is_empty() && self.products.is_empty()
    }

    pub fn product(&self, id: i64) -> Option<&MenuProduct> {
        self.products.iter().find(|p| p.id == id)
    }

    pub fn option_group_for(&self, product: &MenuProduct) -> Option<&OptionGroup> {
        let group_id = product.option_group_id?;
        self.option_groups.iter().find(|g| g.id == group_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MenuSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadedMenu {
    pub menu: Menu,
    pub source: MenuSource,
    /// Served from the local mirror although it is past its freshness window.
    pub stale: bool,
}

// ---------------------------------------------------------------------------
// Local mirror
// ---------------------------------------------------------------------------

pub fn read_local_menu(db: &DbState) -> Result<Menu, StoreError> {
    let conn = db.lock()?;
    Ok(Menu {
        categories: db::get_all(&conn)?,
        subcategories: db::get_all(&conn)?,
        products: db::get_all(&conn)?,
        option_groups: db::get_all(&conn)?,
    })
}

/// Replace the local mirror with `menu` and stamp the sync time, atomically.
fn store_menu(db: &DbState, menu: &Menu, synced_at_ms: i64) -> Result<(), StoreError> {
    let conn = db.lock()?;
    let tx = conn.unchecked_transaction()?;

    db::bulk_upsert_in(&tx, &menu.categories)?;
    db::bulk_upsert_in(&tx, &menu.subcategories)?;
    db::bulk_upsert_in(&tx, &menu.products)?;
    db::bulk_upsert_in(&tx, &menu.option_groups)?;

    let removed = db::prune_missing_in(&tx, &menu.categories)?
        + db::prune_missing_in(&tx, &menu.subcategories)?
        + db::prune_missing_in(&tx, &menu.products)?
        + db::prune_missing_in(&tx, &menu.option_groups)?;
    if removed > 0 {
        debug!(removed, "menu refresh dropped records no longer served");
    }

    db::set_config(&tx, CONFIG_LAST_MENU_SYNC, &serde_json::json!(synced_at_ms))?;
    tx.commit()?;
    Ok(())
}

/// Staleness rule: any reference collection empty, no recorded sync, or a
/// sync older than `freshness`.
pub fn is_stale(menu: &Menu, last_sync_ms: Option<i64>, now_ms: i64, freshness: Duration) -> bool {
    if menu.is_incomplete() {
        return true;
    }
    match last_sync_ms {
        None => true,
        Some(last) => now_ms.saturating_sub(last) > freshness.as_millis() as i64,
    }
}

// ---------------------------------------------------------------------------
// Remote refresh
// ---------------------------------------------------------------------------

/// Fetch all four collections in parallel; any failure fails the whole fetch.
pub async fn fetch_remote_menu(api: &dyn OrderApi) -> Result<Menu, GatewayError> {
    let (categories, subcategories, products, option_groups) = tokio::try_join!(
        api.fetch_categories(),
        api.fetch_subcategories(),
        api.fetch_products(),
        api.fetch_option_groups(),
    )?;
    Ok(Menu {
        categories,
        subcategories,
        products,
        option_groups,
    })
}

/// Load the menu, refreshing the local mirror first when it is stale and the
/// device is online.
///
/// Offline (or when the refresh fails) any non-empty local data is returned
/// even if stale. Only an empty mirror with no way to refresh it is an error.
pub async fn load_menu(
    db: &DbState,
    api: &dyn OrderApi,
    connectivity: &ConnectivityMonitor,
    freshness: Duration,
) -> Result<LoadedMenu, MenuError> {
    let local = read_local_menu(db)?;
    let last_sync_ms = {
        let conn = db.lock()?;
        db::get_config_i64(&conn, CONFIG_LAST_MENU_SYNC)?
    };
    let now_ms = Utc::now().timestamp_millis();
    let stale = is_stale(&local, last_sync_ms, now_ms, freshness);

    if stale && connectivity.is_online() {
        match fetch_remote_menu(api).await {
            Ok(fresh) => {
                store_menu(db, &fresh, Utc::now().timestamp_millis())?;
                info!(
                    categories = fresh.categories.len(),
                    subcategories = fresh.subcategories.len(),
                    products = fresh.products.len(),
                    option_groups = fresh.option_groups.len(),
                    "menu refreshed from remote"
                );
                return Ok(LoadedMenu {
                    menu: fresh,
                    source: MenuSource::Remote,
                    stale: false,
                });
            }
            Err(e) => {
                warn!(error = %e, "menu refresh failed, keeping local mirror untouched");
            }
        }
    }

    if local.is_empty() {
        return Err(MenuError::Unavailable);
    }

    debug!(stale, "serving menu from local mirror");
    Ok(LoadedMenu {
        menu: local,
        source: MenuSource::Local,
        stale,
    })
}
