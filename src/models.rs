//! Domain records shared by the local store, the remote gateway and the
//! sync engine.
//!
//! Menu records deserialize from both the remote wire names (`nome`,
//! `preco_venda`, ...) and the names they are persisted under locally.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Lenient scalar decoding
// ---------------------------------------------------------------------------

/// Decimal transported as either a JSON string or a JSON number, kept as text.
fn de_decimal_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok("0".to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected decimal string or number, got {other}"
        ))),
    }
}

/// Non-negative amount transported as string, number or null.
fn de_amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_amount(&value).unwrap_or(0.0).max(0.0))
}

/// Parse a JSON number or numeric string.
pub(crate) fn parse_amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

// ---------------------------------------------------------------------------
// Menu
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuCategory {
    pub id: i64,
    #[serde(alias = "nome")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuSubcategory {
    pub id: i64,
    #[serde(alias = "nome")]
    pub name: String,
    #[serde(alias = "categoria_id")]
    pub category_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuProduct {
    pub id: i64,
    #[serde(alias = "nome")]
    pub name: String,
    #[serde(default, alias = "descricao")]
    pub description: Option<String>,
    /// Decimal string as sent by the server; see [`MenuProduct::unit_price`].
    #[serde(alias = "preco_venda", deserialize_with = "de_decimal_string")]
    pub price: String,
    #[serde(alias = "categoria_id")]
    pub category_id: i64,
    #[serde(default, alias = "subcategoria_id")]
    pub subcategory_id: Option<i64>,
    #[serde(default = "default_true", alias = "ativo")]
    pub active: bool,
    #[serde(default, alias = "permite_observacao")]
    pub allows_note: bool,
    #[serde(default, alias = "grupo_opcoes_id")]
    pub option_group_id: Option<i64>,
}

fn default_true() -> bool {
    true
}

impl MenuProduct {
    /// Price parsed at point of use. Unparseable prices read as zero.
    pub fn unit_price(&self) -> f64 {
        parse_amount(&Value::String(self.price.clone())).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionKind {
    /// Mutually exclusive options.
    #[serde(alias = "unica")]
    Single,
    /// Independently toggleable options.
    #[serde(alias = "multipla")]
    Multiple,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionItem {
    pub id: i64,
    #[serde(alias = "nome")]
    pub name: String,
    #[serde(default, alias = "valor_adicional", deserialize_with = "de_amount")]
    pub price_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionGroup {
    pub id: i64,
    #[serde(alias = "nome_grupo", alias = "nome")]
    pub name: String,
    #[serde(alias = "tipo_selecao")]
    pub selection: SelectionKind,
    #[serde(default, alias = "opcoes")]
    pub options: Vec<OptionItem>,
}

impl OptionGroup {
    pub fn option(&self, id: i64) -> Option<&OptionItem> {
        self.options.iter().find(|o| o.id == id)
    }
}

// ---------------------------------------------------------------------------
// Tabs
// ---------------------------------------------------------------------------

/// Remote tab lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Open,
    Closed,
    Paid,
    Cancelled,
    Other(String),
}

impl TabStatus {
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "aberta" | "open" => TabStatus::Open,
            "fechada" | "closed" => TabStatus::Closed,
            "paga" | "paid" => TabStatus::Paid,
            "cancelada" | "cancelled" | "canceled" => TabStatus::Cancelled,
            other => TabStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TabStatus::Open => "open",
            TabStatus::Closed => "closed",
            TabStatus::Paid => "paid",
            TabStatus::Cancelled => "cancelled",
            TabStatus::Other(s) => s.as_str(),
        }
    }
}

/// Point-in-time copy of a remotely open tab. Unique by `number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabSnapshot {
    pub id: i64,
    pub number: String,
    pub customer_name: Option<String>,
    pub location: Option<String>,
    pub opened_at: Option<String>,
    pub running_total: Option<f64>,
}

/// Line item already placed on a remote tab.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedItem {
    pub product_id: i64,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub note: Option<String>,
}

/// Canonical remote tab, produced by the gateway's normalisation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteTab {
    pub id: i64,
    pub number: String,
    pub customer_name: Option<String>,
    pub location: Option<String>,
    pub opened_at: Option<String>,
    pub status: TabStatus,
    pub running_total: Option<f64>,
    pub items: Vec<PlacedItem>,
}

impl RemoteTab {
    pub fn to_snapshot(&self) -> TabSnapshot {
        TabSnapshot {
            id: self.id,
            number: self.number.clone(),
            customer_name: self.customer_name.clone(),
            location: self.location.clone(),
            opened_at: self.opened_at.clone(),
            running_total: self.running_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Pending orders
// ---------------------------------------------------------------------------

/// Lifecycle of a locally queued order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Sending,
    /// Never persisted: confirmed records are deleted instead.
    Synchronized,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Sending => "sending",
            SyncStatus::Synchronized => "synchronized",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(SyncStatus::Pending),
            "sending" => Some(SyncStatus::Sending),
            "synchronized" => Some(SyncStatus::Synchronized),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrderLine {
    pub product_id: i64,
    pub product_name: String,
    pub quantity: u32,
    /// Price at capture time, never re-fetched.
    pub unit_price: f64,
    pub note: Option<String>,
}

impl PendingOrderLine {
    pub fn subtotal(&self) -> f64 {
        self.unit_price * f64::from(self.quantity)
    }
}

/// An order captured while the remote service was unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    /// Locally generated, never reused. Primary key of the queue.
    pub local_id: String,
    pub created_at_ms: i64,
    pub user_id: i64,
    /// Display number; the remote service resolves tabs by number.
    pub tab_number: String,
    pub tab_id: Option<i64>,
    pub customer_name: Option<String>,
    pub delivery_location: String,
    pub note: Option<String>,
    pub lines: Vec<PendingOrderLine>,
    pub status: SyncStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl PendingOrder {
    pub fn total(&self) -> f64 {
        self.lines.iter().map(PendingOrderLine::subtotal).sum()
    }

    /// Whether an automatic drain pass may pick this record up.
    pub fn is_drain_eligible(&self, max_retries: u32) -> bool {
        match self.status {
            SyncStatus::Pending => true,
            SyncStatus::Error => self.retry_count < max_retries,
            SyncStatus::Sending | SyncStatus::Synchronized => false,
        }
    }

    /// Errored record that exhausted its automatic retries.
    pub fn needs_manual_discard(&self, max_retries: u32) -> bool {
        self.status == SyncStatus::Error && self.retry_count >= max_retries
    }
}
