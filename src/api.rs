//! Remote order-service client.
//!
//! Provides bearer-token HTTP communication with the order/menu/tab REST API
//! and classifies every failure at this boundary: no response at all is a
//! [`GatewayError::Network`], a 401 evicts the stored session, and any other
//! error status is a [`GatewayError::Rejected`] carrying the server's own
//! message. Field-name variants of the tab payload are normalised here and
//! never leak past this module.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::models::{
    MenuCategory, MenuProduct, MenuSubcategory, OptionGroup, PendingOrder, PendingOrderLine,
    PlacedItem, RemoteTab, TabStatus,
};
use crate::storage::Session;
use crate::{value_f64, value_i64, value_str};

/// Default timeout for API requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the lightweight health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire value of an open tab.
const OPEN_STATUS: &str = "aberta";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the API base URL:
/// - ensure a scheme is present (http for localhost, https otherwise)
/// - strip trailing slashes
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    url
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderLineRequest {
    #[serde(rename = "produto_id")]
    pub product_id: i64,
    #[serde(rename = "quantidade")]
    pub quantity: u32,
    #[serde(rename = "preco_unitario_momento")]
    pub unit_price: f64,
    #[serde(rename = "observacao_item")]
    pub note: Option<String>,
}

/// Body of the create-order call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateOrderRequest {
    /// Tab display number, as a string.
    #[serde(rename = "comandaIdentifier")]
    pub tab_identifier: String,
    #[serde(rename = "local_pedido")]
    pub delivery_location: String,
    #[serde(rename = "observacao_geral")]
    pub note: Option<String>,
    #[serde(rename = "itens")]
    pub lines: Vec<OrderLineRequest>,
}

impl CreateOrderRequest {
    pub fn new(
        tab_identifier: &str,
        delivery_location: &str,
        note: Option<&str>,
        lines: &[PendingOrderLine],
    ) -> Self {
        Self {
            tab_identifier: tab_identifier.to_string(),
            delivery_location: delivery_location.to_string(),
            note: note.map(str::to_string),
            lines: lines
                .iter()
                .map(|line| OrderLineRequest {
                    product_id: line.product_id,
                    quantity: line.quantity,
                    unit_price: line.unit_price,
                    note: line.note.clone(),
                })
                .collect(),
        }
    }
}

impl From<&PendingOrder> for CreateOrderRequest {
    fn from(order: &PendingOrder) -> Self {
        CreateOrderRequest::new(
            &order.tab_number,
            &order.delivery_location,
            order.note.as_deref(),
            &order.lines,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateTabRequest {
    #[serde(rename = "numero")]
    pub number: String,
    #[serde(rename = "cliente_nome")]
    pub customer_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Tab normalisation
// ---------------------------------------------------------------------------

fn value_text(v: &Value, keys: &[&str]) -> Option<String> {
    value_str(v, keys).or_else(|| value_i64(v, keys).map(|n| n.to_string()))
}

fn normalize_placed_item(v: &Value) -> Option<PlacedItem> {
    Some(PlacedItem {
        product_id: value_i64(v, &["produto_id", "product_id"])?,
        product_name: value_str(v, &["produto_nome", "product_name"]).unwrap_or_default(),
        quantity: value_i64(v, &["quantidade", "quantity"])
            .and_then(|q| u32::try_from(q).ok())
            .unwrap_or(0),
        unit_price: value_f64(v, &["preco_unitario_momento", "preco_unitario", "unit_price"])
            .unwrap_or(0.0),
        note: value_str(v, &["observacao_item", "note"]),
    })
}

/// Map a remote tab payload onto the canonical shape.
///
/// The service has shipped two field names for the delivery location
/// (`localizacao_cliente` / `local_atual`) and for the running total
/// (`valor_total_calculado` / `total_atual_calculado`, string or number).
/// Each is probed in that order. Returns `None` without an id and a number.
pub fn normalize_tab(v: &Value) -> Option<RemoteTab> {
    let id = value_i64(v, &["id"])?;
    let number = value_text(v, &["numero", "number"])?;
    let items = v
        .get("itens")
        .or_else(|| v.get("items"))
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(normalize_placed_item).collect())
        .unwrap_or_default();

    Some(RemoteTab {
        id,
        number,
        customer_name: value_str(v, &["cliente_nome", "customer_name"]),
        location: value_str(v, &["localizacao_cliente", "local_atual"]),
        opened_at: value_str(v, &["data_abertura", "opened_at"]),
        status: value_str(v, &["status"])
            .map(|s| TabStatus::from_wire(&s))
            .unwrap_or_else(|| TabStatus::Other("unknown".to_string())),
        running_total: value_f64(v, &["valor_total_calculado", "total_atual_calculado"]),
        items,
    })
}

fn normalize_tab_list(body: Value) -> Result<Vec<RemoteTab>, GatewayError> {
    let Value::Array(rows) = body else {
        return Err(GatewayError::InvalidResponse(
            "tab list is not an array".to_string(),
        ));
    };
    let total = rows.len();
    let tabs: Vec<RemoteTab> = rows.iter().filter_map(normalize_tab).collect();
    if tabs.len() < total {
        warn!(
            dropped = total - tabs.len(),
            "tab list contained entries without id or number"
        );
    }
    Ok(tabs)
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Remote order/menu/tab service as seen by the client.
#[async_trait]
pub trait OrderApi: Send + Sync {
    async fn fetch_categories(&self) -> Result<Vec<MenuCategory>, GatewayError>;
    async fn fetch_subcategories(&self) -> Result<Vec<MenuSubcategory>, GatewayError>;
    async fn fetch_products(&self) -> Result<Vec<MenuProduct>, GatewayError>;
    async fn fetch_option_groups(&self) -> Result<Vec<OptionGroup>, GatewayError>;

    /// Every tab currently in open status.
    async fn fetch_open_tabs(&self) -> Result<Vec<RemoteTab>, GatewayError>;
    /// The open tab with this display number, if any.
    async fn find_open_tab(&self, number: &str) -> Result<Option<RemoteTab>, GatewayError>;
    /// Tab detail including already placed items. 404 reads as `None`.
    async fn fetch_tab_by_number(&self, number: &str) -> Result<Option<RemoteTab>, GatewayError>;
    async fn fetch_tab_by_id(&self, id: i64) -> Result<Option<RemoteTab>, GatewayError>;
    /// Returns the generated tab id.
    async fn create_tab(&self, request: &CreateTabRequest) -> Result<i64, GatewayError>;

    async fn create_order(&self, request: &CreateOrderRequest) -> Result<Value, GatewayError>;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a transport-level `reqwest::Error` into a classified error.
fn classify_send_error(base: &str, err: &reqwest::Error) -> GatewayError {
    if err.is_builder() {
        return GatewayError::Config(format!("Invalid API URL: {base}"));
    }
    if err.is_connect() {
        return GatewayError::Network(format!("Cannot reach order service at {base}"));
    }
    if err.is_timeout() {
        return GatewayError::Network(format!("Connection to {base} timed out"));
    }
    GatewayError::Network(format!("Network error communicating with {base}: {err}"))
}

/// Fallback message for an error status without a usable body.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        403 => "Not allowed to perform this action".to_string(),
        404 => "Resource not found on order service".to_string(),
        s if s >= 500 => format!("Order service error (HTTP {s})"),
        s => format!("Request rejected by order service (HTTP {s})"),
    }
}

/// Server-supplied message, used verbatim when present.
fn rejection_message(status: StatusCode, body_text: &str) -> String {
    serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| value_str(&json, &["message", "error"]))
        .unwrap_or_else(|| status_error(status))
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Bearer-token HTTP client for the order service.
pub struct RemoteGateway {
    base_url: String,
    client: Client,
    session: Arc<Session>,
}

impl RemoteGateway {
    pub fn new(base_url: &str, timeout: Duration, session: Arc<Session>) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            client,
            session,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Lightweight reachability check. Any HTTP response counts as online.
    pub async fn probe(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.head(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "health probe failed");
                false
            }
        }
    }

    /// Perform an authenticated request and classify the status. Returns the
    /// raw body of a 2xx response. `path` includes the leading slash.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<String, GatewayError> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.client.request(method.clone(), &url).query(query);
        if let Some(token) = self.session.token() {
            req = req.bearer_auth(token.as_str());
        }
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| classify_send_error(&self.base_url, &e))?;
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED {
            warn!(%method, path, "order service answered 401, evicting session");
            self.session.evict();
            return Err(GatewayError::Unauthorized);
        }

        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: rejection_message(status, &body_text),
            });
        }
        Ok(body_text)
    }

    /// Read request whose body must be JSON.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Value, GatewayError> {
        let body_text = self.send(method, path, query, body).await?;
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| GatewayError::InvalidResponse(format!("{path}: {e}")))
    }

    /// POST that creates something. A 2xx means the service applied it, so
    /// an unreadable body becomes `Value::Null` instead of an error.
    async fn write(&self, path: &str, body: Value) -> Result<Value, GatewayError> {
        let body_text = self.send(Method::POST, path, &[], Some(body)).await?;
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body_text).unwrap_or_else(|e| {
            warn!(path, error = %e, "write accepted with a non-JSON body");
            Value::Null
        }))
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, GatewayError> {
        let body = self.request(Method::GET, path, query, None).await?;
        serde_json::from_value(body).map_err(|e| GatewayError::InvalidResponse(format!("{path}: {e}")))
    }

    async fn get_tab(&self, path: &str) -> Result<Option<RemoteTab>, GatewayError> {
        match self.request(Method::GET, path, &[], None).await {
            Ok(body) => Ok(normalize_tab(&body)),
            Err(GatewayError::Rejected { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl OrderApi for RemoteGateway {
    async fn fetch_categories(&self) -> Result<Vec<MenuCategory>, GatewayError> {
        self.get_list("/categories", &[("ativo", "true")]).await
    }

    async fn fetch_subcategories(&self) -> Result<Vec<MenuSubcategory>, GatewayError> {
        self.get_list("/subcategories", &[("ativo", "true")]).await
    }

    async fn fetch_products(&self) -> Result<Vec<MenuProduct>, GatewayError> {
        self.get_list("/produtos", &[("disponivel", "true"), ("ativo", "true")])
            .await
    }

    async fn fetch_option_groups(&self) -> Result<Vec<OptionGroup>, GatewayError> {
        self.get_list("/grupos-opcoes", &[("ativo", "true")]).await
    }

    async fn fetch_open_tabs(&self) -> Result<Vec<RemoteTab>, GatewayError> {
        let body = self
            .request(Method::GET, "/comandas", &[("status", OPEN_STATUS)], None)
            .await?;
        normalize_tab_list(body)
    }

    async fn find_open_tab(&self, number: &str) -> Result<Option<RemoteTab>, GatewayError> {
        let body = match self
            .request(
                Method::GET,
                "/comandas",
                &[("numero", number), ("status", OPEN_STATUS)],
                None,
            )
            .await
        {
            Ok(body) => body,
            Err(GatewayError::Rejected { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(normalize_tab_list(body)?.into_iter().next())
    }

    async fn fetch_tab_by_number(&self, number: &str) -> Result<Option<RemoteTab>, GatewayError> {
        self.get_tab(&format!("/comandas/numero/{number}")).await
    }

    async fn fetch_tab_by_id(&self, id: i64) -> Result<Option<RemoteTab>, GatewayError> {
        self.get_tab(&format!("/comandas/id/{id}")).await
    }

    async fn create_tab(&self, request: &CreateTabRequest) -> Result<i64, GatewayError> {
        let body = serde_json::to_value(request)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        let created = self.write("/comandas", body).await?;
        if let Some(id) = value_i64(&created, &["id"]) {
            return Ok(id);
        }
        // Created, but the response did not carry the id.
        match self.find_open_tab(&request.number).await? {
            Some(tab) => Ok(tab.id),
            None => Err(GatewayError::InvalidResponse(format!(
                "tab {} was created but is not listed as open",
                request.number
            ))),
        }
    }

    async fn create_order(&self, request: &CreateOrderRequest) -> Result<Value, GatewayError> {
        let body = serde_json::to_value(request)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        self.write("/pedidos", body).await
    }
}
