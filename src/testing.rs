//! Test-only fakes shared by the unit tests.

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value;
use std::sync::Mutex;

use crate::api::{CreateOrderRequest, CreateTabRequest, OrderApi};
use crate::error::GatewayError;
use crate::menu::Menu;
use crate::models::{
    MenuCategory, MenuProduct, MenuSubcategory, OptionGroup, OptionItem, RemoteTab,
    SelectionKind, TabStatus,
};

/// Unsigned JWT carrying `userId` and `role`.
pub fn make_token(user_id: i64, role: &str) -> String {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = engine.encode(
        serde_json::json!({ "userId": user_id, "role": role })
            .to_string()
            .as_bytes(),
    );
    format!("{header}.{payload}.sig")
}

pub fn sample_menu() -> Menu {
    Menu {
        categories: vec![
            MenuCategory { id: 1, name: "Bebidas".into() },
            MenuCategory { id: 2, name: "Pratos".into() },
        ],
        subcategories: vec![
            MenuSubcategory { id: 10, name: "Cervejas".into(), category_id: 1 },
            MenuSubcategory { id: 20, name: "Grelhados".into(), category_id: 2 },
        ],
        products: vec![
            MenuProduct {
                id: 7,
                name: "Chopp".into(),
                description: None,
                price: "12.50".into(),
                category_id: 1,
                subcategory_id: Some(10),
                active: true,
                allows_note: true,
                option_group_id: None,
            },
            MenuProduct {
                id: 8,
                name: "Picanha".into(),
                description: Some("300g".into()),
                price: "89.90".into(),
                category_id: 2,
                subcategory_id: Some(20),
                active: true,
                allows_note: true,
                option_group_id: Some(3),
            },
            MenuProduct {
                id: 9,
                name: "Suco".into(),
                description: None,
                price: "9.00".into(),
                category_id: 1,
                subcategory_id: None,
                active: false,
                allows_note: false,
                option_group_id: Some(4),
            },
        ],
        option_groups: vec![
            OptionGroup {
                id: 3,
                name: "Ponto".into(),
                selection: SelectionKind::Single,
                options: vec![
                    OptionItem { id: 31, name: "Mal passada".into(), price_delta: 0.0 },
                    OptionItem { id: 32, name: "Ao ponto".into(), price_delta: 0.0 },
                ],
            },
            OptionGroup {
                id: 4,
                name: "Adicionais".into(),
                selection: SelectionKind::Multiple,
                options: vec![
                    OptionItem { id: 41, name: "Gelo".into(), price_delta: 0.0 },
                    OptionItem { id: 42, name: "Hortela".into(), price_delta: 1.5 },
                ],
            },
        ],
    }
}

pub fn open_tab(id: i64, number: &str) -> RemoteTab {
    RemoteTab {
        id,
        number: number.to_string(),
        customer_name: None,
        location: Some(format!("Mesa {number}")),
        opened_at: Some("2026-10-19T12:00:00Z".into()),
        status: TabStatus::Open,
        running_total: Some(0.0),
        items: Vec::new(),
    }
}

fn unreachable_error() -> GatewayError {
    GatewayError::Network("Cannot reach order service at http://fake".to_string())
}

#[derive(Default)]
struct FakeState {
    menu: Menu,
    menu_fetches: usize,
    fail_products: bool,
    unreachable: bool,
    tabs: Vec<RemoteTab>,
    tabs_error: Option<GatewayError>,
    order_error: Option<GatewayError>,
    order_calls: Vec<CreateOrderRequest>,
    next_tab_id: i64,
}

/// Scripted in-process stand-in for the order service.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_menu(menu: Menu) -> Self {
        let api = Self::default();
        api.state.lock().unwrap().menu = menu;
        api
    }

    pub fn with_tabs(tabs: Vec<RemoteTab>) -> Self {
        let api = Self::with_menu(sample_menu());
        api.state.lock().unwrap().tabs = tabs;
        api
    }

    /// Number of complete menu refresh attempts (counted on categories).
    pub fn menu_fetches(&self) -> usize {
        self.state.lock().unwrap().menu_fetches
    }

    pub fn fail_products_fetch(&self) {
        self.state.lock().unwrap().fail_products = true;
    }

    /// Every call fails as if no HTTP response was received.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub fn fail_tabs_fetch(&self, error: GatewayError) {
        self.state.lock().unwrap().tabs_error = Some(error);
    }

    /// Every create-order call returns `error` until cleared with `None`.
    pub fn fail_orders(&self, error: Option<GatewayError>) {
        self.state.lock().unwrap().order_error = error;
    }

    pub fn order_calls(&self) -> Vec<CreateOrderRequest> {
        self.state.lock().unwrap().order_calls.clone()
    }

    fn check_reachable(&self) -> Result<(), GatewayError> {
        if self.state.lock().unwrap().unreachable {
            Err(unreachable_error())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl OrderApi for FakeApi {
    async fn fetch_categories(&self) -> Result<Vec<MenuCategory>, GatewayError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.menu_fetches += 1;
        Ok(state.menu.categories.clone())
    }

    async fn fetch_subcategories(&self) -> Result<Vec<MenuSubcategory>, GatewayError> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().menu.subcategories.clone())
    }

    async fn fetch_products(&self) -> Result<Vec<MenuProduct>, GatewayError> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        if state.fail_products {
            return Err(GatewayError::Rejected {
                status: 500,
                message: "Order service error (HTTP 500)".into(),
            });
        }
        Ok(state.menu.products.clone())
    }

    async fn fetch_option_groups(&self) -> Result<Vec<OptionGroup>, GatewayError> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().menu.option_groups.clone())
    }

    async fn fetch_open_tabs(&self) -> Result<Vec<RemoteTab>, GatewayError> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        if let Some(e) = &state.tabs_error {
            return Err(e.clone());
        }
        Ok(state
            .tabs
            .iter()
            .filter(|t| t.status == TabStatus::Open)
            .cloned()
            .collect())
    }

    async fn find_open_tab(&self, number: &str) -> Result<Option<RemoteTab>, GatewayError> {
        Ok(self
            .fetch_open_tabs()
            .await?
            .into_iter()
            .find(|t| t.number == number))
    }

    async fn fetch_tab_by_number(&self, number: &str) -> Result<Option<RemoteTab>, GatewayError> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        Ok(state.tabs.iter().find(|t| t.number == number).cloned())
    }

    async fn fetch_tab_by_id(&self, id: i64) -> Result<Option<RemoteTab>, GatewayError> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        Ok(state.tabs.iter().find(|t| t.id == id).cloned())
    }

    async fn create_tab(&self, request: &CreateTabRequest) -> Result<i64, GatewayError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        if state.tabs.iter().any(|t| t.number == request.number && t.status == TabStatus::Open) {
            return Err(GatewayError::Rejected {
                status: 409,
                message: format!("Comanda {} já está aberta", request.number),
            });
        }
        state.next_tab_id += 1;
        let id = 1000 + state.next_tab_id;
        let mut tab = open_tab(id, &request.number);
        tab.customer_name = request.customer_name.clone();
        state.tabs.push(tab);
        Ok(id)
    }

    async fn create_order(&self, request: &CreateOrderRequest) -> Result<Value, GatewayError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.order_calls.push(request.clone());
        if let Some(e) = &state.order_error {
            return Err(e.clone());
        }
        let closed = state
            .tabs
            .iter()
            .any(|t| t.number == request.tab_identifier && t.status != TabStatus::Open);
        if closed {
            return Err(GatewayError::Rejected {
                status: 400,
                message: "Comanda não está aberta".into(),
            });
        }
        Ok(serde_json::json!({ "id": state.order_calls.len() }))
    }
}
