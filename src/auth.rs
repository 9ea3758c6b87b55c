//! Identity decoded from the session token.
//!
//! The token is a JWT issued by the order service. Its payload carries the
//! user id and role; the signature is the server's concern, so only the
//! payload segment is decoded here.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::value_i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[serde(rename = "caixa")]
    Cashier,
    #[serde(rename = "garcom")]
    Waiter,
    #[serde(rename = "recepcao")]
    Reception,
}

impl Role {
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "caixa" => Some(Role::Cashier),
            "garcom" | "garçom" => Some(Role::Waiter),
            "recepcao" | "recepção" => Some(Role::Reception),
            _ => None,
        }
    }

    /// Only waiters and administrators may capture orders on this client.
    pub fn may_take_orders(self) -> bool {
        matches!(self, Role::Waiter | Role::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserIdentity {
    pub id: i64,
    pub role: Option<Role>,
}

impl UserIdentity {
    pub fn may_take_orders(&self) -> bool {
        self.role.is_some_and(Role::may_take_orders)
    }
}

/// Decode the identity claims from a JWT. Returns `None` for anything that
/// is not a three-segment token with a JSON payload carrying a user id.
pub fn identity_from_token(token: &str) -> Option<UserIdentity> {
    let mut segments = token.trim().split('.');
    let (_header, payload, _sig) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| warn!(error = %e, "session token payload is not base64url"))
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;

    let id = value_i64(&claims, &["userId", "user_id", "id", "sub"])?;
    let role = claims
        .get("role")
        .and_then(Value::as_str)
        .and_then(Role::from_wire);
    Some(UserIdentity { id, role })
}
