//! Error classification for the order client.
//!
//! Every component classifies failures at its own boundary into one of three
//! families: local storage failures ([`StoreError`]), remote failures
//! ([`GatewayError`], split into "no response at all" and "response with an
//! error status"), and per-operation results built on top of those two.

use thiserror::Error;

/// Longest error message persisted on a pending order.
pub const MAX_STORED_ERROR_CHARS: usize = 255;

/// Local structured store failure. Never confused with being offline.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot open local store at {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("local store migration v{version} failed: {reason}")]
    Migration { version: i32, reason: String },

    #[error("local store query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("local store serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{collection} record has an empty {field}; refusing to store an unkeyed record")]
    MissingKey {
        collection: &'static str,
        field: &'static str,
    },

    #[error("local store lock poisoned")]
    Lock,
}

impl StoreError {
    pub fn user_message(&self) -> String {
        format!("Cannot save locally on this device ({self})")
    }
}

/// Remote gateway failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// No HTTP response was received at all.
    #[error("{0}")]
    Network(String),

    /// HTTP 401. The stored session has already been evicted.
    #[error("Session expired, please sign in again")]
    Unauthorized,

    /// HTTP response with an error status. `message` is the server's own
    /// wording when it supplied one.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Config(String),
}

impl GatewayError {
    /// True only when the request never produced an HTTP response.
    pub fn is_network(&self) -> bool {
        matches!(self, GatewayError::Network(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Unauthorized => Some(401),
            GatewayError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Menu loading failure.
#[derive(Debug, Error)]
pub enum MenuError {
    #[error("No menu available: offline and nothing cached on this device")]
    Unavailable,

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Order submission failure. None of these variants queue the order.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Order has no items and no note")]
    EmptyOrder,

    #[error("No tab selected")]
    MissingTab,

    #[error("Invalid order line: {0}")]
    InvalidLine(String),

    #[error("Tab {number} is not open (status: {status})")]
    TabNotOpen { number: String, status: String },

    #[error("Tab {0} has no known status and offline orders for unknown tabs are blocked")]
    TabStatusUnknown(String),

    #[error(transparent)]
    Remote(GatewayError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl SubmitError {
    /// Message for the notification surface. Server wording is used verbatim.
    pub fn user_message(&self) -> String {
        match self {
            SubmitError::Remote(GatewayError::Rejected { message, .. }) => message.clone(),
            SubmitError::Storage(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

/// Opening a new tab failed.
#[derive(Debug, Error)]
pub enum TabError {
    #[error("Tab number is required")]
    MissingNumber,

    #[error("Opening a tab needs a connection to the order service")]
    Offline,

    #[error("Tab {0} is already open")]
    AlreadyOpen(String),

    #[error(transparent)]
    Remote(GatewayError),
}

impl TabError {
    pub fn user_message(&self) -> String {
        match self {
            TabError::Remote(GatewayError::Rejected { message, .. }) => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Failure of a manual single-record resend.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Offline, cannot resend now")]
    Offline,

    #[error("Pending order {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Truncate an error message to the persisted length, on a char boundary.
pub fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_STORED_ERROR_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_error_respects_char_boundaries() {
        let long = "é".repeat(400);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), MAX_STORED_ERROR_CHARS);

        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn test_rejected_user_message_is_verbatim() {
        let err = SubmitError::Remote(GatewayError::Rejected {
            status: 422,
            message: "Comanda não está aberta".to_string(),
        });
        assert_eq!(err.user_message(), "Comanda não está aberta");
    }

    #[test]
    fn test_only_network_errors_are_network() {
        assert!(GatewayError::Network("down".into()).is_network());
        assert!(!GatewayError::Unauthorized.is_network());
        assert!(!GatewayError::Rejected {
            status: 500,
            message: "boom".into()
        }
        .is_network());
    }
}
