//! Cart backend boundary
//!
//! The engine only sees `CartBackend`: five calls that each return a full,
//! authoritative cart snapshot or fail. Two implementations ship with the crate:
//! an in-process one over the reference store and a `reqwest` client for the
//! HTTP contract.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cart::models::ServerCart;
use crate::error::{BackendError, BackendResult};

pub use http::{CredentialSource, HttpCartBackend, StaticToken};
pub use memory::MemoryBackend;

/// Capability used by the controller, queue and sync coordinator
#[async_trait]
pub trait CartBackend: Send + Sync {
    async fn fetch_cart(&self, user_id: &str) -> BackendResult<ServerCart>;

    async fn add_item(&self, user_id: &str, product_id: &str, quantity: u32)
        -> BackendResult<ServerCart>;

    async fn set_quantity(&self, user_id: &str, item_id: &str, quantity: u32)
        -> BackendResult<ServerCart>;

    async fn remove_item(&self, user_id: &str, item_id: &str) -> BackendResult<ServerCart>;

    async fn clear_cart(&self, user_id: &str) -> BackendResult<ServerCart>;
}

/// A cart mutation that can be sent now or replayed later from the offline queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CartOperation {
    AddItem { product_id: String, quantity: u32 },
    SetQuantity { item_id: String, quantity: u32 },
    RemoveItem { item_id: String },
    Clear,
}

impl CartOperation {
    /// Stable operation name recorded on queued actions
    pub fn name(&self) -> &'static str {
        match self {
            CartOperation::AddItem { .. } => "add_item",
            CartOperation::SetQuantity { .. } => "set_quantity",
            CartOperation::RemoveItem { .. } => "remove_item",
            CartOperation::Clear => "clear",
        }
    }

    /// Line the operation targets; `None` for whole-cart operations
    pub fn item_id(&self) -> Option<&str> {
        match self {
            CartOperation::AddItem { product_id, .. } => Some(product_id.as_str()),
            CartOperation::SetQuantity { item_id, .. } | CartOperation::RemoveItem { item_id } => {
                Some(item_id.as_str())
            }
            CartOperation::Clear => None,
        }
    }

    pub async fn execute(&self, backend: &dyn CartBackend, user_id: &str) -> BackendResult<ServerCart> {
        match self {
            CartOperation::AddItem {
                product_id,
                quantity,
            } => backend.add_item(user_id, product_id, *quantity).await,
            CartOperation::SetQuantity { item_id, quantity } => {
                backend.set_quantity(user_id, item_id, *quantity).await
            }
            CartOperation::RemoveItem { item_id } => backend.remove_item(user_id, item_id).await,
            CartOperation::Clear => backend.clear_cart(user_id).await,
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Query string carried by every cart route
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartQuery {
    pub user_id: Option<String>,
}

/// Body of `POST /cart/items`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddItemRequest {
    pub product_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

/// Body of `PATCH /cart/items/{id}`
#[derive(Debug, Serialize, Deserialize)]
pub struct SetQuantityRequest {
    pub quantity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvalidRequest,
    Internal,
}

/// Every cart endpoint answers with exactly one of these
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CartResponse {
    Ok { cart: ServerCart },
    Error { code: ErrorCode, message: String },
}

impl CartResponse {
    pub fn from_result(result: BackendResult<ServerCart>) -> Self {
        match result {
            Ok(cart) => CartResponse::Ok { cart },
            Err(err) => {
                let code = match &err {
                    BackendError::NotFound(_) => ErrorCode::NotFound,
                    BackendError::Rejected(_) => ErrorCode::InvalidRequest,
                    _ => ErrorCode::Internal,
                };
                CartResponse::Error {
                    code,
                    message: err.to_string(),
                }
            }
        }
    }

    /// Converts the envelope back into a backend result; `status` is the HTTP status it came with
    pub fn into_result(self, status: u16) -> BackendResult<ServerCart> {
        match self {
            CartResponse::Ok { cart } => Ok(cart),
            CartResponse::Error { code, message } => Err(match code {
                ErrorCode::NotFound => BackendError::NotFound(message),
                ErrorCode::InvalidRequest => BackendError::Rejected(message),
                ErrorCode::Internal => BackendError::Server { status, message },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_payload_shape() {
        let op = CartOperation::SetQuantity {
            item_id: "p1".into(),
            quantity: 4,
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value, json!({"type": "set_quantity", "item_id": "p1", "quantity": 4}));
        assert_eq!(op.name(), "set_quantity");
        assert_eq!(op.item_id(), Some("p1"));
        assert_eq!(CartOperation::Clear.item_id(), None);
    }

    #[test]
    fn test_response_envelope_is_tagged() {
        let ok = CartResponse::from_result(Ok(ServerCart::default()));
        assert_eq!(serde_json::to_value(&ok).unwrap()["status"], "ok");

        let err = CartResponse::from_result(Err(BackendError::NotFound("p9".into())));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], "not_found");

        let parsed: CartResponse = serde_json::from_value(value).unwrap();
        assert!(matches!(parsed.into_result(404), Err(BackendError::NotFound(_))));
    }
}
