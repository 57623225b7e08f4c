//! REST API handlers for cart operations
//!
//! Every cart endpoint answers with a tagged `CartResponse` envelope.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch},
    Json, Router,
};

use super::state::SharedState;
use crate::backend::{AddItemRequest, CartQuery, CartResponse, SetQuantityRequest};
use crate::cart::helpers::format_item_summary;
use crate::cart::models::ServerCart;
use crate::error::{BackendError, BackendResult};
use crate::session::GUEST_USER;

/// Creates routes for cart-related operations
pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/cart", get(fetch_cart).delete(clear_cart))
        .route("/cart/items", axum::routing::post(add_item))
        .route("/cart/items/:id", patch(set_quantity).delete(remove_item))
        .route("/products", get(list_products))
}

/// Returns the requested user id or the guest id when absent or blank
pub fn resolve_user_id(query: CartQuery) -> String {
    query
        .user_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| GUEST_USER.to_string())
}

fn respond(result: BackendResult<ServerCart>) -> impl IntoResponse {
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(BackendError::NotFound(_)) => StatusCode::NOT_FOUND,
        Err(BackendError::Rejected(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(CartResponse::from_result(result)))
}

/// Endpoint: GET /cart?userId=
async fn fetch_cart(State(state): State<SharedState>, Query(query): Query<CartQuery>) -> impl IntoResponse {
    let user_id = resolve_user_id(query);
    respond(Ok(state.store.cart(&user_id)))
}

/// Endpoint: POST /cart/items
async fn add_item(
    State(state): State<SharedState>,
    Query(query): Query<CartQuery>,
    Json(payload): Json<AddItemRequest>,
) -> impl IntoResponse {
    let user_id = resolve_user_id(query);
    let result = state.store.add_item(&user_id, &payload.product_id, payload.quantity);
    if let Err(e) = &result {
        tracing::debug!(user_id = %user_id, product_id = %payload.product_id, error = %e, "Add to cart refused");
    }
    respond(result)
}

/// Endpoint: PATCH /cart/items/{id}
async fn set_quantity(
    State(state): State<SharedState>,
    Path(item_id): Path<String>,
    Query(query): Query<CartQuery>,
    Json(payload): Json<SetQuantityRequest>,
) -> impl IntoResponse {
    let user_id = resolve_user_id(query);
    respond(state.store.set_quantity(&user_id, &item_id, payload.quantity))
}

/// Endpoint: DELETE /cart/items/{id}
async fn remove_item(
    State(state): State<SharedState>,
    Path(item_id): Path<String>,
    Query(query): Query<CartQuery>,
) -> impl IntoResponse {
    let user_id = resolve_user_id(query);
    respond(state.store.remove_item(&user_id, &item_id))
}

/// Endpoint: DELETE /cart
async fn clear_cart(State(state): State<SharedState>, Query(query): Query<CartQuery>) -> impl IntoResponse {
    let user_id = resolve_user_id(query);
    let items = state.store.cart(&user_id).items;
    if !items.is_empty() {
        tracing::info!(user_id = %user_id, items = %format_item_summary(&items), "Cart cleared");
    }
    respond(state.store.clear(&user_id))
}

/// Endpoint: GET /products
async fn list_products(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.store.products())
}
