//! Reference Service State
//!
//! Shared state handed to every axum handler.

use std::sync::Arc;

use super::store::CartStore;

/// Shared application state that can be safely passed between threads
pub type SharedState = Arc<AppState>;

/// Core application state: the cart store (carts plus product catalog)
pub struct AppState {
    pub store: Arc<CartStore>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    /// Creates state over the demo catalog
    pub fn new() -> Self {
        Self::with_store(Arc::new(CartStore::demo()))
    }

    /// Creates state over an existing store, e.g. one shared with a `MemoryBackend`
    pub fn with_store(store: Arc<CartStore>) -> Self {
        tracing::info!(products = store.products().len(), "Cart service state ready");
        Self { store }
    }
}
