//! Reference Cart Service
//!
//! An axum implementation of the cart REST contract, backed by an in-memory
//! store. The binary serves it for local development and the integration
//! tests drive it with `oneshot`.

pub mod handlers;
pub mod state;
pub mod store;

// Re-export commonly used types for convenience
pub use handlers::routes;
pub use state::{AppState, SharedState};
pub use store::CartStore;
