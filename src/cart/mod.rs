//! Shopping Cart Domain Module
//!
//! This module contains the cart's pure business logic:
//! - Domain models (CartItem, ServerCart, Product)
//! - Pricing helpers (money rounding, coupon rule table)
//! - The cart state model and its recompute rules
//! - Validation against live product data
//! - Durable snapshots

pub mod helpers;
pub mod models;
pub mod persistence;
pub mod state;
pub mod validator;

// Re-export commonly used types for convenience
pub use models::{CartItem, Product, ServerCart};
pub use persistence::CartPersistence;
pub use state::CartModel;
pub use validator::{validate, validate_for_checkout, ValidationReport};
