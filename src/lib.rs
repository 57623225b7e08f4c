//! Storefront Cart Library
//!
//! Client-side cart and checkout engine: an optimistic cart model kept in step
//! with a cart backend through an offline action queue and a sync coordinator,
//! plus a gated multi-step checkout. A small axum service implementing the
//! backend contract is included for local development and tests.

// Domain modules
pub mod cart;
pub mod checkout;

// Engine
pub mod controller;
pub mod session;
pub mod sync;

// Infrastructure
pub mod backend;
pub mod config;
pub mod error;
pub mod logger;
pub mod storage;

// Reference service
pub mod router;
pub mod service;

pub use controller::{CartController, LoadOutcome};
pub use error::{BackendError, CheckoutError, StorageError, SyncError};
