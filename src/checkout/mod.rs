//! Checkout Module
//!
//! - Step, address and payment types
//! - Per-step validation rules
//! - The checkout state machine
//! - Order confirmation storage

pub mod machine;
pub mod models;
pub mod orders;
pub mod rules;

pub use machine::CheckoutStateMachine;
pub use models::{
    Address, CardDetails, CheckoutData, CheckoutStep, CheckoutStepId, DeliveryEstimate,
    OrderConfirmation, PaymentMethod, ShippingMethod, StepValidation,
};
pub use orders::{ArenaOrderRepository, OrderId, OrderRepository};
