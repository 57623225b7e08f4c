//! Checkout data types

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::cart::models::CartItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStepId {
    Cart,
    Shipping,
    Billing,
    Payment,
    Review,
}

impl CheckoutStepId {
    /// Steps in the order they are walked
    pub const ALL: [CheckoutStepId; 5] = [
        CheckoutStepId::Cart,
        CheckoutStepId::Shipping,
        CheckoutStepId::Billing,
        CheckoutStepId::Payment,
        CheckoutStepId::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutStepId::Cart => "cart",
            CheckoutStepId::Shipping => "shipping",
            CheckoutStepId::Billing => "billing",
            CheckoutStepId::Payment => "payment",
            CheckoutStepId::Review => "review",
        }
    }
}

impl fmt::Display for CheckoutStepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a step's rule function; only errors block
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl StepValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub(crate) fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutStep {
    pub id: CheckoutStepId,
    pub order: usize,
    pub is_completed: bool,
    pub is_active: bool,
    pub validation: StepValidation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub full_name: String,
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    pub postal_code: String,
    pub country: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShippingMethod {
    Standard,
    Express,
    Overnight,
}

impl ShippingMethod {
    /// Stated delivery range in days, inclusive
    pub fn delivery_days(&self) -> (u32, u32) {
        match self {
            ShippingMethod::Standard => (5, 7),
            ShippingMethod::Express => (2, 3),
            ShippingMethod::Overnight => (1, 1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDetails {
    pub holder: String,
    pub number: String,
    pub expiry_month: u32,
    pub expiry_year: i32,
    pub cvv: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentMethod {
    Card(CardDetails),
    PayPal { email: String },
    CashOnDelivery,
}

/// Everything the shopper enters during checkout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutData {
    pub shipping_address: Option<Address>,
    pub shipping_method: Option<ShippingMethod>,
    pub billing_same_as_shipping: bool,
    pub billing_address: Option<Address>,
    pub payment: Option<PaymentMethod>,
    pub accepted_terms: bool,
}

impl Default for CheckoutData {
    fn default() -> Self {
        Self {
            shipping_address: None,
            shipping_method: None,
            billing_same_as_shipping: true,
            billing_address: None,
            payment: None,
            accepted_terms: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEstimate {
    pub earliest: NaiveDate,
    pub latest: NaiveDate,
}

/// Stamped by a successful checkout
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderConfirmation {
    pub confirmation_id: String,
    pub placed_at: DateTime<Utc>,
    pub items: Vec<CartItem>,
    pub subtotal: Decimal,
    pub coupon_discount: Decimal,
    pub gift_card_amount: Decimal,
    pub total: Decimal,
    pub shipping_method: ShippingMethod,
    pub estimated_delivery: DeliveryEstimate,
}
