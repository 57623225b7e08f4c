//! Shopping Cart Domain Models
//!
//! This module contains all data structures related to the shopping cart
//! business domain: line items, saved-for-later entries, the server's view of a
//! cart and the live product data the validator checks against.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::helpers::total_quantity;

// =============================================================================
// Cart Domain Models
// =============================================================================

/// Returns the default quantity (1) for cart items
fn default_quantity() -> u32 {
    1
}

/// Represents a line in the shopping cart
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    /// Product identifier; unique within a cart
    pub id: String,

    /// Display title
    pub title: String,

    /// Unit price, never negative
    pub price: Decimal,

    /// Optional product image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    /// Quantity of this item (defaults to 1, never 0 while present)
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

impl CartItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, price: Decimal, quantity: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            price,
            image_url: None,
            quantity,
        }
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// price × quantity
    pub fn line_total(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

/// Authoritative cart snapshot returned by every backend call
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerCart {
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub subtotal: Decimal,
    #[serde(default)]
    pub total_quantity: u32,
}

impl ServerCart {
    /// Builds a snapshot with totals derived from `items`
    pub fn from_items(items: Vec<CartItem>) -> Self {
        let subtotal = items.iter().map(CartItem::line_total).sum();
        let total_quantity = total_quantity(&items);
        Self {
            items,
            subtotal,
            total_quantity,
        }
    }

    pub fn item(&self, id: &str) -> Option<&CartItem> {
        self.items.iter().find(|i| i.id == id)
    }
}

/// Live product data used for validation and by the reference service catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Units on hand
    pub stock: u32,
    /// Units held by other carts / unpaid orders
    #[serde(default)]
    pub reserved: u32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_discontinued: bool,
}

fn default_true() -> bool {
    true
}

impl Product {
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: Decimal, stock: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            image_url: None,
            stock,
            reserved: 0,
            is_active: true,
            is_discontinued: false,
        }
    }

    /// Units that can still be sold
    pub fn available(&self) -> u32 {
        self.stock.saturating_sub(self.reserved)
    }

    /// Line item for this product at its current price
    pub fn to_cart_item(&self, quantity: u32) -> CartItem {
        CartItem {
            id: self.id.clone(),
            title: self.name.clone(),
            price: self.price,
            image_url: self.image_url.clone(),
            quantity,
        }
    }
}
