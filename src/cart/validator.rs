//! Cart validation rules
//!
//! Stateless checks over a cart snapshot and live product data. Errors block
//! checkout, warnings are informational. Nothing here fails or panics.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Serialize;

use super::helpers::find_coupon;
use super::models::{CartItem, Product};
use super::state::CartModel;

pub const MIN_QUANTITY: u32 = 1;
pub const MAX_QUANTITY: u32 = 99;
pub const MAX_DISTINCT_ITEMS: usize = 50;
pub const MIN_ORDER_VALUE: u32 = 5;
pub const MAX_ORDER_VALUE: u32 = 10_000;
/// Remaining stock at or below this triggers a warning
pub const LOW_STOCK_THRESHOLD: u32 = 5;

/// Codes from past campaigns
const EXPIRED_COUPONS: &[&str] = &["SUMMER2023", "BLACKFRIDAY22", "NEWYEAR23"];

/// Price drift tolerance (0.01)
const PRICE_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Stock,
    Price,
    Availability,
    Quantity,
    Product,
    Coupon,
    GiftCard,
    Cart,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub message: String,
}

/// Outcome of a validation run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_error(&self, kind: IssueKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }

    pub fn has_warning(&self, kind: IssueKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    fn error(&mut self, kind: IssueKind, item_id: Option<&str>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            kind,
            severity: Severity::Error,
            item_id: item_id.map(str::to_string),
            message: message.into(),
        });
    }

    fn warning(&mut self, kind: IssueKind, item_id: Option<&str>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            kind,
            severity: Severity::Warning,
            item_id: item_id.map(str::to_string),
            message: message.into(),
        });
    }
}

/// Validate every line and the cart as a whole
pub fn validate(cart: &CartModel, products: &HashMap<String, Product>) -> ValidationReport {
    let mut report = ValidationReport::default();

    for item in cart.items() {
        validate_item(item, products.get(&item.id), &mut report);
    }

    if cart.items().len() > MAX_DISTINCT_ITEMS {
        report.error(
            IssueKind::Cart,
            None,
            format!("Cart cannot hold more than {} different products", MAX_DISTINCT_ITEMS),
        );
    }

    if !cart.is_empty() {
        let subtotal = cart.subtotal();
        if subtotal < Decimal::from(MIN_ORDER_VALUE) {
            report.error(
                IssueKind::Cart,
                None,
                format!("Minimum order value is {}", MIN_ORDER_VALUE),
            );
        }
        if subtotal > Decimal::from(MAX_ORDER_VALUE) {
            report.error(
                IssueKind::Cart,
                None,
                format!("Maximum order value is {}", MAX_ORDER_VALUE),
            );
        }
    }

    if let Some(code) = cart.coupon_code() {
        validate_coupon(code, cart, &mut report);
    }
    if let Some(code) = cart.gift_card_code() {
        if !is_gift_card_format(code) {
            report.error(IssueKind::GiftCard, None, format!("Gift card {} is malformed", code));
        }
    }

    report
}

/// `validate` plus the requirements for entering checkout
pub fn validate_for_checkout(
    cart: &CartModel,
    products: &HashMap<String, Product>,
) -> ValidationReport {
    let mut report = validate(cart, products);
    if cart.is_empty() {
        report.error(IssueKind::Cart, None, "Cart is empty");
    } else if cart.subtotal() <= Decimal::ZERO {
        report.error(IssueKind::Cart, None, "Cart total must be positive");
    }
    report
}

fn validate_item(item: &CartItem, product: Option<&Product>, report: &mut ValidationReport) {
    let id = Some(item.id.as_str());

    if !(MIN_QUANTITY..=MAX_QUANTITY).contains(&item.quantity) {
        report.error(
            IssueKind::Quantity,
            id,
            format!(
                "Quantity for {} must be between {} and {}",
                item.title, MIN_QUANTITY, MAX_QUANTITY
            ),
        );
    }

    let Some(product) = product else {
        report.error(IssueKind::Product, id, format!("{} no longer exists", item.title));
        return;
    };

    if product.is_discontinued {
        report.error(
            IssueKind::Availability,
            id,
            format!("{} has been discontinued", product.name),
        );
    } else if !product.is_active {
        report.error(
            IssueKind::Availability,
            id,
            format!("{} is currently unavailable", product.name),
        );
    }

    let available = product.available();
    if available < item.quantity {
        report.error(
            IssueKind::Stock,
            id,
            format!("Only {} of {} in stock", available, product.name),
        );
    } else if available - item.quantity <= LOW_STOCK_THRESHOLD {
        report.warning(
            IssueKind::Stock,
            id,
            format!("{} is running low ({} left)", product.name, available),
        );
    }

    if (product.price - item.price).abs() > PRICE_TOLERANCE {
        report.warning(
            IssueKind::Price,
            id,
            format!("Price of {} changed from {} to {}", product.name, item.price, product.price),
        );
    }
}

fn validate_coupon(code: &str, cart: &CartModel, report: &mut ValidationReport) {
    if !is_coupon_format(code) {
        report.error(IssueKind::Coupon, None, format!("Coupon {} is malformed", code));
    } else if EXPIRED_COUPONS.contains(&code) {
        report.error(IssueKind::Coupon, None, format!("Coupon {} has expired", code));
    } else if find_coupon(code).is_none() {
        report.warning(IssueKind::Coupon, None, format!("Coupon {} is not recognised", code));
    } else if !cart.coupon_active() {
        report.warning(
            IssueKind::Coupon,
            None,
            format!("Coupon {} no longer qualifies for this cart", code),
        );
    }
}

fn is_coupon_format(code: &str) -> bool {
    (3..=20).contains(&code.len())
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// `GC-XXXX-XXXX`, alphanumeric groups
fn is_gift_card_format(code: &str) -> bool {
    let parts: Vec<&str> = code.split('-').collect();
    parts.len() == 3
        && parts[0] == "GC"
        && parts[1..]
            .iter()
            .all(|p| p.len() == 4 && p.chars().all(|c| c.is_ascii_alphanumeric()))
}
