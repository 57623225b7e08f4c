//! Shopping Cart Business Logic Helpers
//!
//! Pricing helpers (money rounding, the coupon rule table) and small line-item
//! utilities shared by the cart model and the reference service.

use rust_decimal::prelude::*;

use super::models::CartItem;

/// Monetary values are kept at 2 decimal places, half away from zero
const DECIMAL_PLACES: u32 = 2;

/// Round a monetary amount to cents
#[inline]
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert a stored f64 back into a `Decimal`, treating garbage as zero
#[inline]
pub fn money_from_f64(value: f64) -> Decimal {
    if !value.is_finite() || value < 0.0 {
        return Decimal::ZERO;
    }
    round_money(Decimal::from_f64(value).unwrap_or_default())
}

/// Convert a `Decimal` to f64 for primitive persistence
#[inline]
pub fn money_to_f64(value: Decimal) -> f64 {
    round_money(value).to_f64().unwrap_or_default()
}

// =============================================================================
// Coupon rule table
// =============================================================================

/// How a coupon computes its discount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponKind {
    /// Percentage of the subtotal
    Percent(u32),
    /// Flat amount off
    Flat(u32),
}

/// A fixed, client-side coupon rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CouponRule {
    pub code: &'static str,
    pub kind: CouponKind,
    /// Subtotal required for the coupon to qualify
    pub min_subtotal: u32,
}

/// Coupons the storefront knows about
pub const COUPON_RULES: &[CouponRule] = &[
    CouponRule {
        code: "SAVE10",
        kind: CouponKind::Percent(10),
        min_subtotal: 0,
    },
    CouponRule {
        code: "FESTIVE20",
        kind: CouponKind::Percent(20),
        min_subtotal: 100,
    },
    CouponRule {
        code: "WELCOME50",
        kind: CouponKind::Flat(50),
        min_subtotal: 200,
    },
];

/// Uppercase and trim a user-entered coupon or gift-card code
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Looks up a coupon rule by already-normalized code
pub fn find_coupon(code: &str) -> Option<&'static CouponRule> {
    COUPON_RULES.iter().find(|rule| rule.code == code)
}

/// Discount a coupon grants at the given subtotal.
///
/// Unknown codes and unmet thresholds both yield zero. The discount never
/// exceeds the subtotal.
pub fn coupon_discount(code: &str, subtotal: Decimal) -> Decimal {
    let Some(rule) = find_coupon(code) else {
        return Decimal::ZERO;
    };
    if subtotal <= Decimal::ZERO || subtotal < Decimal::from(rule.min_subtotal) {
        return Decimal::ZERO;
    }

    let discount = match rule.kind {
        CouponKind::Percent(pct) => subtotal * Decimal::from(pct) / Decimal::ONE_HUNDRED,
        CouponKind::Flat(amount) => Decimal::from(amount),
    };
    round_money(discount.min(subtotal))
}

// =============================================================================
// Line-item helpers
// =============================================================================

/// Merges `incoming` into `items`, aggregating quantities for existing
/// entries and appending brand new ones.
///
/// Existing lines keep their title and price; only quantity changes.
pub fn merge_line_items(items: &mut Vec<CartItem>, incoming: Vec<CartItem>) {
    for item in incoming {
        if let Some(existing) = items.iter_mut().find(|i| i.id == item.id) {
            existing.quantity = existing.quantity.saturating_add(item.quantity);
        } else {
            items.push(item);
        }
    }
}

/// Sum of line quantities, saturating at `u32::MAX`
pub fn total_quantity(items: &[CartItem]) -> u32 {
    items
        .iter()
        .fold(0u32, |total, item| total.saturating_add(item.quantity))
}

/// Produces a human-readable one-line summary for a list of cart items.
///
/// Example output: `"2x Apple, 1x Banana"`.
pub fn format_item_summary(items: &[CartItem]) -> String {
    items
        .iter()
        .map(|i| format!("{}x {}", i.quantity, i.title))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coupon_table() {
        assert_eq!(coupon_discount("SAVE10", Decimal::new(4550, 2)), Decimal::new(455, 2));
        assert_eq!(coupon_discount("FESTIVE20", Decimal::from(150)), Decimal::from(30));
        assert_eq!(coupon_discount("FESTIVE20", Decimal::from(99)), Decimal::ZERO);
        assert_eq!(coupon_discount("WELCOME50", Decimal::from(200)), Decimal::from(50));
        assert_eq!(coupon_discount("WELCOME50", Decimal::new(19999, 2)), Decimal::ZERO);
        assert_eq!(coupon_discount("BOGUS", Decimal::from(500)), Decimal::ZERO);
        assert_eq!(coupon_discount("SAVE10", Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("  save10 "), "SAVE10");
    }

    #[test]
    fn test_merge_aggregates_quantity() {
        let mut items = vec![CartItem::new("apple", "Apple", Decimal::ONE, 2)];
        merge_line_items(
            &mut items,
            vec![
                CartItem::new("apple", "Apple (renamed)", Decimal::TWO, 3),
                CartItem::new("banana", "Banana", Decimal::ONE, 1),
            ],
        );

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].quantity, 5, "Apple quantity should aggregate to 2+3=5");
        assert_eq!(items[0].title, "Apple");
        assert_eq!(items[1].id, "banana");
        assert_eq!(format_item_summary(&items), "5x Apple, 1x Banana");
    }

    #[test]
    fn test_money_conversions() {
        assert_eq!(money_from_f64(19.999), Decimal::new(2000, 2));
        assert_eq!(money_from_f64(f64::NAN), Decimal::ZERO);
        assert_eq!(money_from_f64(-3.0), Decimal::ZERO);
        assert_eq!(money_to_f64(Decimal::new(1005, 2)), 10.05);
    }
}
