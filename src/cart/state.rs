//! Shopping Cart State
//!
//! `CartModel` is the pure, synchronous representation of what the shopper
//! intends to buy. Every structural mutation ends in [`CartModel::recompute`], so
//! the derived fields (`subtotal`, `total_quantity`, coupon and gift-card
//! amounts) are never set directly.

use rust_decimal::Decimal;
use serde::Serialize;

use super::helpers::{coupon_discount, merge_line_items, normalize_code, round_money, total_quantity};
use super::models::CartItem;

/// Cart state for one session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartModel {
    items: Vec<CartItem>,
    saved: Vec<CartItem>,
    subtotal: Decimal,
    total_quantity: u32,
    coupon_code: Option<String>,
    coupon_discount: Decimal,
    gift_card_code: Option<String>,
    gift_card_amount_applied: Decimal,
}

impl CartModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a model from raw parts, re-deriving every computed field.
    ///
    /// The gift-card amount is re-applied against the new ceiling rather than
    /// trusted.
    pub fn from_parts(
        items: Vec<CartItem>,
        saved: Vec<CartItem>,
        coupon_code: Option<String>,
        gift_card: Option<(String, Decimal)>,
    ) -> Self {
        let mut model = Self::default();
        for item in items {
            if item.quantity > 0 && item.price >= Decimal::ZERO {
                merge_line_items(&mut model.items, vec![item]);
            }
        }
        for mut item in saved {
            if !model.saved.iter().any(|s| s.id == item.id) {
                item.quantity = 1;
                model.saved.push(item);
            }
        }
        model.coupon_code = coupon_code.map(|c| normalize_code(&c)).filter(|c| !c.is_empty());
        model.recompute();
        if let Some((code, amount)) = gift_card {
            model.apply_gift_card(&code, amount);
        }
        model
    }

    // =========================================================================
    // Read-only projections
    // =========================================================================

    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    pub fn saved(&self) -> &[CartItem] {
        &self.saved
    }

    pub fn item(&self, id: &str) -> Option<&CartItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.item(id).is_some()
    }

    pub fn subtotal(&self) -> Decimal {
        self.subtotal
    }

    pub fn total_quantity(&self) -> u32 {
        self.total_quantity
    }

    pub fn coupon_code(&self) -> Option<&str> {
        self.coupon_code.as_deref()
    }

    pub fn coupon_discount(&self) -> Decimal {
        self.coupon_discount
    }

    /// A stored coupon that no longer meets its threshold is inactive
    pub fn coupon_active(&self) -> bool {
        self.coupon_code.is_some() && self.coupon_discount > Decimal::ZERO
    }

    pub fn gift_card_code(&self) -> Option<&str> {
        self.gift_card_code.as_deref()
    }

    pub fn gift_card_amount_applied(&self) -> Decimal {
        self.gift_card_amount_applied
    }

    /// Amount due after coupon and gift card
    pub fn total(&self) -> Decimal {
        (self.subtotal - self.coupon_discount - self.gift_card_amount_applied).max(Decimal::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Adds `quantity` units, merging with an existing line of the same id.
    ///
    /// Returns `false` (and changes nothing) for a zero quantity or a negative
    /// price.
    pub fn add_item(&mut self, item: CartItem) -> bool {
        if item.quantity == 0 || item.price < Decimal::ZERO {
            return false;
        }
        merge_line_items(&mut self.items, vec![item]);
        self.recompute();
        true
    }

    pub fn remove_item(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.id != id);
        let removed = self.items.len() != before;
        self.recompute();
        removed
    }

    /// Sets the quantity of an existing line, clamped to at least 1.
    ///
    /// Removal on zero is the controller's job.
    pub fn set_quantity(&mut self, id: &str, quantity: u32) -> bool {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        item.quantity = quantity.max(1);
        self.recompute();
        true
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.recompute();
    }

    /// Applies a coupon from the fixed rule table.
    ///
    /// A code that is unknown or does not qualify at the current subtotal is not
    /// stored, and replaces any previously applied coupon.
    pub fn apply_coupon(&mut self, code: &str) -> bool {
        let code = normalize_code(code);
        let discount = coupon_discount(&code, self.subtotal);
        if discount > Decimal::ZERO {
            self.coupon_code = Some(code);
        } else {
            self.coupon_code = None;
        }
        self.recompute();
        self.coupon_code.is_some()
    }

    pub fn remove_coupon(&mut self) {
        self.coupon_code = None;
        self.recompute();
    }

    /// Applies up to `amount` from a gift card, capped at the discounted subtotal.
    ///
    /// The code is stored only when something was applied.
    pub fn apply_gift_card(&mut self, code: &str, amount: Decimal) -> Decimal {
        let code = normalize_code(code);
        let applied = round_money(amount.max(Decimal::ZERO).min(self.gift_card_ceiling()));
        if applied > Decimal::ZERO && !code.is_empty() {
            self.gift_card_code = Some(code);
            self.gift_card_amount_applied = applied;
        } else {
            self.gift_card_code = None;
            self.gift_card_amount_applied = Decimal::ZERO;
        }
        self.gift_card_amount_applied
    }

    pub fn remove_gift_card(&mut self) {
        self.gift_card_code = None;
        self.gift_card_amount_applied = Decimal::ZERO;
    }

    /// Moves a line to the saved list, pinned to quantity 1
    pub fn save_for_later(&mut self, id: &str) -> bool {
        let Some(pos) = self.items.iter().position(|i| i.id == id) else {
            return false;
        };
        let mut item = self.items.remove(pos);
        item.quantity = 1;
        if !self.saved.iter().any(|s| s.id == item.id) {
            self.saved.push(item);
        }
        self.recompute();
        true
    }

    /// Moves a saved entry back into the cart, merging with an existing line
    pub fn move_to_cart(&mut self, id: &str) -> bool {
        let Some(pos) = self.saved.iter().position(|i| i.id == id) else {
            return false;
        };
        let mut item = self.saved.remove(pos);
        item.quantity = 1;
        merge_line_items(&mut self.items, vec![item]);
        self.recompute();
        true
    }

    pub fn remove_saved(&mut self, id: &str) -> bool {
        let before = self.saved.len();
        self.saved.retain(|i| i.id != id);
        self.saved.len() != before
    }

    /// Replaces a line wholesale (used by reconciliation), or removes it on `None`
    pub(crate) fn put_item(&mut self, id: &str, item: Option<CartItem>) {
        match (self.items.iter().position(|i| i.id == id), item) {
            (Some(pos), Some(item)) => self.items[pos] = item,
            (Some(pos), None) => {
                self.items.remove(pos);
            }
            (None, Some(item)) => self.items.push(item),
            (None, None) => {}
        }
    }

    /// Re-derives subtotal, quantity, coupon discount and gift-card amount.
    ///
    /// Idempotent. Coupons are evaluated against the current subtotal, so a
    /// threshold coupon goes inactive (code kept) when the subtotal drops and
    /// comes back when it recovers. The gift card only ever shrinks here.
    pub fn recompute(&mut self) {
        self.subtotal = round_money(self.items.iter().map(CartItem::line_total).sum());
        self.total_quantity = total_quantity(&self.items);

        self.coupon_discount = match &self.coupon_code {
            Some(code) => coupon_discount(code, self.subtotal),
            None => Decimal::ZERO,
        };

        let ceiling = self.gift_card_ceiling();
        if self.gift_card_amount_applied > ceiling {
            self.gift_card_amount_applied = ceiling;
        }
        if self.gift_card_amount_applied <= Decimal::ZERO {
            self.gift_card_amount_applied = Decimal::ZERO;
            self.gift_card_code = None;
        }
    }

    fn gift_card_ceiling(&self) -> Decimal {
        (self.subtotal - self.coupon_discount).max(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, price: i64, quantity: u32) -> CartItem {
        CartItem::new(id, id.to_uppercase(), Decimal::from(price), quantity)
    }

    fn assert_totals(cart: &CartModel) {
        let subtotal: Decimal = cart.items().iter().map(|i| i.price * Decimal::from(i.quantity)).sum();
        let quantity: u64 = cart.items().iter().map(|i| u64::from(i.quantity)).sum();
        let quantity = u32::try_from(quantity).unwrap_or(u32::MAX);
        assert_eq!(cart.subtotal(), subtotal);
        assert_eq!(cart.total_quantity(), quantity);
        assert!(cart.gift_card_amount_applied() <= cart.subtotal() - cart.coupon_discount());
    }

    #[test]
    fn test_totals_hold_after_every_mutation() {
        let mut cart = CartModel::new();
        cart.add_item(item("p1", 10, 2));
        assert_totals(&cart);
        cart.add_item(CartItem::new("p2", "P2", Decimal::new(1999, 2), 3));
        assert_totals(&cart);
        cart.set_quantity("p1", 7);
        assert_totals(&cart);
        cart.remove_item("p2");
        assert_totals(&cart);
        cart.set_quantity("missing", 4);
        assert_totals(&cart);
        cart.clear();
        assert_totals(&cart);
        assert_eq!(cart.subtotal(), Decimal::ZERO);
    }

    #[test]
    fn test_total_quantity_saturates_at_large_quantities() {
        let mut cart = CartModel::new();
        cart.add_item(item("p1", 1, 3_000_000_000));
        cart.add_item(item("p2", 1, 3_000_000_000));

        assert_eq!(cart.items().len(), 2);
        assert_eq!(cart.total_quantity(), u32::MAX);
        assert_eq!(cart.subtotal(), Decimal::from(6_000_000_000u64));
        assert_totals(&cart);

        cart.remove_item("p2");
        assert_eq!(cart.total_quantity(), 3_000_000_000);
    }

    #[test]
    fn test_random_mutation_sequences_keep_invariants() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let ids = ["p1", "p2", "p3", "p4"];
        for seed in 0..64u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut cart = CartModel::new();
            if rng.gen_bool(0.5) {
                cart.apply_coupon("SAVE10");
            }

            for _ in 0..50 {
                let id = ids[rng.gen_range(0..ids.len())];
                let quantity = match rng.gen_range(0..10) {
                    0 => u32::MAX - rng.gen_range(0..3),
                    _ => rng.gen_range(0..6),
                };
                match rng.gen_range(0..3) {
                    0 => {
                        let accepted = cart.add_item(item(id, rng.gen_range(1..40), quantity));
                        assert_eq!(accepted, quantity > 0);
                    }
                    1 => {
                        let present = cart.contains(id);
                        assert_eq!(cart.remove_item(id), present);
                        assert!(!cart.contains(id));
                    }
                    _ => {
                        let present = cart.contains(id);
                        assert_eq!(cart.set_quantity(id, quantity), present);
                        if present {
                            assert_eq!(cart.item(id).map(|i| i.quantity), Some(quantity.max(1)));
                        }
                    }
                }

                assert_totals(&cart);
                let mut seen: Vec<&str> = cart.items().iter().map(|i| i.id.as_str()).collect();
                seen.sort_unstable();
                seen.dedup();
                assert_eq!(seen.len(), cart.items().len(), "seed {seed}: duplicate line");
                assert!(cart.items().iter().all(|i| i.quantity >= 1));
                assert!(cart.total() >= Decimal::ZERO);
            }
        }
    }

    #[test]
    fn test_duplicate_add_merges_lines() {
        let mut cart = CartModel::new();
        cart.add_item(item("p1", 5, 1));
        cart.add_item(item("p1", 5, 2));

        assert_eq!(cart.items().len(), 1);
        assert_eq!(cart.item("p1").map(|i| i.quantity), Some(3));
    }

    #[test]
    fn test_add_rejects_zero_quantity_and_negative_price() {
        let mut cart = CartModel::new();
        assert!(!cart.add_item(item("p1", 5, 0)));
        assert!(!cart.add_item(CartItem::new("p2", "P2", Decimal::from(-1), 1)));
        assert!(cart.is_empty());
    }

    #[test]
    fn test_set_quantity_clamps_to_one() {
        let mut cart = CartModel::new();
        cart.add_item(item("p1", 5, 4));
        cart.set_quantity("p1", 0);
        assert_eq!(cart.item("p1").map(|i| i.quantity), Some(1));
    }

    #[test]
    fn test_coupon_goes_inactive_and_requalifies() {
        let mut cart = CartModel::new();
        cart.add_item(item("a", 80, 1));
        cart.add_item(item("b", 70, 1));
        assert!(cart.apply_coupon(" festive20 "));
        assert_eq!(cart.coupon_discount(), Decimal::from(30));

        cart.remove_item("b");
        assert_eq!(cart.subtotal(), Decimal::from(80));
        assert_eq!(cart.coupon_discount(), Decimal::ZERO);
        assert_eq!(cart.coupon_code(), Some("FESTIVE20"));
        assert!(!cart.coupon_active());

        cart.add_item(item("c", 40, 1));
        assert_eq!(cart.coupon_discount(), Decimal::from(24));
        assert!(cart.coupon_active());
    }

    #[test]
    fn test_unqualified_coupon_is_not_stored() {
        let mut cart = CartModel::new();
        cart.add_item(item("a", 50, 1));
        assert!(!cart.apply_coupon("WELCOME50"));
        assert_eq!(cart.coupon_code(), None);
        assert!(!cart.apply_coupon("NOPE"));
        assert_eq!(cart.coupon_code(), None);
        assert_eq!(cart.coupon_discount(), Decimal::ZERO);
    }

    #[test]
    fn test_gift_card_capped_to_discounted_subtotal() {
        let mut cart = CartModel::new();
        cart.add_item(item("a", 100, 1));
        assert!(cart.apply_coupon("FESTIVE20"));
        assert_eq!(cart.coupon_discount(), Decimal::from(20));

        let applied = cart.apply_gift_card("gc-1234-5678", Decimal::from(90));
        assert_eq!(applied, Decimal::from(80));
        assert_eq!(cart.gift_card_amount_applied(), Decimal::from(80));
        assert_eq!(cart.gift_card_code(), Some("GC-1234-5678"));
        assert_eq!(cart.total(), Decimal::ZERO);
    }

    #[test]
    fn test_gift_card_shrinks_and_clears() {
        let mut cart = CartModel::new();
        cart.add_item(item("a", 30, 1));
        cart.add_item(item("b", 20, 1));
        cart.apply_gift_card("GC-1111-2222", Decimal::from(40));
        assert_eq!(cart.gift_card_amount_applied(), Decimal::from(40));

        cart.remove_item("a");
        assert_eq!(cart.gift_card_amount_applied(), Decimal::from(20));

        cart.clear();
        assert_eq!(cart.gift_card_amount_applied(), Decimal::ZERO);
        assert_eq!(cart.gift_card_code(), None);
    }

    #[test]
    fn test_gift_card_zero_amount_not_stored() {
        let mut cart = CartModel::new();
        assert_eq!(cart.apply_gift_card("GC-1111-2222", Decimal::from(10)), Decimal::ZERO);
        assert_eq!(cart.gift_card_code(), None);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let mut cart = CartModel::new();
        cart.add_item(item("a", 120, 2));
        cart.apply_coupon("WELCOME50");
        cart.apply_gift_card("GC-1111-2222", Decimal::from(15));

        cart.recompute();
        let once = cart.clone();
        cart.recompute();
        assert_eq!(cart, once);
    }

    #[test]
    fn test_save_for_later_round_trip() {
        let mut cart = CartModel::new();
        cart.add_item(item("a", 10, 3));
        cart.add_item(item("b", 5, 1));

        assert!(cart.save_for_later("a"));
        assert_eq!(cart.saved().len(), 1);
        assert_eq!(cart.saved()[0].quantity, 1);
        assert_eq!(cart.subtotal(), Decimal::from(5));

        // moving back while a line already exists merges into it
        cart.add_item(item("a", 10, 2));
        assert!(cart.move_to_cart("a"));
        assert_eq!(cart.item("a").map(|i| i.quantity), Some(3));
        assert!(cart.saved().is_empty());

        cart.save_for_later("b");
        assert!(cart.remove_saved("b"));
        assert!(!cart.move_to_cart("b"));
    }

    #[test]
    fn test_from_parts_rederives_totals() {
        let model = CartModel::from_parts(
            vec![item("a", 60, 2), item("a", 60, 1), item("z", 10, 0)],
            vec![item("s", 3, 4)],
            Some("festive20".into()),
            Some(("GC-1111-2222".into(), Decimal::from(500))),
        );
        assert_eq!(model.items().len(), 1);
        assert_eq!(model.total_quantity(), 3);
        assert_eq!(model.subtotal(), Decimal::from(180));
        assert_eq!(model.coupon_discount(), Decimal::from(36));
        assert_eq!(model.gift_card_amount_applied(), Decimal::from(144));
        assert_eq!(model.saved()[0].quantity, 1);
    }
}
