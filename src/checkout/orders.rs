//! Storage for placed order confirmations

use std::collections::HashMap;

use super::models::OrderConfirmation;

/// Stable handle into an `OrderRepository`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderId(pub usize);

pub trait OrderRepository: Send {
    fn insert(&mut self, confirmation: OrderConfirmation) -> OrderId;

    fn get(&self, id: OrderId) -> Option<&OrderConfirmation>;

    fn find_by_confirmation(&self, confirmation_id: &str) -> Option<&OrderConfirmation>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only arena with a lookup index on confirmation id
#[derive(Debug, Default)]
pub struct ArenaOrderRepository {
    orders: Vec<OrderConfirmation>,
    by_confirmation: HashMap<String, OrderId>,
}

impl ArenaOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (OrderId, &OrderConfirmation)> {
        self.orders.iter().enumerate().map(|(i, o)| (OrderId(i), o))
    }
}

impl OrderRepository for ArenaOrderRepository {
    fn insert(&mut self, confirmation: OrderConfirmation) -> OrderId {
        let id = OrderId(self.orders.len());
        self.by_confirmation.insert(confirmation.confirmation_id.clone(), id);
        self.orders.push(confirmation);
        id
    }

    fn get(&self, id: OrderId) -> Option<&OrderConfirmation> {
        self.orders.get(id.0)
    }

    fn find_by_confirmation(&self, confirmation_id: &str) -> Option<&OrderConfirmation> {
        self.by_confirmation
            .get(confirmation_id)
            .and_then(|id| self.orders.get(id.0))
    }

    fn len(&self) -> usize {
        self.orders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::models::{DeliveryEstimate, ShippingMethod};
    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;

    fn confirmation(id: &str) -> OrderConfirmation {
        let day = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        OrderConfirmation {
            confirmation_id: id.to_string(),
            placed_at: Utc::now(),
            items: vec![],
            subtotal: Decimal::ZERO,
            coupon_discount: Decimal::ZERO,
            gift_card_amount: Decimal::ZERO,
            total: Decimal::ZERO,
            shipping_method: ShippingMethod::Standard,
            estimated_delivery: DeliveryEstimate {
                earliest: day,
                latest: day,
            },
        }
    }

    #[test]
    fn test_arena_lookup() {
        let mut repo = ArenaOrderRepository::new();
        assert!(repo.is_empty());

        let first = repo.insert(confirmation("ORD-1"));
        let second = repo.insert(confirmation("ORD-2"));

        assert_eq!(repo.len(), 2);
        assert_ne!(first, second);
        assert_eq!(repo.get(second).unwrap().confirmation_id, "ORD-2");
        assert_eq!(repo.find_by_confirmation("ORD-1").unwrap().confirmation_id, "ORD-1");
        assert!(repo.find_by_confirmation("ORD-3").is_none());
        assert!(repo.get(OrderId(9)).is_none());
        assert_eq!(repo.iter().count(), 2);
    }
}
