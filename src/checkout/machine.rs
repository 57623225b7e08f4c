//! Linear checkout flow with per-step validation gates

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cart::{CartModel, Product};
use crate::error::CheckoutError;

use super::models::{
    CheckoutData, CheckoutStep, CheckoutStepId, DeliveryEstimate, OrderConfirmation,
};
use super::orders::OrderRepository;
use super::rules::{validate_step, RuleContext};

/// Built fresh for every checkout attempt and discarded afterwards.
///
/// Exactly one step is active at a time. A step can only be left forwards
/// while its validation has no errors.
#[derive(Debug, Clone)]
pub struct CheckoutStateMachine {
    steps: Vec<CheckoutStep>,
    current: usize,
    cart: CartModel,
    products: HashMap<String, Product>,
    data: CheckoutData,
    today: NaiveDate,
    confirmation: Option<OrderConfirmation>,
}

impl CheckoutStateMachine {
    pub fn new(cart: CartModel, products: HashMap<String, Product>) -> Self {
        Self::new_at(cart, products, Utc::now().date_naive())
    }

    /// Same as `new` with a fixed calendar date for expiry checks
    pub fn new_at(cart: CartModel, products: HashMap<String, Product>, today: NaiveDate) -> Self {
        let steps = CheckoutStepId::ALL
            .iter()
            .enumerate()
            .map(|(order, id)| CheckoutStep {
                id: *id,
                order,
                is_completed: false,
                is_active: order == 0,
                validation: Default::default(),
            })
            .collect();

        let mut machine = Self {
            steps,
            current: 0,
            cart,
            products,
            data: CheckoutData::default(),
            today,
            confirmation: None,
        };
        machine.revalidate();
        machine
    }

    pub fn steps(&self) -> &[CheckoutStep] {
        &self.steps
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_step(&self) -> &CheckoutStep {
        &self.steps[self.current]
    }

    pub fn data(&self) -> &CheckoutData {
        &self.data
    }

    pub fn cart(&self) -> &CartModel {
        &self.cart
    }

    pub fn confirmation(&self) -> Option<&OrderConfirmation> {
        self.confirmation.as_ref()
    }

    /// Applies `update` to the checkout data and revalidates every step.
    ///
    /// A completed step whose data no longer validates loses its completion.
    pub fn update_checkout_data(&mut self, update: impl FnOnce(&mut CheckoutData)) {
        update(&mut self.data);
        self.revalidate();
    }

    /// Replaces the cart snapshot, e.g. after a sync changed it mid-checkout
    pub fn update_cart(&mut self, cart: CartModel) {
        self.cart = cart;
        self.revalidate();
    }

    pub fn can_proceed(&self) -> bool {
        self.current_step().validation.is_valid()
    }

    /// Completes the current step and activates the next one.
    ///
    /// On the last step this only marks it completed; it stays active.
    pub fn next_step(&mut self) -> Result<CheckoutStepId, CheckoutError> {
        self.revalidate();
        let step = &self.steps[self.current];
        if !step.validation.is_valid() {
            debug!(step = %step.id, errors = step.validation.errors.len(), "Checkout step blocked");
            return Err(CheckoutError::StepInvalid {
                step: step.id,
                errors: step.validation.errors.clone(),
            });
        }

        self.steps[self.current].is_completed = true;
        if self.current + 1 < self.steps.len() {
            self.activate(self.current + 1);
        }
        Ok(self.current_step().id)
    }

    /// Moves back one step; a no-op on the first step
    pub fn previous_step(&mut self) -> CheckoutStepId {
        if self.current > 0 {
            self.activate(self.current - 1);
        }
        self.current_step().id
    }

    /// Jumps to `index` when every earlier step is completed
    pub fn go_to_step(&mut self, index: usize) -> Result<CheckoutStepId, CheckoutError> {
        let target = self
            .steps
            .get(index)
            .map(|s| s.id)
            .ok_or(CheckoutError::OutOfRange(index))?;

        if let Some(blocking) = self.steps[..index].iter().find(|s| !s.is_completed) {
            return Err(CheckoutError::StepLocked {
                target,
                blocking: blocking.id,
            });
        }

        self.activate(index);
        Ok(target)
    }

    pub fn complete_checkout(
        &mut self,
        orders: &mut dyn OrderRepository,
    ) -> Result<OrderConfirmation, CheckoutError> {
        self.complete_checkout_at(Utc::now(), orders)
    }

    /// Stamps a confirmation once every step is completed and records it
    pub fn complete_checkout_at(
        &mut self,
        now: DateTime<Utc>,
        orders: &mut dyn OrderRepository,
    ) -> Result<OrderConfirmation, CheckoutError> {
        if self.confirmation.is_some() {
            return Err(CheckoutError::AlreadyCompleted);
        }

        self.revalidate();
        let pending: Vec<CheckoutStepId> = self
            .steps
            .iter()
            .filter(|s| !s.is_completed)
            .map(|s| s.id)
            .collect();
        if !pending.is_empty() {
            return Err(CheckoutError::Incomplete(pending));
        }
        let shipping_method = self
            .data
            .shipping_method
            .ok_or_else(|| CheckoutError::Incomplete(vec![CheckoutStepId::Shipping]))?;

        let placed_on = now.date_naive();
        let (min_days, max_days) = shipping_method.delivery_days();
        let confirmation = OrderConfirmation {
            confirmation_id: format!("ORD-{}", Uuid::new_v4().simple()).to_uppercase(),
            placed_at: now,
            items: self.cart.items().to_vec(),
            subtotal: self.cart.subtotal(),
            coupon_discount: self.cart.coupon_discount(),
            gift_card_amount: self.cart.gift_card_amount_applied(),
            total: self.cart.total(),
            shipping_method,
            estimated_delivery: DeliveryEstimate {
                earliest: placed_on + Duration::days(i64::from(min_days)),
                latest: placed_on + Duration::days(i64::from(max_days)),
            },
        };

        let order_id = orders.insert(confirmation.clone());
        info!(
            confirmation_id = %confirmation.confirmation_id,
            order = order_id.0,
            total = %confirmation.total,
            "Checkout completed"
        );
        self.confirmation = Some(confirmation.clone());
        Ok(confirmation)
    }

    fn activate(&mut self, index: usize) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.is_active = i == index;
        }
        self.current = index;
    }

    fn revalidate(&mut self) {
        let ctx = RuleContext {
            cart: &self.cart,
            products: &self.products,
            data: &self.data,
            today: self.today,
        };
        for step in &mut self.steps {
            step.validation = validate_step(step.id, &ctx);
            if !step.validation.is_valid() {
                step.is_completed = false;
            }
        }
    }
}
