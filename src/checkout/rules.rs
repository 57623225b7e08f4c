//! Per-step validation rules
//!
//! Each rule is a pure function of the cart, the live catalogue and the
//! checkout data entered so far. Errors block `next_step`, warnings never do.

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};

use crate::cart::validator::validate_for_checkout;
use crate::cart::{CartModel, Product};

use super::models::{Address, CardDetails, CheckoutData, CheckoutStepId, PaymentMethod, StepValidation};

/// Inputs shared by every rule
pub struct RuleContext<'a> {
    pub cart: &'a CartModel,
    pub products: &'a HashMap<String, Product>,
    pub data: &'a CheckoutData,
    pub today: NaiveDate,
}

pub fn validate_step(step: CheckoutStepId, ctx: &RuleContext<'_>) -> StepValidation {
    let mut result = StepValidation::default();
    match step {
        CheckoutStepId::Cart => validate_cart_step(ctx, &mut result),
        CheckoutStepId::Shipping => validate_shipping_step(ctx.data, &mut result),
        CheckoutStepId::Billing => validate_billing_step(ctx.data, &mut result),
        CheckoutStepId::Payment => validate_payment_step(ctx.data, ctx.today, &mut result),
        CheckoutStepId::Review => {
            if !ctx.data.accepted_terms {
                result.error("Terms and conditions must be accepted");
            }
        }
    }
    result
}

fn validate_cart_step(ctx: &RuleContext<'_>, result: &mut StepValidation) {
    let report = validate_for_checkout(ctx.cart, ctx.products);
    result.errors.extend(report.errors.into_iter().map(|issue| issue.message));
    result.warnings.extend(report.warnings.into_iter().map(|issue| issue.message));
}

fn validate_shipping_step(data: &CheckoutData, result: &mut StepValidation) {
    match &data.shipping_address {
        Some(address) => validate_address("Shipping", address, result),
        None => result.error("Shipping address is required"),
    }
    if data.shipping_method.is_none() {
        result.error("Shipping method is required");
    }
}

fn validate_billing_step(data: &CheckoutData, result: &mut StepValidation) {
    if data.billing_same_as_shipping {
        if data.shipping_address.is_none() {
            result.error("Billing address cannot copy a missing shipping address");
        }
        return;
    }
    match &data.billing_address {
        Some(address) => validate_address("Billing", address, result),
        None => result.error("Billing address is required"),
    }
}

fn validate_payment_step(data: &CheckoutData, today: NaiveDate, result: &mut StepValidation) {
    match &data.payment {
        None => result.error("Payment method is required"),
        Some(PaymentMethod::Card(card)) => validate_card(card, today, result),
        Some(PaymentMethod::PayPal { email }) => {
            if !is_email(email) {
                result.error("PayPal email is invalid");
            }
        }
        Some(PaymentMethod::CashOnDelivery) => {}
    }
}

fn validate_address(label: &str, address: &Address, result: &mut StepValidation) {
    let required = [
        ("full name", &address.full_name),
        ("address line", &address.line1),
        ("city", &address.city),
        ("postal code", &address.postal_code),
        ("country", &address.country),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            result.error(format!("{} {} is required", label, field));
        }
    }

    if address.email.trim().is_empty() {
        result.error(format!("{} email is required", label));
    } else if !is_email(&address.email) {
        result.error(format!("{} email is invalid", label));
    }

    if let Some(phone) = address.phone.as_deref().filter(|p| !p.trim().is_empty()) {
        let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
        if digits < 7 {
            result.warning(format!("{} phone number looks too short", label));
        }
    }
}

fn validate_card(card: &CardDetails, today: NaiveDate, result: &mut StepValidation) {
    if card.holder.trim().is_empty() {
        result.error("Card holder name is required");
    }

    let digits: String = card.number.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    if !(13..=19).contains(&digits.len()) || !luhn_valid(&digits) {
        result.error("Card number is invalid");
    }

    if !(1..=12).contains(&card.expiry_month) {
        result.error("Card expiry month is invalid");
    } else {
        let expiry = (card.expiry_year, card.expiry_month);
        let current = (today.year(), today.month());
        if expiry < current {
            result.error("Card has expired");
        } else if expiry == current {
            result.warning("Card expires this month");
        }
    }

    let cvv_ok = (3..=4).contains(&card.cvv.len()) && card.cvv.chars().all(|c| c.is_ascii_digit());
    if !cvv_ok {
        result.error("Card security code is invalid");
    }
}

/// Luhn checksum over an all-digit string
pub fn luhn_valid(digits: &str) -> bool {
    if digits.is_empty() {
        return false;
    }
    let mut sum = 0;
    for (i, c) in digits.chars().rev().enumerate() {
        let Some(mut d) = c.to_digit(10) else {
            return false;
        };
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

fn is_email(value: &str) -> bool {
    let value = value.trim();
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !value.contains(char::is_whitespace)
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
