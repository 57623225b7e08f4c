//! Cart reconciliation
//!
//! Merges the local cart with an authoritative server snapshot. Each
//! disagreement becomes a `CartConflict`; a `ConflictPolicy` decides which side
//! wins. The merge always works on the *current* local state, never on a copy
//! taken when a request was dispatched.

use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use serde::Serialize;

use crate::backend::CartOperation;
use crate::cart::models::{CartItem, ServerCart};
use crate::cart::state::CartModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Quantity,
    Price,
    Availability,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Local,
    Server,
    /// Left as-is locally and surfaced to the caller; nothing is uploaded.
    /// The built-in policies never pick it, custom ones use it to defer to the user.
    Manual,
}

/// One side of a conflict
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConflictValue {
    Missing,
    Quantity(u32),
    Price(Decimal),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartConflict {
    pub kind: ConflictKind,
    pub item_id: String,
    pub local_value: ConflictValue,
    pub server_value: ConflictValue,
    pub resolution: Resolution,
}

/// The shape of a disagreement, as seen by a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictCase {
    /// Line exists locally but not on the server
    LocalOnly,
    /// Line exists on the server but not locally
    ServerOnly,
    Quantity,
    Price,
}

impl ConflictCase {
    fn kind(self) -> ConflictKind {
        match self {
            ConflictCase::LocalOnly | ConflictCase::ServerOnly => ConflictKind::Removed,
            ConflictCase::Quantity => ConflictKind::Quantity,
            ConflictCase::Price => ConflictKind::Price,
        }
    }
}

/// Decides who wins a conflict
pub trait ConflictPolicy {
    fn resolve(&self, case: ConflictCase, item_id: &str) -> Resolution;
}

/// Default table: the user's latest intent lives locally, prices live on the server.
///
/// Lines listed in `pending` have a local change the server has not
/// acknowledged yet; they keep their local state whatever the case.
#[derive(Debug, Default)]
pub struct LocalIntentPolicy {
    pub pending: HashSet<String>,
}

impl ConflictPolicy for LocalIntentPolicy {
    fn resolve(&self, case: ConflictCase, item_id: &str) -> Resolution {
        if self.pending.contains(item_id) && case != ConflictCase::Price {
            return Resolution::Local;
        }
        match case {
            ConflictCase::LocalOnly | ConflictCase::Quantity => Resolution::Local,
            ConflictCase::ServerOnly | ConflictCase::Price => Resolution::Server,
        }
    }
}

/// Policy for the confirmation of one dispatched mutation.
///
/// The server wins everywhere except on lines the user touched again after
/// the mutation with revision `revision` was dispatched, and on other lines
/// whose own mutations have not been acknowledged yet.
#[derive(Debug)]
pub struct ConfirmationPolicy<'a> {
    pub touched: &'a HashMap<String, u64>,
    pub confirmed: &'a HashMap<String, u64>,
    pub revision: u64,
    /// Line the mutation targeted; `None` for whole-cart mutations
    pub target: Option<&'a str>,
}

impl ConfirmationPolicy<'_> {
    pub fn is_superseded(&self, item_id: &str) -> bool {
        self.touched
            .get(item_id)
            .is_some_and(|&touched| touched > self.revision)
    }

    fn is_unacknowledged(&self, item_id: &str) -> bool {
        let confirmed = self.confirmed.get(item_id).copied().unwrap_or(0);
        self.touched
            .get(item_id)
            .is_some_and(|&touched| touched > confirmed)
    }

    pub fn protects(&self, item_id: &str) -> bool {
        if self.is_superseded(item_id) {
            return true;
        }
        match self.target {
            Some(target) => target != item_id && self.is_unacknowledged(item_id),
            None => false,
        }
    }
}

impl ConflictPolicy for ConfirmationPolicy<'_> {
    fn resolve(&self, case: ConflictCase, item_id: &str) -> Resolution {
        if case != ConflictCase::Price && self.protects(item_id) {
            Resolution::Local
        } else {
            Resolution::Server
        }
    }
}

/// Result of a reconciliation
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub merged: CartModel,
    pub conflicts: Vec<CartConflict>,
}

impl ReconcileOutcome {
    /// Conflicts the local side won, i.e. the ones the server still has to learn about
    pub fn local_wins(&self) -> impl Iterator<Item = &CartConflict> {
        self.conflicts
            .iter()
            .filter(|c| c.resolution == Resolution::Local)
    }
}

/// Reconcile with the default policy
pub fn reconcile(local: &CartModel, server: &ServerCart) -> ReconcileOutcome {
    reconcile_with(local, server, &LocalIntentPolicy::default())
}

/// The call that brings the server's line `item_id` in line with the local one
pub fn corrective_operation(local: &CartModel, server: &ServerCart, item_id: &str) -> Option<CartOperation> {
    match (local.item(item_id), server.item(item_id)) {
        (Some(mine), Some(theirs)) if mine.quantity != theirs.quantity => Some(CartOperation::SetQuantity {
            item_id: item_id.to_string(),
            quantity: mine.quantity,
        }),
        (Some(mine), None) => Some(CartOperation::AddItem {
            product_id: item_id.to_string(),
            quantity: mine.quantity,
        }),
        (None, Some(_)) => Some(CartOperation::RemoveItem {
            item_id: item_id.to_string(),
        }),
        _ => None,
    }
}

pub fn reconcile_with(
    local: &CartModel,
    server: &ServerCart,
    policy: &dyn ConflictPolicy,
) -> ReconcileOutcome {
    let mut merged = local.clone();
    let mut conflicts = Vec::new();

    let mut record = |case: ConflictCase, item_id: &str, local_value, server_value| {
        let resolution = policy.resolve(case, item_id);
        conflicts.push(CartConflict {
            kind: case.kind(),
            item_id: item_id.to_string(),
            local_value,
            server_value,
            resolution,
        });
        resolution
    };

    for item in local.items() {
        let Some(remote) = server.item(&item.id) else {
            let resolution = record(
                ConflictCase::LocalOnly,
                &item.id,
                ConflictValue::Quantity(item.quantity),
                ConflictValue::Missing,
            );
            if resolution == Resolution::Server {
                merged.put_item(&item.id, None);
            }
            continue;
        };

        let mut line = CartItem {
            title: remote.title.clone(),
            image_url: remote.image_url.clone().or_else(|| item.image_url.clone()),
            ..item.clone()
        };

        if remote.price != item.price {
            let resolution = record(
                ConflictCase::Price,
                &item.id,
                ConflictValue::Price(item.price),
                ConflictValue::Price(remote.price),
            );
            if resolution == Resolution::Server {
                line.price = remote.price;
            }
        }

        if remote.quantity != item.quantity {
            let resolution = record(
                ConflictCase::Quantity,
                &item.id,
                ConflictValue::Quantity(item.quantity),
                ConflictValue::Quantity(remote.quantity),
            );
            if resolution == Resolution::Server {
                line.quantity = remote.quantity;
            }
        }

        merged.put_item(&item.id, Some(line));
    }

    for remote in &server.items {
        if local.contains(&remote.id) {
            continue;
        }
        let resolution = record(
            ConflictCase::ServerOnly,
            &remote.id,
            ConflictValue::Missing,
            ConflictValue::Quantity(remote.quantity),
        );
        if resolution == Resolution::Server && remote.quantity > 0 {
            merged.put_item(&remote.id, Some(remote.clone()));
        }
    }

    merged.recompute();
    ReconcileOutcome { merged, conflicts }
}
