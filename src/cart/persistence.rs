//! Durable cart snapshots
//!
//! The primary snapshot is written after every local mutation. A separate
//! backup with a timestamp is only consulted when the primary is missing or
//! corrupt, and only while it is younger than the configured TTL.
//!
//! Everything is written as primitives (f64 money, plain strings) and read back
//! leniently: a field of the wrong type falls back to its default, a line that
//! cannot be read is skipped, and a snapshot that is not a JSON object is
//! discarded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::helpers::{money_from_f64, money_to_f64};
use super::models::CartItem;
use super::state::CartModel;
use crate::error::StorageError;
use crate::storage::KeyValueStore;

pub const SNAPSHOT_VERSION: u32 = 1;

const CART_KEY_PREFIX: &str = "cart:";
const BACKUP_KEY_PREFIX: &str = "cart_backup:";

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

fn lenient_items<'de, D>(deserializer: D) -> Result<Vec<PersistedItem>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let Value::Array(entries) = value else {
        return Ok(Vec::new());
    };
    Ok(entries
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|entry| PersistedItem::deserialize(entry).ok())
        .collect())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct PersistedItem {
    #[serde(default, deserialize_with = "lenient")]
    id: String,
    #[serde(default, deserialize_with = "lenient")]
    title: String,
    #[serde(default, deserialize_with = "lenient")]
    price: f64,
    #[serde(default, deserialize_with = "lenient")]
    image_url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    quantity: u32,
}

impl PersistedItem {
    fn from_item(item: &CartItem) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            price: money_to_f64(item.price),
            image_url: item.image_url.clone(),
            quantity: item.quantity,
        }
    }

    fn into_item(self) -> Option<CartItem> {
        if self.id.is_empty() {
            return None;
        }
        Some(CartItem {
            id: self.id,
            title: self.title,
            price: money_from_f64(self.price),
            image_url: self.image_url,
            quantity: self.quantity,
        })
    }
}

/// On-disk shape of a cart
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct PersistedCart {
    #[serde(default, deserialize_with = "lenient")]
    version: u32,
    #[serde(default, deserialize_with = "lenient_items")]
    items: Vec<PersistedItem>,
    #[serde(default, deserialize_with = "lenient_items")]
    saved: Vec<PersistedItem>,
    #[serde(default, deserialize_with = "lenient")]
    subtotal: f64,
    #[serde(default, deserialize_with = "lenient")]
    total_quantity: u32,
    #[serde(default, deserialize_with = "lenient")]
    coupon_code: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    coupon_discount: f64,
    #[serde(default, deserialize_with = "lenient")]
    gift_card_code: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    gift_card_amount_applied: f64,
}

impl PersistedCart {
    fn from_model(cart: &CartModel) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            items: cart.items().iter().map(PersistedItem::from_item).collect(),
            saved: cart.saved().iter().map(PersistedItem::from_item).collect(),
            subtotal: money_to_f64(cart.subtotal()),
            total_quantity: cart.total_quantity(),
            coupon_code: cart.coupon_code().map(str::to_string),
            coupon_discount: money_to_f64(cart.coupon_discount()),
            gift_card_code: cart.gift_card_code().map(str::to_string),
            gift_card_amount_applied: money_to_f64(cart.gift_card_amount_applied()),
        }
    }

    /// Derived fields in the snapshot are ignored and recomputed
    fn into_model(self) -> CartModel {
        let items = self.items.into_iter().filter_map(PersistedItem::into_item).collect();
        let saved = self.saved.into_iter().filter_map(PersistedItem::into_item).collect();
        let gift_card = self
            .gift_card_code
            .map(|code| (code, money_from_f64(self.gift_card_amount_applied)));
        CartModel::from_parts(items, saved, self.coupon_code, gift_card)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupEnvelope {
    saved_at: DateTime<Utc>,
    cart: PersistedCart,
}

/// Reads and writes cart snapshots keyed by user
#[derive(Clone)]
pub struct CartPersistence {
    store: Arc<dyn KeyValueStore>,
    backup_ttl: chrono::Duration,
}

impl CartPersistence {
    pub fn new(store: Arc<dyn KeyValueStore>, backup_ttl: std::time::Duration) -> Self {
        Self {
            store,
            backup_ttl: chrono::Duration::from_std(backup_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn save(&self, user: &str, cart: &CartModel) -> Result<(), StorageError> {
        let json = serde_json::to_string(&PersistedCart::from_model(cart))?;
        self.store.set(&cart_key(user), &json)
    }

    /// Loads the primary snapshot; a corrupt one is deleted and reported as absent
    pub fn load(&self, user: &str) -> Option<CartModel> {
        let key = cart_key(user);
        let raw = match self.store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(user, error = %e, "Failed to read cart snapshot");
                return None;
            }
        };

        match parse_snapshot(&raw) {
            Some(snapshot) => Some(snapshot.into_model()),
            None => {
                tracing::warn!(user, "Discarding corrupt cart snapshot");
                if let Err(e) = self.store.remove(&key) {
                    tracing::warn!(user, error = %e, "Failed to remove corrupt cart snapshot");
                }
                None
            }
        }
    }

    pub fn save_backup(&self, user: &str, cart: &CartModel, now: DateTime<Utc>) -> Result<(), StorageError> {
        let envelope = BackupEnvelope {
            saved_at: now,
            cart: PersistedCart::from_model(cart),
        };
        self.store
            .set(&backup_key(user), &serde_json::to_string(&envelope)?)
    }

    /// Loads the backup if it is younger than the TTL
    pub fn load_backup(&self, user: &str, now: DateTime<Utc>) -> Option<CartModel> {
        let raw = self.store.get(&backup_key(user)).ok().flatten()?;
        let envelope: BackupEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(user, error = %e, "Discarding unreadable cart backup");
                let _ = self.store.remove(&backup_key(user));
                return None;
            }
        };

        if now - envelope.saved_at > self.backup_ttl {
            tracing::debug!(user, saved_at = %envelope.saved_at, "Cart backup expired");
            let _ = self.store.remove(&backup_key(user));
            return None;
        }
        Some(envelope.cart.into_model())
    }

    /// Primary snapshot, then a fresh backup, then an empty cart
    pub fn restore(&self, user: &str, now: DateTime<Utc>) -> CartModel {
        if let Some(cart) = self.load(user) {
            return cart;
        }
        if let Some(cart) = self.load_backup(user, now) {
            tracing::info!(user, items = cart.items().len(), "Recovered cart from backup");
            return cart;
        }
        CartModel::new()
    }

    pub fn clear(&self, user: &str) -> Result<(), StorageError> {
        self.store.remove(&cart_key(user))?;
        self.store.remove(&backup_key(user))
    }
}

fn parse_snapshot(raw: &str) -> Option<PersistedCart> {
    let value: Value = serde_json::from_str(raw).ok()?;
    if !value.is_object() {
        return None;
    }
    let snapshot = PersistedCart::deserialize(value).ok()?;
    if snapshot.version > SNAPSHOT_VERSION {
        return None;
    }
    Some(snapshot)
}

fn cart_key(user: &str) -> String {
    format!("{}{}", CART_KEY_PREFIX, user)
}

fn backup_key(user: &str) -> String {
    format!("{}{}", BACKUP_KEY_PREFIX, user)
}
