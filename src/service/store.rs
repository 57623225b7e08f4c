//! Reference cart store
//!
//! Server-side state for the reference cart service: a product catalog and
//! one cart per user. Lines are repriced from the catalog whenever a snapshot
//! is produced, so the store is price-authoritative.

use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::cart::helpers::merge_line_items;
use crate::cart::models::{CartItem, Product, ServerCart};
use crate::error::{BackendError, BackendResult};

pub struct CartStore {
    /// Carts keyed by user id.
    /// DashMap allows concurrent access without external Mutexes.
    carts: DashMap<String, Vec<CartItem>>,

    catalog: DashMap<String, Product>,
}

impl Default for CartStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CartStore {
    pub fn new() -> Self {
        Self {
            carts: DashMap::new(),
            catalog: DashMap::new(),
        }
    }

    pub fn with_catalog(products: impl IntoIterator<Item = Product>) -> Self {
        let store = Self::new();
        for product in products {
            store.upsert_product(product);
        }
        store
    }

    /// Small catalog the binary starts with
    pub fn demo() -> Self {
        Self::with_catalog([
            Product::new("lamp", "Desk Lamp", Decimal::new(4999, 2), 40),
            Product::new("mug", "Ceramic Mug", Decimal::new(1250, 2), 200),
            Product::new("chair", "Office Chair", Decimal::new(18900, 2), 12),
            Product::new("notebook", "Dot Grid Notebook", Decimal::new(899, 2), 500),
        ])
    }

    pub fn upsert_product(&self, product: Product) {
        self.catalog.insert(product.id.clone(), product);
    }

    /// Changes a catalog price; carts pick it up on their next snapshot
    pub fn set_price(&self, product_id: &str, price: Decimal) -> bool {
        match self.catalog.get_mut(product_id) {
            Some(mut product) => {
                product.price = price;
                true
            }
            None => false,
        }
    }

    pub fn product(&self, product_id: &str) -> Option<Product> {
        self.catalog.get(product_id).map(|p| p.value().clone())
    }

    pub fn products(&self) -> Vec<Product> {
        let mut products: Vec<Product> = self.catalog.iter().map(|p| p.value().clone()).collect();
        products.sort_by(|a, b| a.id.cmp(&b.id));
        products
    }

    pub fn cart(&self, user_id: &str) -> ServerCart {
        let items = self
            .carts
            .get(user_id)
            .map(|lines| lines.value().clone())
            .unwrap_or_default();
        self.snapshot(items)
    }

    pub fn add_item(&self, user_id: &str, product_id: &str, quantity: u32) -> BackendResult<ServerCart> {
        if quantity == 0 {
            return Err(BackendError::Rejected("quantity must be positive".into()));
        }
        let product = self
            .product(product_id)
            .ok_or_else(|| BackendError::NotFound(format!("product {}", product_id)))?;
        if !product.is_active || product.is_discontinued {
            return Err(BackendError::Rejected(format!("{} is not available", product.name)));
        }

        let mut lines = self.carts.entry(user_id.to_string()).or_default();
        merge_line_items(&mut lines, vec![product.to_cart_item(quantity)]);
        let items = lines.clone();
        drop(lines);
        Ok(self.snapshot(items))
    }

    /// Zero removes the line
    pub fn set_quantity(&self, user_id: &str, item_id: &str, quantity: u32) -> BackendResult<ServerCart> {
        let mut lines = self.carts.entry(user_id.to_string()).or_default();
        let Some(pos) = lines.iter().position(|i| i.id == item_id) else {
            return Err(BackendError::NotFound(format!("cart item {}", item_id)));
        };
        if quantity == 0 {
            lines.remove(pos);
        } else {
            lines[pos].quantity = quantity;
        }
        let items = lines.clone();
        drop(lines);
        Ok(self.snapshot(items))
    }

    /// Removing an absent line is not an error, so retries stay idempotent
    pub fn remove_item(&self, user_id: &str, item_id: &str) -> BackendResult<ServerCart> {
        let mut lines = self.carts.entry(user_id.to_string()).or_default();
        lines.retain(|i| i.id != item_id);
        let items = lines.clone();
        drop(lines);
        Ok(self.snapshot(items))
    }

    pub fn clear(&self, user_id: &str) -> BackendResult<ServerCart> {
        self.carts.remove(user_id);
        Ok(ServerCart::default())
    }

    fn snapshot(&self, mut items: Vec<CartItem>) -> ServerCart {
        for item in &mut items {
            if let Some(product) = self.catalog.get(&item.id) {
                item.price = product.price;
                item.title = product.name.clone();
            }
        }
        ServerCart::from_items(items)
    }
}
