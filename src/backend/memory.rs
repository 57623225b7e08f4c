//! In-process backend over the reference store
//!
//! Used by tests and local demos. Supports fault injection: going offline,
//! failing the next N calls, adding latency, and holding a response back until
//! released (to deliver confirmations out of order).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::CartBackend;
use crate::cart::models::ServerCart;
use crate::error::{BackendError, BackendResult};
use crate::service::store::CartStore;

pub struct MemoryBackend {
    store: Arc<CartStore>,
    online: AtomicBool,
    fail_next: AtomicU32,
    calls: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    held: Mutex<VecDeque<oneshot::Receiver<()>>>,
}

impl MemoryBackend {
    pub fn new(store: Arc<CartStore>) -> Self {
        Self {
            store,
            online: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
            latency: Mutex::new(None),
            held: Mutex::new(VecDeque::new()),
        }
    }

    pub fn store(&self) -> &Arc<CartStore> {
        &self.store
    }

    /// While offline every call fails with a network error
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// The next `count` calls fail with a 503
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Number of calls that reached the backend (including injected failures)
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The next call applies its mutation immediately but does not return
    /// until the returned sender fires (or is dropped).
    pub fn hold_next_response(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(rx);
        tx
    }

    async fn call<F>(&self, apply: F) -> BackendResult<ServerCart>
    where
        F: FnOnce(&CartStore) -> BackendResult<ServerCart>,
    {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.online.load(Ordering::SeqCst) {
            return Err(BackendError::Network("backend unreachable".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BackendError::Server {
                status: 503,
                message: "injected failure".into(),
            });
        }

        let result = apply(&self.store);

        let gate = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        result
    }
}

#[async_trait]
impl CartBackend for MemoryBackend {
    async fn fetch_cart(&self, user_id: &str) -> BackendResult<ServerCart> {
        self.call(|store| Ok(store.cart(user_id))).await
    }

    async fn add_item(&self, user_id: &str, product_id: &str, quantity: u32) -> BackendResult<ServerCart> {
        self.call(|store| store.add_item(user_id, product_id, quantity))
            .await
    }

    async fn set_quantity(&self, user_id: &str, item_id: &str, quantity: u32) -> BackendResult<ServerCart> {
        self.call(|store| store.set_quantity(user_id, item_id, quantity))
            .await
    }

    async fn remove_item(&self, user_id: &str, item_id: &str) -> BackendResult<ServerCart> {
        self.call(|store| store.remove_item(user_id, item_id)).await
    }

    async fn clear_cart(&self, user_id: &str) -> BackendResult<ServerCart> {
        self.call(|store| store.clear(user_id)).await
    }
}
