use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use storefront_cart::backend::{CartBackend, MemoryBackend};
use storefront_cart::cart::models::{Product, ServerCart};
use storefront_cart::error::BackendError;
use storefront_cart::checkout::{CheckoutStepId, ShippingMethod};
use storefront_cart::config::EngineConfig;
use storefront_cart::controller::{CartController, LoadOutcome, ACTIVE_USER_KEY};
use storefront_cart::service::CartStore;
use storefront_cart::storage::{KeyValueStore, MemoryStore};
use storefront_cart::sync::QueueEvent;

struct Harness {
    controller: CartController,
    backend: Arc<MemoryBackend>,
    store: Arc<MemoryStore>,
}

fn harness_with(config: EngineConfig) -> Harness {
    let backend = Arc::new(MemoryBackend::new(Arc::new(CartStore::demo())));
    let store = Arc::new(MemoryStore::new());
    let controller = CartController::new("alice", backend.clone(), store.clone(), config);
    Harness {
        controller,
        backend,
        store,
    }
}

fn harness() -> Harness {
    harness_with(EngineConfig::new().with_retry_delays(Duration::ZERO, Duration::ZERO))
}

fn product(h: &Harness, id: &str) -> Product {
    h.backend.store().product(id).expect("demo product")
}

fn catalogue(h: &Harness) -> HashMap<String, Product> {
    h.backend
        .store()
        .products()
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect()
}

fn server_quantity(h: &Harness, user: &str, id: &str) -> Option<u32> {
    h.backend.store().cart(user).item(id).map(|i| i.quantity)
}

#[tokio::test]
async fn test_optimistic_add_reaches_server() {
    let h = harness();
    let mug = product(&h, "mug");

    let cart = h.controller.add_product(&mug, 2);
    assert_eq!(cart.item("mug").map(|i| i.quantity), Some(2));
    assert!(h.controller.has_pending_changes());

    h.controller.flush().await;

    assert_eq!(server_quantity(&h, "alice", "mug"), Some(2));
    assert!(!h.controller.has_pending_changes());
    assert_eq!(h.controller.snapshot().item("mug").map(|i| i.quantity), Some(2));
}

#[tokio::test]
async fn test_offline_changes_replay_on_reconnect() {
    let h = harness();
    h.controller.set_online(false);

    let cart = h.controller.add_product(&product(&h, "lamp"), 1);
    assert!(cart.contains("lamp"));
    assert_eq!(h.controller.pending_actions().len(), 1);
    assert_eq!(h.backend.calls(), 0);
    assert!(h.controller.sync_status().has_pending_changes);

    h.controller.set_online(true);
    let report = h.controller.sync_now().await.unwrap();

    assert_eq!(report.replayed, 1);
    assert!(h.controller.pending_actions().is_empty());
    assert_eq!(server_quantity(&h, "alice", "lamp"), Some(1));
    assert!(h.controller.snapshot().contains("lamp"));

    let status = h.controller.sync_status();
    assert!(status.is_online);
    assert!(!status.has_pending_changes);
    assert!(status.last_sync_timestamp.is_some());
}

#[tokio::test]
async fn test_exhausted_retries_drop_action_and_keep_local_line() {
    let h = harness();
    let mut events = h.controller.queue_events();

    // dispatch, then three passes of (replay attempt + fetch); the last
    // attempt drops the action and the fetch after it succeeds
    h.backend.fail_next(6);
    h.controller.add_product(&product(&h, "mug"), 1);
    h.controller.flush().await;
    assert_eq!(h.controller.pending_actions().len(), 1);

    for _ in 0..3 {
        let _ = h.controller.sync_now().await;
    }

    // the server never saw the add, so the local line is uploaded instead
    assert!(h.controller.pending_actions().is_empty());
    assert_eq!(h.controller.snapshot().item("mug").map(|i| i.quantity), Some(1));
    assert_eq!(server_quantity(&h, "alice", "mug"), Some(1));
    assert!(!h.controller.has_pending_changes());

    let dropped = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Dropped { action, .. }) => return action,
                Ok(_) => continue,
                Err(e) => panic!("queue events closed: {e}"),
            }
        }
    })
    .await
    .expect("dropped event");
    assert_eq!(dropped.operation, "add_item");
    assert_eq!(dropped.retry_count, 3);
}

#[tokio::test]
async fn test_stale_confirmation_keeps_newer_quantity() {
    let h = harness();
    h.controller.add_product(&product(&h, "mug"), 1);
    h.controller.flush().await;
    let calls = h.backend.calls();

    let release = h.backend.hold_next_response();
    h.controller.set_quantity("mug", 2);
    while h.backend.calls() < calls + 1 {
        tokio::task::yield_now().await;
    }

    // the newer change waits behind the one in flight
    let cart = h.controller.set_quantity("mug", 5);
    assert_eq!(cart.item("mug").map(|i| i.quantity), Some(5));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server_quantity(&h, "alice", "mug"), Some(2));
    assert_eq!(h.backend.calls(), calls + 1);

    // the confirmation for quantity 2 lands after the local edit to 5
    release.send(()).unwrap();
    h.controller.flush().await;
    assert_eq!(h.controller.snapshot().item("mug").map(|i| i.quantity), Some(5));
    assert_eq!(server_quantity(&h, "alice", "mug"), Some(5));

    h.controller.sync_now().await.unwrap();
    assert_eq!(h.controller.snapshot().item("mug").map(|i| i.quantity), Some(5));
    assert_eq!(server_quantity(&h, "alice", "mug"), Some(5));
    assert!(!h.controller.has_pending_changes());
}

/// Adds take a while to answer; everything else is immediate
struct SlowAdds {
    inner: Arc<MemoryBackend>,
    delay: Duration,
}

#[async_trait]
impl CartBackend for SlowAdds {
    async fn fetch_cart(&self, user_id: &str) -> Result<ServerCart, BackendError> {
        self.inner.fetch_cart(user_id).await
    }

    async fn add_item(
        &self,
        user_id: &str,
        product_id: &str,
        quantity: u32,
    ) -> Result<ServerCart, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.add_item(user_id, product_id, quantity).await
    }

    async fn set_quantity(
        &self,
        user_id: &str,
        item_id: &str,
        quantity: u32,
    ) -> Result<ServerCart, BackendError> {
        self.inner.set_quantity(user_id, item_id, quantity).await
    }

    async fn remove_item(&self, user_id: &str, item_id: &str) -> Result<ServerCart, BackendError> {
        self.inner.remove_item(user_id, item_id).await
    }

    async fn clear_cart(&self, user_id: &str) -> Result<ServerCart, BackendError> {
        self.inner.clear_cart(user_id).await
    }
}

#[tokio::test]
async fn test_quantity_change_waits_for_slow_add() {
    let backend = Arc::new(MemoryBackend::new(Arc::new(CartStore::demo())));
    let controller = CartController::new(
        "alice",
        Arc::new(SlowAdds {
            inner: backend.clone(),
            delay: Duration::from_millis(50),
        }),
        Arc::new(MemoryStore::new()),
        EngineConfig::new().with_retry_delays(Duration::ZERO, Duration::ZERO),
    );
    let mug = backend.store().product("mug").unwrap();

    controller.add_product(&mug, 1);
    let cart = controller.set_quantity("mug", 5);
    assert_eq!(cart.item("mug").map(|i| i.quantity), Some(5));

    controller.flush().await;
    assert_eq!(controller.snapshot().item("mug").map(|i| i.quantity), Some(5));
    assert_eq!(backend.store().cart("alice").item("mug").map(|i| i.quantity), Some(5));
    assert!(!controller.has_pending_changes());

    // a removal behind a slow add still wins
    controller.add_product(&backend.store().product("lamp").unwrap(), 2);
    controller.remove_item("lamp");
    controller.flush().await;
    assert!(!controller.snapshot().contains("lamp"));
    assert!(backend.store().cart("alice").item("lamp").is_none());
}

#[tokio::test]
async fn test_quantity_change_queues_behind_failed_add() {
    let h = harness();
    h.backend.fail_next(1);

    h.controller.add_product(&product(&h, "mug"), 1);
    h.controller.set_quantity("mug", 5);
    h.controller.flush().await;

    let queued: Vec<_> = h
        .controller
        .pending_actions()
        .into_iter()
        .map(|a| a.operation)
        .collect();
    assert_eq!(queued, vec!["add_item", "set_quantity"]);
    assert_eq!(h.controller.snapshot().item("mug").map(|i| i.quantity), Some(5));

    let report = h.controller.sync_now().await.unwrap();
    assert_eq!(report.replayed, 2);
    assert_eq!(h.controller.snapshot().item("mug").map(|i| i.quantity), Some(5));
    assert_eq!(server_quantity(&h, "alice", "mug"), Some(5));
    assert!(!h.controller.has_pending_changes());
}

#[tokio::test]
async fn test_slow_initial_load_applies_late_result() {
    let h = harness_with(
        EngineConfig::new().with_initial_load_timeout(Duration::from_millis(50)),
    );
    h.backend.store().add_item("alice", "lamp", 1).unwrap();
    h.backend.set_latency(Some(Duration::from_millis(300)));

    let outcome = h.controller.load().await;
    assert_eq!(outcome, LoadOutcome::TimedOut);
    assert!(h.controller.snapshot().is_empty());

    let mut snapshots = h.controller.subscribe();
    tokio::time::timeout(Duration::from_secs(2), snapshots.wait_for(|c| c.contains("lamp")))
        .await
        .expect("late load result")
        .unwrap();
}

#[tokio::test]
async fn test_fast_initial_load_is_synced() {
    let h = harness();
    h.backend.store().add_item("alice", "lamp", 2).unwrap();

    match h.controller.load().await {
        LoadOutcome::Synced(report) => assert_eq!(report.uploaded, 0),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(h.controller.snapshot().item("lamp").map(|i| i.quantity), Some(2));

    h.controller.set_online(false);
    assert_eq!(h.controller.load().await, LoadOutcome::LocalOnly);
}

#[tokio::test]
async fn test_active_user_switch_swaps_cart() {
    let h = harness();
    h.backend.store().add_item("bob", "lamp", 1).unwrap();
    h.controller.add_product(&product(&h, "mug"), 1);
    h.controller.flush().await;
    h.controller.start();

    let mut snapshots = h.controller.subscribe();
    h.store.set(ACTIVE_USER_KEY, "bob").unwrap();
    tokio::time::timeout(Duration::from_secs(2), snapshots.wait_for(|c| c.contains("lamp")))
        .await
        .expect("bob's cart")
        .unwrap();
    assert_eq!(h.controller.user(), "bob");
    assert!(!h.controller.snapshot().contains("mug"));

    h.store.set(ACTIVE_USER_KEY, "alice").unwrap();
    tokio::time::timeout(Duration::from_secs(2), snapshots.wait_for(|c| c.contains("mug")))
        .await
        .expect("alice's cart")
        .unwrap();
    assert_eq!(h.controller.user(), "alice");

    h.controller.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_background_work() {
    let h = harness();
    h.controller.start();
    h.controller.shutdown().await;

    assert!(h.controller.sync_now().await.is_err());
    let calls = h.backend.calls();
    h.controller.add_product(&product(&h, "mug"), 1);
    h.controller.flush().await;
    assert_eq!(h.backend.calls(), calls);
}

#[tokio::test]
async fn test_zero_quantity_removes_line() {
    let h = harness();
    h.controller.add_product(&product(&h, "mug"), 3);
    h.controller.flush().await;

    let cart = h.controller.set_quantity("mug", 0);
    assert!(!cart.contains("mug"));
    h.controller.flush().await;
    assert_eq!(server_quantity(&h, "alice", "mug"), None);
}

#[tokio::test]
async fn test_checkout_over_current_cart() {
    let h = harness();
    h.controller.add_product(&product(&h, "lamp"), 1);
    h.controller.flush().await;

    let mut checkout = h.controller.begin_checkout(catalogue(&h));
    assert_eq!(checkout.next_step().unwrap(), CheckoutStepId::Shipping);
    assert!(!checkout.can_proceed());
    assert!(checkout.next_step().is_err());
    assert_eq!(checkout.current_step().id, CheckoutStepId::Shipping);

    checkout.update_checkout_data(|data| {
        data.shipping_address = Some(storefront_cart::checkout::Address {
            full_name: "Alice Liddell".into(),
            line1: "1 Rabbit Hole".into(),
            city: "Oxford".into(),
            postal_code: "OX1".into(),
            country: "GB".into(),
            email: "alice@example.com".into(),
            ..Default::default()
        });
        data.shipping_method = Some(ShippingMethod::Standard);
    });
    assert!(checkout.can_proceed());
    assert_eq!(checkout.next_step().unwrap(), CheckoutStepId::Billing);
}
