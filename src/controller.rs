//! Cart controller
//!
//! The command surface the UI talks to. Every command is applied to the local
//! cart synchronously and returns the new snapshot; the matching backend call
//! runs on a spawned task. On success the authoritative cart is folded back in,
//! on a transport failure the change is queued for retry, and on a rejection
//! the server's view wins for that line. Changes to one line reach the backend
//! one at a time, in the order they were made.
//!
//! Commands spawn tasks, so the controller must be used inside a Tokio runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::backend::{CartBackend, CartOperation};
use crate::cart::models::{CartItem, Product};
use crate::cart::persistence::CartPersistence;
use crate::cart::state::CartModel;
use crate::cart::validator::{validate, validate_for_checkout, ValidationReport};
use crate::checkout::CheckoutStateMachine;
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::session::{CartSession, Touch, GUEST_USER};
use crate::storage::KeyValueStore;
use crate::sync::{
    Connectivity, NewAction, OfflineAction, OfflineActionQueue, QueueEvent, RetryPolicy,
    SyncCoordinator, SyncReport, SyncStatus,
};

/// Storage key holding the signed-in user; written by whoever handles sign-in
pub const ACTIVE_USER_KEY: &str = "active_user";

/// How the initial load ended
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// The server answered in time and was reconciled
    Synced(SyncReport),
    /// Offline or the server failed; the persisted cart is shown
    LocalOnly,
    /// The server was too slow; the persisted cart is shown and the result
    /// is applied once it arrives
    TimedOut,
}

#[derive(Clone)]
pub struct CartController {
    session: Arc<CartSession>,
    backend: Arc<dyn CartBackend>,
    queue: Arc<OfflineActionQueue>,
    coordinator: Arc<SyncCoordinator>,
    connectivity: Arc<Connectivity>,
    store: Arc<dyn KeyValueStore>,
    config: EngineConfig,
    lanes: Arc<Mutex<DispatchLanes>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Completion signals of dispatched commands, keyed by the line they touch.
///
/// A command waits for the previous one on its line (a clear waits for
/// everything) so the backend sees a line's mutations in the order they were made.
#[derive(Default)]
struct DispatchLanes {
    cart: Option<watch::Receiver<bool>>,
    lines: HashMap<String, watch::Receiver<bool>>,
}

impl DispatchLanes {
    fn prune(&mut self) {
        self.lines.retain(|_, done| !*done.borrow());
        if self.cart.as_ref().is_some_and(|done| *done.borrow()) {
            self.cart = None;
        }
    }

    fn is_idle(&mut self, target: Option<&str>) -> bool {
        self.prune();
        self.cart.is_none()
            && match target {
                Some(id) => !self.lines.contains_key(id),
                None => self.lines.is_empty(),
            }
    }

    /// Registers a dispatch and returns the signals it has to wait for
    fn enter(&mut self, target: Option<&str>, done: watch::Receiver<bool>) -> Vec<watch::Receiver<bool>> {
        self.prune();
        match target {
            Some(id) => self
                .lines
                .insert(id.to_string(), done)
                .or_else(|| self.cart.clone())
                .into_iter()
                .collect(),
            None => {
                let mut previous: Vec<_> = self.lines.drain().map(|(_, done)| done).collect();
                previous.extend(self.cart.replace(done));
                previous
            }
        }
    }
}

/// Signals the lane however the dispatch task ends
struct LaneRelease(watch::Sender<bool>);

impl Drop for LaneRelease {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

async fn wait_for_lanes(previous: Vec<watch::Receiver<bool>>) {
    for mut done in previous {
        let _ = done.wait_for(|finished| *finished).await;
    }
}

impl CartController {
    /// Hydrates `user`'s cart and the offline queue from `store`
    pub fn new(
        user: impl Into<String>,
        backend: Arc<dyn CartBackend>,
        store: Arc<dyn KeyValueStore>,
        config: EngineConfig,
    ) -> Self {
        let persistence = CartPersistence::new(store.clone(), config.backup_ttl);
        let session = Arc::new(CartSession::new(user, persistence));
        let queue = Arc::new(OfflineActionQueue::restore(
            store.clone(),
            RetryPolicy::from_config(&config),
        ));
        session.seed_pending(&queue.cart_commands());

        let connectivity = Arc::new(Connectivity::default());
        let coordinator = Arc::new(SyncCoordinator::new(
            session.clone(),
            backend.clone(),
            queue.clone(),
            connectivity.clone(),
            &config,
        ));

        Self {
            session,
            backend,
            queue,
            coordinator,
            connectivity,
            store,
            config,
            lanes: Arc::new(Mutex::new(DispatchLanes::default())),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Adds a line (merging with an existing one). Zero quantities and
    /// negative prices are ignored.
    pub fn add_item(&self, item: CartItem) -> CartModel {
        if item.quantity == 0 || item.price < Decimal::ZERO {
            tracing::debug!(item_id = %item.id, "Ignoring invalid add");
            return self.snapshot();
        }
        let id = item.id.clone();
        let op = CartOperation::AddItem {
            product_id: id.clone(),
            quantity: item.quantity,
        };
        let (cart, revision) = self.session.mutate(Touch::Line(&id), |cart| {
            cart.add_item(item);
            cart.clone()
        });
        self.dispatch(op, revision);
        cart
    }

    pub fn add_product(&self, product: &Product, quantity: u32) -> CartModel {
        self.add_item(product.to_cart_item(quantity))
    }

    pub fn remove_item(&self, id: &str) -> CartModel {
        if !self.session.snapshot().contains(id) {
            return self.snapshot();
        }
        let (cart, revision) = self.session.mutate(Touch::Line(id), |cart| {
            cart.remove_item(id);
            cart.clone()
        });
        self.dispatch(
            CartOperation::RemoveItem {
                item_id: id.to_string(),
            },
            revision,
        );
        cart
    }

    /// Zero or a negative quantity removes the line
    pub fn set_quantity(&self, id: &str, quantity: i64) -> CartModel {
        if quantity <= 0 {
            return self.remove_item(id);
        }
        if !self.session.snapshot().contains(id) {
            return self.snapshot();
        }
        let quantity = u32::try_from(quantity).unwrap_or(u32::MAX);
        let (cart, revision) = self.session.mutate(Touch::Line(id), |cart| {
            cart.set_quantity(id, quantity);
            cart.clone()
        });
        self.dispatch(
            CartOperation::SetQuantity {
                item_id: id.to_string(),
                quantity,
            },
            revision,
        );
        cart
    }

    pub fn clear(&self) -> CartModel {
        let (cart, revision) = self.session.mutate(Touch::All, |cart| {
            cart.clear();
            cart.clone()
        });
        self.dispatch(CartOperation::Clear, revision);
        cart
    }

    pub fn apply_coupon(&self, code: &str) -> bool {
        self.session
            .mutate(Touch::Nothing, |cart| cart.apply_coupon(code))
            .0
    }

    pub fn remove_coupon(&self) -> CartModel {
        self.local(|cart| cart.remove_coupon())
    }

    /// Returns the amount actually applied
    pub fn apply_gift_card(&self, code: &str, amount: Decimal) -> Decimal {
        self.session
            .mutate(Touch::Nothing, |cart| cart.apply_gift_card(code, amount))
            .0
    }

    pub fn remove_gift_card(&self) -> CartModel {
        self.local(|cart| cart.remove_gift_card())
    }

    /// Moves a line to the saved list; the server sees a removal
    pub fn save_for_later(&self, id: &str) -> CartModel {
        if !self.session.snapshot().contains(id) {
            return self.snapshot();
        }
        let (cart, revision) = self.session.mutate(Touch::Line(id), |cart| {
            cart.save_for_later(id);
            cart.clone()
        });
        self.dispatch(
            CartOperation::RemoveItem {
                item_id: id.to_string(),
            },
            revision,
        );
        cart
    }

    /// Moves a saved entry back; the server sees an add of one unit
    pub fn move_to_cart(&self, id: &str) -> CartModel {
        if !self.session.snapshot().saved().iter().any(|s| s.id == id) {
            return self.snapshot();
        }
        let (cart, revision) = self.session.mutate(Touch::Line(id), |cart| {
            cart.move_to_cart(id);
            cart.clone()
        });
        self.dispatch(
            CartOperation::AddItem {
                product_id: id.to_string(),
                quantity: 1,
            },
            revision,
        );
        cart
    }

    pub fn remove_saved(&self, id: &str) -> CartModel {
        self.local(|cart| {
            cart.remove_saved(id);
        })
    }

    fn local(&self, f: impl FnOnce(&mut CartModel)) -> CartModel {
        self.session
            .mutate(Touch::Nothing, |cart| {
                f(cart);
                cart.clone()
            })
            .0
    }

    // =========================================================================
    // Projections
    // =========================================================================

    pub fn snapshot(&self) -> CartModel {
        self.session.snapshot()
    }

    /// Receives every new snapshot
    pub fn subscribe(&self) -> watch::Receiver<CartModel> {
        self.session.subscribe()
    }

    pub fn user(&self) -> String {
        self.session.user()
    }

    pub fn validate(&self, products: &HashMap<String, Product>) -> ValidationReport {
        validate(&self.snapshot(), products)
    }

    pub fn validate_for_checkout(&self, products: &HashMap<String, Product>) -> ValidationReport {
        validate_for_checkout(&self.snapshot(), products)
    }

    /// Starts a checkout attempt over the current snapshot
    pub fn begin_checkout(&self, products: HashMap<String, Product>) -> CheckoutStateMachine {
        CheckoutStateMachine::new(self.snapshot(), products)
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.coordinator.get_sync_status()
    }

    pub fn has_pending_changes(&self) -> bool {
        self.coordinator.has_pending_changes()
    }

    pub fn pending_actions(&self) -> Vec<OfflineAction> {
        self.queue.actions()
    }

    /// Queue notifications, including actions dropped after their last retry
    pub fn queue_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Races a full sync against the initial-load timeout.
    ///
    /// When the timeout wins the sync keeps running and its result is still
    /// applied when it arrives.
    pub async fn load(&self) -> LoadOutcome {
        if !self.connectivity.is_online() {
            return LoadOutcome::LocalOnly;
        }

        let coordinator = self.coordinator.clone();
        let mut sync = tokio::spawn(async move { coordinator.force_sync().await });
        match tokio::time::timeout(self.config.initial_load_timeout, &mut sync).await {
            Ok(Ok(Ok(report))) => LoadOutcome::Synced(report),
            Ok(Ok(Err(e))) => {
                tracing::warn!(error = %e, "Initial cart load failed, showing local cart");
                LoadOutcome::LocalOnly
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Initial cart load task failed");
                LoadOutcome::LocalOnly
            }
            Err(_) => {
                tracing::info!(
                    timeout_ms = self.config.initial_load_timeout.as_millis() as u64,
                    "Initial cart load timed out, showing local cart"
                );
                LoadOutcome::TimedOut
            }
        }
    }

    /// Full reconciliation right now
    pub async fn sync_now(&self) -> Result<SyncReport, SyncError> {
        self.coordinator.force_sync().await
    }

    /// Waits until no dispatched change is awaiting its response
    pub async fn flush(&self) {
        self.session.wait_idle().await
    }

    /// Starts the background sync loop and the active-user listener
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.coordinator.clone().spawn());
        tasks.push(self.spawn_identity_listener());
    }

    /// Cancels background work; nothing touches the cart afterwards
    pub async fn shutdown(&self) {
        self.session.close();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Cart background task ended abnormally");
            }
        }
        tracing::info!("Cart controller shut down");
    }

    /// Swaps in `user`'s persisted cart and asks for a sync.
    /// Returns `false` if `user` is already active.
    pub fn switch_user(&self, user: &str) -> bool {
        if !self.session.switch_user(user) {
            return false;
        }
        self.session.seed_pending(&self.queue.cart_commands());
        self.coordinator.request_sync();
        true
    }

    fn spawn_identity_listener(&self) -> JoinHandle<()> {
        let mut events = self.store.subscribe();
        let cancel = self.session.cancel_token();
        let this = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    event = events.recv() => match event {
                        Ok(event) if event.key == ACTIVE_USER_KEY => this.on_identity_change(),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(skipped = n, "Storage events lagged, re-reading active user");
                            this.on_identity_change();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    fn on_identity_change(&self) {
        let user = match self.store.get(ACTIVE_USER_KEY) {
            Ok(Some(user)) if !user.trim().is_empty() => user.trim().to_string(),
            Ok(_) => GUEST_USER.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read active user");
                return;
            }
        };
        self.switch_user(&user);
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn dispatch(&self, op: CartOperation, revision: u64) {
        if self.session.is_closed() {
            return;
        }
        let user = self.session.user();
        let target = op.item_id().map(str::to_string);

        let (release, previous) = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.connectivity.is_online() && lanes.is_idle(target.as_deref()) {
                tracing::debug!(user_id = %user, operation = op.name(), "Offline, queueing cart change");
                self.queue.enqueue(NewAction::cart(&user, &op, revision));
                return;
            }
            let (done, finished) = watch::channel(false);
            let previous = lanes.enter(target.as_deref(), finished);
            (LaneRelease(done), previous)
        };

        self.session.begin_flight(revision, target.as_deref());
        let this = self.clone();
        tokio::spawn(async move {
            let _release = release;
            this.complete_dispatch(&user, &op, revision, previous).await;
            this.session.end_flight(revision);
        });
    }

    async fn complete_dispatch(
        &self,
        user: &str,
        op: &CartOperation,
        revision: u64,
        previous: Vec<watch::Receiver<bool>>,
    ) {
        tokio::select! {
            _ = self.session.closed() => return,
            _ = wait_for_lanes(previous) => {}
        }

        // an earlier change to this line is waiting in the queue
        let target = op.item_id();
        let queued_ahead = self
            .queue
            .cart_commands()
            .iter()
            .any(|command| command.overlaps(user, target));
        if queued_ahead || !self.connectivity.is_online() {
            tracing::debug!(user_id = %user, operation = op.name(), "Queueing cart change behind earlier ones");
            self.queue.enqueue(NewAction::cart(user, op, revision));
            return;
        }

        let result = tokio::select! {
            _ = self.session.closed() => return,
            result = op.execute(self.backend.as_ref(), user) => result,
        };

        match result {
            Ok(cart) => {
                let corrections = self
                    .session
                    .apply_confirmation(user, revision, op.item_id(), &cart);
                for correction in corrections {
                    self.queue.enqueue(correction.into());
                }
            }
            Err(e) if e.is_retryable() => {
                if self.session.is_closed() {
                    return;
                }
                tracing::debug!(user_id = %user, operation = op.name(), error = %e, "Cart change failed, queueing for retry");
                self.queue.enqueue(NewAction::cart(user, op, revision));
            }
            Err(e) => {
                tracing::warn!(user_id = %user, operation = op.name(), error = %e, "Server rejected cart change");
                let target = op.item_id().map(str::to_string);
                self.coordinator
                    .settle_rejected(user, &[(target, revision)])
                    .await;
            }
        }
    }
}
