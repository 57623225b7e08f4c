//! Sync coordinator
//!
//! Everything that talks to the backend outside a direct command dispatch:
//! replaying the offline queue, full reconciliation passes, and the background
//! loop that runs them on a timer, on reconnect, on demand, and whenever an
//! action is queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::connectivity::Connectivity;
use super::queue::{
    ActionExecutor, NewAction, OfflineAction, OfflineActionQueue, PassGuard, QueuedCartCommand,
    SyncPassReport,
};
use super::reconcile::{CartConflict, ConflictKind, ConflictValue, Resolution};
use crate::backend::{CartBackend, CartOperation};
use crate::config::EngineConfig;
use crate::error::{BackendError, SyncError};
use crate::session::CartSession;

/// Lower bound for the queue retry poll, so a pass held elsewhere does not spin the loop
const MIN_RETRY_POLL: Duration = Duration::from_millis(100);

/// What the UI shows next to the cart
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub has_pending_changes: bool,
    pub pending_actions: usize,
}

/// Result of one `force_sync` pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub conflicts: Vec<CartConflict>,
    /// Queued actions replayed successfully before reconciling
    pub replayed: usize,
    /// Queued actions given up on during the replay
    pub dropped: usize,
    /// Local wins pushed to the server
    pub uploaded: usize,
    /// Uploads that failed transiently and went to the queue
    pub queued: usize,
}

/// Replays queued cart commands and folds their confirmations into the session
pub struct CartActionExecutor {
    session: Arc<CartSession>,
    backend: Arc<dyn CartBackend>,
    queue: Arc<OfflineActionQueue>,
}

#[async_trait]
impl ActionExecutor for CartActionExecutor {
    async fn execute(&self, action: &OfflineAction) -> Result<(), BackendError> {
        let Some(command) = QueuedCartCommand::from_action(action) else {
            return Err(BackendError::Unsupported(format!(
                "{:?} {}",
                action.domain, action.operation
            )));
        };

        let cart = command
            .op
            .execute(self.backend.as_ref(), &command.user_id)
            .await?;
        let corrections = self.session.apply_confirmation(
            &command.user_id,
            command.revision,
            command.op.item_id(),
            &cart,
        );
        for correction in corrections {
            self.queue.enqueue(correction.into());
        }
        Ok(())
    }
}

pub struct SyncCoordinator {
    session: Arc<CartSession>,
    backend: Arc<dyn CartBackend>,
    queue: Arc<OfflineActionQueue>,
    connectivity: Arc<Connectivity>,
    executor: CartActionExecutor,
    sync_interval: Duration,
    syncing: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    manual: Notify,
}

impl SyncCoordinator {
    pub fn new(
        session: Arc<CartSession>,
        backend: Arc<dyn CartBackend>,
        queue: Arc<OfflineActionQueue>,
        connectivity: Arc<Connectivity>,
        config: &EngineConfig,
    ) -> Self {
        let executor = CartActionExecutor {
            session: session.clone(),
            backend: backend.clone(),
            queue: queue.clone(),
        };
        Self {
            session,
            backend,
            queue,
            connectivity,
            executor,
            sync_interval: config.sync_interval.max(Duration::from_millis(1)),
            syncing: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            manual: Notify::new(),
        }
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.queue.is_empty() || self.session.has_unacknowledged()
    }

    pub fn get_sync_status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.connectivity.is_online(),
            last_sync_timestamp: self.last_sync(),
            has_pending_changes: self.has_pending_changes(),
            pending_actions: self.queue.len(),
        }
    }

    /// Asks the background loop for a full pass
    pub fn request_sync(&self) {
        self.manual.notify_one();
    }

    /// Replays due queued actions, then lets the server win on the lines of
    /// any action the server refused.
    ///
    /// Actions given up on after their last retry never reached the server;
    /// their lines stay pending so the next full sync uploads the local intent.
    pub async fn sync_pending(&self) -> Result<SyncPassReport, SyncError> {
        if self.session.is_closed() {
            return Err(SyncError::ShutDown);
        }
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        if self.queue.is_empty() {
            return Ok(SyncPassReport::default());
        }

        let pass = self.queue.sync_all(&self.executor).await?;

        let user = self.session.user();
        let refused: Vec<(Option<String>, u64)> = pass
            .rejected
            .iter()
            .filter_map(QueuedCartCommand::from_action)
            .filter(|command| command.user_id == user)
            .map(|command| (command.op.item_id().map(str::to_string), command.revision))
            .collect();
        self.settle_rejected(&user, &refused).await;

        Ok(pass)
    }

    /// One reconciliation pass plus upload, regardless of the schedule.
    ///
    /// Replays the queue, fetches the server cart, merges it with the default
    /// policy and pushes the local wins. Uploads that fail transiently are
    /// queued; an add the server refuses becomes an availability conflict and
    /// the line is dropped locally.
    pub async fn force_sync(&self) -> Result<SyncReport, SyncError> {
        if self.session.is_closed() {
            return Err(SyncError::ShutDown);
        }
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        if self.syncing.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyRunning);
        }
        let _guard = PassGuard(&self.syncing);

        let mut report = SyncReport::default();
        match self.sync_pending().await {
            Ok(pass) => {
                report.replayed = pass.succeeded;
                report.dropped = pass.dropped.len() + pass.rejected.len();
            }
            // the loop is replaying right now; reconcile anyway
            Err(SyncError::AlreadyRunning) => {}
            Err(e) => return Err(e),
        }

        let user = self.session.user();
        let server = self.backend.fetch_cart(&user).await?;
        let queued = self.queue.cart_commands();
        let Some(plan) = self.session.reconcile_server(&user, &server, &queued) else {
            if self.session.is_closed() {
                return Err(SyncError::ShutDown);
            }
            tracing::debug!(user_id = %user, "User changed during sync, discarding pass");
            return Ok(report);
        };
        report.conflicts = plan.conflicts;

        let mut rejected = Vec::new();
        for op in plan.uploads {
            if self.session.is_closed() {
                return Err(SyncError::ShutDown);
            }
            match op.execute(self.backend.as_ref(), &user).await {
                Ok(cart) => {
                    report.uploaded += 1;
                    let corrections =
                        self.session
                            .apply_confirmation(&user, plan.revision, op.item_id(), &cart);
                    for correction in corrections {
                        self.queue.enqueue(correction.into());
                    }
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(user_id = %user, operation = op.name(), error = %e, "Upload failed, queueing");
                    self.queue.enqueue(NewAction::cart(&user, &op, plan.revision));
                    report.queued += 1;
                }
                Err(e) => {
                    tracing::warn!(user_id = %user, operation = op.name(), error = %e, "Server rejected cart change");
                    if let CartOperation::AddItem {
                        product_id,
                        quantity,
                    } = &op
                    {
                        report.conflicts.push(CartConflict {
                            kind: ConflictKind::Availability,
                            item_id: product_id.clone(),
                            local_value: ConflictValue::Quantity(*quantity),
                            server_value: ConflictValue::Missing,
                            resolution: Resolution::Server,
                        });
                    }
                    rejected.push((op.item_id().map(str::to_string), plan.revision));
                }
            }
        }
        self.settle_rejected(&user, &rejected).await;

        let now = Utc::now();
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        tracing::debug!(
            user_id = %user,
            conflicts = report.conflicts.len(),
            uploaded = report.uploaded,
            queued = report.queued,
            "Cart sync finished"
        );
        Ok(report)
    }

    /// Stops treating the given mutations as pending and lets the current
    /// server cart win on their lines
    pub async fn settle_rejected(&self, user: &str, rejected: &[(Option<String>, u64)]) {
        if rejected.is_empty() {
            return;
        }
        for (target, revision) in rejected {
            self.session.release(user, target.as_deref(), *revision);
        }

        match self.backend.fetch_cart(user).await {
            Ok(cart) => {
                for (target, revision) in rejected {
                    let corrections =
                        self.session
                            .apply_confirmation(user, *revision, target.as_deref(), &cart);
                    for correction in corrections {
                        self.queue.enqueue(correction.into());
                    }
                }
            }
            Err(e) => {
                tracing::debug!(user_id = %user, error = %e, "Could not refresh cart after rejected change");
            }
        }
    }

    /// Starts the background loop; it stops when the session is closed
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        tracing::info!("Cart sync loop started");
        let cancel = self.session.cancel_token();
        let mut online = self.connectivity.subscribe();
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // skip immediate tick

        loop {
            let retry_in = if self.connectivity.is_online() {
                self.queue.next_attempt_in().map(|d| d.max(MIN_RETRY_POLL))
            } else {
                None
            };

            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = ticker.tick() => self.run_pass("periodic").await,

                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *online.borrow_and_update() {
                        self.run_pass("reconnected").await;
                    }
                }

                _ = self.manual.notified() => self.run_pass("manual").await,

                _ = self.queue.enqueued() => self.replay().await,

                _ = tokio::time::sleep(retry_in.unwrap_or_default()), if retry_in.is_some() => {
                    self.replay().await;
                }
            }
        }

        tracing::info!("Cart sync loop stopped");
    }

    async fn run_pass(&self, reason: &'static str) {
        match self.force_sync().await {
            Ok(report) => {
                if !report.conflicts.is_empty() {
                    tracing::info!(reason, conflicts = report.conflicts.len(), "Cart reconciled");
                }
            }
            Err(SyncError::AlreadyRunning | SyncError::Offline | SyncError::ShutDown) => {}
            Err(e) => tracing::warn!(reason, error = %e, "Cart sync failed"),
        }
    }

    async fn replay(&self) {
        match self.sync_pending().await {
            Ok(_) | Err(SyncError::AlreadyRunning | SyncError::Offline | SyncError::ShutDown) => {}
            Err(e) => tracing::warn!(error = %e, "Offline queue replay failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cart::models::CartItem;
    use crate::cart::persistence::CartPersistence;
    use crate::service::store::CartStore;
    use crate::session::Touch;
    use crate::storage::{KeyValueStore, MemoryStore};
    use crate::sync::queue::{ActionDomain, ActionPriority, RetryPolicy};
    use rust_decimal::Decimal;

    struct Fixture {
        session: Arc<CartSession>,
        backend: Arc<MemoryBackend>,
        queue: Arc<OfflineActionQueue>,
        connectivity: Arc<Connectivity>,
        coordinator: SyncCoordinator,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = EngineConfig::new().with_retry_delays(Duration::ZERO, Duration::ZERO);
        let session = Arc::new(CartSession::new(
            "alice",
            CartPersistence::new(store.clone(), config.backup_ttl),
        ));
        let backend = Arc::new(MemoryBackend::new(Arc::new(CartStore::demo())));
        let queue = Arc::new(OfflineActionQueue::restore(
            store,
            RetryPolicy::from_config(&config),
        ));
        let connectivity = Arc::new(Connectivity::default());
        let coordinator = SyncCoordinator::new(
            session.clone(),
            backend.clone(),
            queue.clone(),
            connectivity.clone(),
            &config,
        );
        Fixture {
            session,
            backend,
            queue,
            connectivity,
            coordinator,
        }
    }

    fn mug(quantity: u32) -> CartItem {
        CartItem::new("mug", "Ceramic Mug", Decimal::new(1250, 2), quantity)
    }

    #[tokio::test]
    async fn test_force_sync_uploads_local_lines_and_adopts_server_lines() {
        let f = fixture();
        f.backend.store().add_item("alice", "lamp", 1).unwrap();
        f.session
            .mutate(Touch::Line("mug"), |m| m.add_item(mug(2)));

        let report = f.coordinator.force_sync().await.unwrap();

        assert_eq!(report.uploaded, 1);
        let server = f.backend.store().cart("alice");
        assert_eq!(server.item("mug").map(|i| i.quantity), Some(2));
        let local = f.session.snapshot();
        assert!(local.contains("lamp"));
        assert!(local.contains("mug"));
        assert!(!f.coordinator.has_pending_changes());
        assert!(f.coordinator.get_sync_status().last_sync_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_rejected_add_becomes_availability_conflict() {
        let f = fixture();
        f.session.mutate(Touch::Line("ghost"), |m| {
            m.add_item(CartItem::new("ghost", "Ghost", Decimal::ONE, 1))
        });

        let report = f.coordinator.force_sync().await.unwrap();

        assert!(report
            .conflicts
            .iter()
            .any(|c| c.kind == ConflictKind::Availability && c.item_id == "ghost"));
        assert!(!f.session.snapshot().contains("ghost"));
    }

    #[tokio::test]
    async fn test_failed_upload_is_queued_then_replayed() {
        let f = fixture();
        f.session
            .mutate(Touch::Line("mug"), |m| m.add_item(mug(1)));

        // let the fetch through, then fail the upload that follows it
        let gate = f.backend.hold_next_response();
        let (report, _) = tokio::join!(f.coordinator.force_sync(), async {
            while f.backend.calls() < 1 {
                tokio::task::yield_now().await;
            }
            f.backend.fail_next(1);
            let _ = gate.send(());
        });

        let report = report.unwrap();
        assert_eq!((report.uploaded, report.queued), (0, 1));
        assert_eq!(f.queue.len(), 1);
        assert!(f.coordinator.has_pending_changes());

        let pass = f.coordinator.sync_pending().await.unwrap();
        assert_eq!(pass.succeeded, 1);
        assert_eq!(
            f.backend.store().cart("alice").item("mug").map(|i| i.quantity),
            Some(1)
        );
        assert!(!f.coordinator.has_pending_changes());
    }

    #[tokio::test]
    async fn test_offline_sync_is_refused() {
        let f = fixture();
        f.connectivity.set_online(false);
        assert_eq!(f.coordinator.force_sync().await, Err(SyncError::Offline));
        assert_eq!(f.coordinator.sync_pending().await, Err(SyncError::Offline));
        assert!(!f.coordinator.get_sync_status().is_online);
    }

    #[tokio::test]
    async fn test_refused_action_lets_server_win() {
        let f = fixture();
        let (_, revision) = f.session.mutate(Touch::Line("ghost"), |m| {
            m.add_item(CartItem::new("ghost", "Ghost", Decimal::ONE, 1))
        });
        f.queue.enqueue(NewAction::cart(
            "alice",
            &CartOperation::AddItem {
                product_id: "ghost".into(),
                quantity: 1,
            },
            revision,
        ));

        let pass = f.coordinator.sync_pending().await.unwrap();
        assert_eq!(pass.rejected.len(), 1);
        assert!(f.queue.is_empty());
        assert!(!f.session.snapshot().contains("ghost"));
    }

    #[tokio::test]
    async fn test_exhausted_action_keeps_local_intent() {
        let f = fixture();
        let (_, revision) = f.session.mutate(Touch::Line("mug"), |m| m.add_item(mug(2)));
        let mut action = NewAction::cart(
            "alice",
            &CartOperation::AddItem {
                product_id: "mug".into(),
                quantity: 2,
            },
            revision,
        );
        action.max_retries = Some(1);
        f.queue.enqueue(action);

        f.backend.fail_next(1);
        let pass = f.coordinator.sync_pending().await.unwrap();
        assert_eq!(pass.dropped.len(), 1);
        assert!(pass.rejected.is_empty());
        assert!(f.queue.is_empty());
        assert_eq!(f.session.snapshot().item("mug").map(|i| i.quantity), Some(2));
        assert!(f.coordinator.has_pending_changes());

        let report = f.coordinator.force_sync().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(
            f.backend.store().cart("alice").item("mug").map(|i| i.quantity),
            Some(2)
        );
        assert!(!f.coordinator.has_pending_changes());
    }

    #[tokio::test]
    async fn test_actions_outside_cart_domain_are_refused() {
        let f = fixture();
        f.queue.enqueue(NewAction {
            domain: ActionDomain::Order,
            operation: "place_order".into(),
            payload: serde_json::json!({ "orderId": "o-1" }),
            priority: ActionPriority::High,
            max_retries: None,
        });

        let pass = f.coordinator.sync_pending().await.unwrap();
        assert_eq!(pass.rejected.len(), 1);
        assert_eq!(pass.rejected[0].domain, ActionDomain::Order);
        assert!(f.queue.is_empty());
        assert_eq!(f.backend.calls(), 0);
    }
}
