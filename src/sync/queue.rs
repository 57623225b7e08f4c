//! Offline action queue
//!
//! Mutations that could not reach the backend wait here, persisted through the
//! key-value store so they survive a reload. A sync pass replays every due
//! action; transient failures back off exponentially (with jitter) until
//! `max_retries` is reached, permanent failures are dropped at once. Drops are
//! logged and published as `QueueEvent::Dropped`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use crate::backend::CartOperation;
use crate::config::EngineConfig;
use crate::error::{BackendError, StorageError, SyncError};
use crate::storage::KeyValueStore;

const QUEUE_KEY: &str = "offline_actions";
const EVENT_CAPACITY: usize = 64;

/// Which part of the store an action belongs to.
///
/// Only `Cart` actions are replayed by this crate. The other values keep
/// actions written by other storefront modules readable; the cart executor
/// refuses them as `Unsupported` and they are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDomain {
    Cart,
    Order,
    User,
    Product,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPriority {
    Low,
    Normal,
    High,
}

/// A pending mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAction {
    pub id: Uuid,
    pub domain: ActionDomain,
    pub operation: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: ActionPriority,
    /// Earliest time the next attempt may run
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Payload of a queued cart mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedCartCommand {
    pub user_id: String,
    pub op: CartOperation,
    /// Local revision the mutation was made at
    pub revision: u64,
}

impl QueuedCartCommand {
    pub fn from_action(action: &OfflineAction) -> Option<Self> {
        if action.domain != ActionDomain::Cart {
            return None;
        }
        serde_json::from_value(action.payload.clone()).ok()
    }

    /// Whether this command and a mutation of `user_id`'s `target` line have
    /// to reach the server in order. A clear overlaps every line.
    pub fn overlaps(&self, user_id: &str, target: Option<&str>) -> bool {
        self.user_id == user_id
            && match (self.op.item_id(), target) {
                (Some(own), Some(other)) => own == other,
                _ => true,
            }
    }
}

/// What the caller supplies; id, timestamps and counters are filled in by the queue
#[derive(Debug, Clone)]
pub struct NewAction {
    pub domain: ActionDomain,
    pub operation: String,
    pub payload: Value,
    pub priority: ActionPriority,
    pub max_retries: Option<u32>,
}

impl NewAction {
    pub fn cart(user_id: &str, op: &CartOperation, revision: u64) -> Self {
        Self::from(QueuedCartCommand {
            user_id: user_id.to_string(),
            op: op.clone(),
            revision,
        })
    }

    pub fn with_priority(mut self, priority: ActionPriority) -> Self {
        self.priority = priority;
        self
    }
}

impl From<QueuedCartCommand> for NewAction {
    fn from(command: QueuedCartCommand) -> Self {
        Self {
            domain: ActionDomain::Cart,
            operation: command.op.name().to_string(),
            payload: serde_json::to_value(&command).unwrap_or(Value::Null),
            priority: ActionPriority::Normal,
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued(Uuid),
    Synced(Uuid),
    Dropped { action: OfflineAction, reason: String },
}

/// Replays one action against whatever owns its domain
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &OfflineAction) -> Result<(), BackendError>;
}

/// Backoff settings
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }

    /// Delay before attempt `retry_count + 1`: base · 2^(n-1), capped, plus up to 25% jitter
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let jitter_ms = (delay.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Counts from one sync pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPassReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub retrying: usize,
    /// Left for a later pass because an earlier action on the same line failed
    pub deferred: usize,
    /// Gave up after `max_retries` transient failures
    pub dropped: Vec<OfflineAction>,
    /// Refused by the server
    pub rejected: Vec<OfflineAction>,
}

pub struct OfflineActionQueue {
    actions: Mutex<Vec<OfflineAction>>,
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
    syncing: AtomicBool,
    enqueued: Notify,
    events: broadcast::Sender<QueueEvent>,
}

/// Clears an in-progress flag when a pass ends, however it ends
pub(crate) struct PassGuard<'a>(pub(crate) &'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl OfflineActionQueue {
    /// Loads persisted actions; an unreadable queue starts empty
    pub fn restore(store: Arc<dyn KeyValueStore>, policy: RetryPolicy) -> Self {
        let actions = match store.get(QUEUE_KEY) {
            Ok(Some(raw)) => serde_json::from_str::<Vec<OfflineAction>>(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Discarding unreadable offline queue");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read offline queue");
                Vec::new()
            }
        };
        if !actions.is_empty() {
            tracing::info!(pending = actions.len(), "Restored offline actions");
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            actions: Mutex::new(actions),
            store,
            policy,
            syncing: AtomicBool::new(false),
            enqueued: Notify::new(),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OfflineAction>> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, actions: &[OfflineAction]) {
        let result = serde_json::to_string(actions)
            .map_err(StorageError::from)
            .and_then(|json| self.store.set(QUEUE_KEY, &json));
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to persist offline queue");
        }
    }

    /// Stores a new action and wakes whoever waits on [`Self::enqueued`]
    pub fn enqueue(&self, new: NewAction) -> OfflineAction {
        let now = Utc::now();
        let action = OfflineAction {
            id: Uuid::new_v4(),
            domain: new.domain,
            operation: new.operation,
            payload: new.payload,
            created_at: now,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(self.policy.max_retries).max(1),
            priority: new.priority,
            next_attempt_at: now,
            last_error: None,
        };

        {
            let mut actions = self.lock();
            actions.push(action.clone());
            self.persist(&actions);
        }
        tracing::debug!(id = %action.id, operation = %action.operation, "Queued offline action");
        let _ = self.events.send(QueueEvent::Enqueued(action.id));
        self.enqueued.notify_one();
        action
    }

    /// Removes an action, returning it if it was queued
    pub fn dequeue(&self, id: Uuid) -> Option<OfflineAction> {
        let mut actions = self.lock();
        let pos = actions.iter().position(|a| a.id == id)?;
        let action = actions.remove(pos);
        self.persist(&actions);
        Some(action)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn actions(&self) -> Vec<OfflineAction> {
        self.lock().clone()
    }

    /// Time until the earliest action becomes due, zero if one already is
    pub fn next_attempt_in(&self) -> Option<Duration> {
        let earliest = self.lock().iter().map(|a| a.next_attempt_at).min()?;
        Some((earliest - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Decoded cart commands, in queue order
    pub fn cart_commands(&self) -> Vec<QueuedCartCommand> {
        self.lock()
            .iter()
            .filter_map(QueuedCartCommand::from_action)
            .collect()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Resolves once an action is enqueued (a permit is kept if nobody was waiting)
    pub async fn enqueued(&self) {
        self.enqueued.notified().await
    }

    /// Replays every due action, highest priority first, FIFO within a priority.
    ///
    /// Once a cart command fails transiently, later commands on the same line
    /// wait for the next pass. Only one pass runs at a time; a second caller
    /// gets `AlreadyRunning`.
    pub async fn sync_all(&self, executor: &dyn ActionExecutor) -> Result<SyncPassReport, SyncError> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyRunning);
        }
        let _guard = PassGuard(&self.syncing);

        let now = Utc::now();
        let (mut due, waiting): (Vec<OfflineAction>, Vec<OfflineAction>) = self
            .lock()
            .iter()
            .cloned()
            .partition(|a| a.next_attempt_at <= now);
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let mut report = SyncPassReport::default();
        // commands still backing off hold back anything queued after them
        let mut held: Vec<(DateTime<Utc>, QueuedCartCommand)> = waiting
            .iter()
            .filter_map(|a| QueuedCartCommand::from_action(a).map(|c| (a.created_at, c)))
            .collect();
        for action in due {
            let command = QueuedCartCommand::from_action(&action);
            if let Some(command) = &command {
                let target = command.op.item_id();
                let blocked = held.iter().any(|(created_at, h)| {
                    *created_at <= action.created_at && h.overlaps(&command.user_id, target)
                });
                if blocked {
                    report.deferred += 1;
                    held.push((action.created_at, command.clone()));
                    continue;
                }
            }

            report.attempted += 1;
            match executor.execute(&action).await {
                Ok(()) => {
                    if self.dequeue(action.id).is_some() {
                        report.succeeded += 1;
                        let _ = self.events.send(QueueEvent::Synced(action.id));
                    }
                }
                Err(e) if !e.is_retryable() => {
                    if let Some(rejected) = self.drop_action(action.id, e.to_string()) {
                        report.rejected.push(rejected);
                    }
                }
                Err(e) => {
                    match self.record_failure(action.id, &e) {
                        Some(FailureOutcome::Retrying) => report.retrying += 1,
                        Some(FailureOutcome::Dropped(dropped)) => report.dropped.push(dropped),
                        None => {}
                    }
                    held.extend(command.map(|c| (action.created_at, c)));
                }
            }
        }

        if report.attempted > 0 {
            tracing::debug!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                retrying = report.retrying,
                deferred = report.deferred,
                dropped = report.dropped.len(),
                rejected = report.rejected.len(),
                "Offline sync pass finished"
            );
        }
        Ok(report)
    }

    fn record_failure(&self, id: Uuid, error: &BackendError) -> Option<FailureOutcome> {
        let exhausted = {
            let mut actions = self.lock();
            let action = actions.iter_mut().find(|a| a.id == id)?;
            action.retry_count += 1;
            action.last_error = Some(error.to_string());
            if action.retry_count >= action.max_retries {
                true
            } else {
                let delay = self.policy.delay_for(action.retry_count);
                action.next_attempt_at =
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                self.persist(&actions);
                false
            }
        };

        if exhausted {
            self.drop_action(id, format!("gave up after retries: {}", error))
                .map(FailureOutcome::Dropped)
        } else {
            Some(FailureOutcome::Retrying)
        }
    }

    fn drop_action(&self, id: Uuid, reason: String) -> Option<OfflineAction> {
        let action = self.dequeue(id)?;
        tracing::warn!(
            id = %action.id,
            operation = %action.operation,
            retries = action.retry_count,
            reason = %reason,
            "Dropping offline action"
        );
        let _ = self.events.send(QueueEvent::Dropped {
            action: action.clone(),
            reason,
        });
        Some(action)
    }
}

enum FailureOutcome {
    Retrying,
    Dropped(OfflineAction),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    /// Fails with the configured error for the first `failures` calls
    struct ScriptedExecutor {
        failures: usize,
        error: BackendError,
        calls: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(failures: usize, error: BackendError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ActionExecutor for ScriptedExecutor {
        async fn execute(&self, _action: &OfflineAction) -> Result<(), BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    fn immediate_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn queue(store: Arc<dyn KeyValueStore>) -> OfflineActionQueue {
        OfflineActionQueue::restore(store, immediate_policy(3))
    }

    fn add_op(id: &str) -> CartOperation {
        CartOperation::AddItem {
            product_id: id.into(),
            quantity: 1,
        }
    }

    #[tokio::test]
    async fn test_success_dequeues() {
        let queue = queue(Arc::new(MemoryStore::new()));
        queue.enqueue(NewAction::cart("alice", &add_op("p1"), 1));
        let executor = ScriptedExecutor::new(0, BackendError::Timeout);

        let report = queue.sync_all(&executor).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_retry_cap_drops_after_max_retries() {
        let queue = queue(Arc::new(MemoryStore::new()));
        let mut events = queue.subscribe();
        queue.enqueue(NewAction::cart("alice", &add_op("p1"), 1));
        let executor = ScriptedExecutor::new(usize::MAX, BackendError::Timeout);

        for _ in 0..2 {
            let report = queue.sync_all(&executor).await.unwrap();
            assert_eq!(report.retrying, 1);
        }
        let report = queue.sync_all(&executor).await.unwrap();
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].retry_count, 3);
        assert!(queue.is_empty());

        // a fourth pass has nothing left to try
        let report = queue.sync_all(&executor).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

        assert!(matches!(events.try_recv(), Ok(QueueEvent::Enqueued(_))));
        assert!(matches!(events.try_recv(), Ok(QueueEvent::Dropped { .. })));
    }

    #[tokio::test]
    async fn test_permanent_failure_drops_immediately() {
        let queue = queue(Arc::new(MemoryStore::new()));
        queue.enqueue(NewAction::cart("alice", &add_op("ghost"), 1));
        let executor = ScriptedExecutor::new(1, BackendError::NotFound("ghost".into()));

        let report = queue.sync_all(&executor).await.unwrap();
        assert_eq!(report.rejected.len(), 1);
        assert!(report.dropped.is_empty());
        assert_eq!(report.rejected[0].retry_count, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_command_holds_back_later_ones_on_its_line() {
        /// Times out the first add of `p1`, records everything it runs
        struct FlakyAdd {
            failed: AtomicBool,
            ran: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl ActionExecutor for FlakyAdd {
            async fn execute(&self, action: &OfflineAction) -> Result<(), BackendError> {
                let command = QueuedCartCommand::from_action(action).unwrap();
                if command.op == add_op("p1") && !self.failed.swap(true, Ordering::SeqCst) {
                    return Err(BackendError::Timeout);
                }
                self.ran
                    .lock()
                    .unwrap()
                    .push(format!("{} {}", action.operation, command.op.item_id().unwrap_or("*")));
                Ok(())
            }
        }

        let queue = queue(Arc::new(MemoryStore::new()));
        let set_p1 = CartOperation::SetQuantity {
            item_id: "p1".into(),
            quantity: 5,
        };
        queue.enqueue(NewAction::cart("alice", &add_op("p1"), 1));
        queue.enqueue(NewAction::cart("alice", &set_p1, 2));
        queue.enqueue(NewAction::cart("alice", &add_op("p2"), 3));
        queue.enqueue(NewAction::cart("bob", &set_p1, 4));
        let executor = FlakyAdd {
            failed: AtomicBool::new(false),
            ran: Mutex::new(Vec::new()),
        };

        let report = queue.sync_all(&executor).await.unwrap();
        assert_eq!(report.retrying, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.succeeded, 2);
        assert_eq!(queue.len(), 2);

        let report = queue.sync_all(&executor).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert!(queue.is_empty());
        assert_eq!(
            *executor.ran.lock().unwrap(),
            vec![
                "add_item p2",
                "set_quantity p1",
                "add_item p1",
                "set_quantity p1",
            ]
        );
    }

    #[test]
    fn test_clear_overlaps_every_line() {
        let command = |op: CartOperation| QueuedCartCommand {
            user_id: "alice".into(),
            op,
            revision: 1,
        };
        assert!(command(CartOperation::Clear).overlaps("alice", Some("p1")));
        assert!(command(add_op("p1")).overlaps("alice", None));
        assert!(command(add_op("p1")).overlaps("alice", Some("p1")));
        assert!(!command(add_op("p1")).overlaps("alice", Some("p2")));
        assert!(!command(CartOperation::Clear).overlaps("bob", None));
    }

    #[tokio::test]
    async fn test_backoff_defers_next_attempt() {
        let queue = OfflineActionQueue::restore(
            Arc::new(MemoryStore::new()),
            RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(600),
            },
        );
        queue.enqueue(NewAction::cart("alice", &add_op("p1"), 1));
        let executor = ScriptedExecutor::new(usize::MAX, BackendError::Timeout);

        assert_eq!(queue.sync_all(&executor).await.unwrap().retrying, 1);
        let report = queue.sync_all(&executor).await.unwrap();
        assert_eq!(report.attempted, 0, "action should wait out its backoff");
        assert_eq!(queue.actions()[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        struct Recorder(Mutex<Vec<String>>);

        #[async_trait]
        impl ActionExecutor for Recorder {
            async fn execute(&self, action: &OfflineAction) -> Result<(), BackendError> {
                self.0.lock().unwrap().push(action.operation.clone());
                Ok(())
            }
        }

        let queue = queue(Arc::new(MemoryStore::new()));
        queue.enqueue(NewAction::cart("alice", &add_op("a"), 1));
        queue.enqueue(NewAction::cart("alice", &CartOperation::Clear, 2));
        queue.enqueue(
            NewAction::cart("alice", &CartOperation::RemoveItem { item_id: "a".into() }, 3)
                .with_priority(ActionPriority::High),
        );

        let recorder = Recorder(Mutex::new(Vec::new()));
        queue.sync_all(&recorder).await.unwrap();
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["remove_item", "add_item", "clear"]
        );
    }

    #[tokio::test]
    async fn test_queue_survives_reload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let action = queue(store.clone()).enqueue(NewAction::cart("alice", &add_op("p1"), 7));

        let reloaded = queue(store.clone());
        assert_eq!(reloaded.actions(), vec![action.clone()]);
        let command = QueuedCartCommand::from_action(&action).unwrap();
        assert_eq!(command.revision, 7);
        assert_eq!(command.op, add_op("p1"));

        store.set("offline_actions", "garbage").unwrap();
        assert!(queue(store).is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_refused() {
        struct Slow(Arc<Notify>);

        #[async_trait]
        impl ActionExecutor for Slow {
            async fn execute(&self, _action: &OfflineAction) -> Result<(), BackendError> {
                self.0.notified().await;
                Ok(())
            }
        }

        let queue = Arc::new(queue(Arc::new(MemoryStore::new())));
        queue.enqueue(NewAction::cart("alice", &add_op("p1"), 1));
        let gate = Arc::new(Notify::new());

        let first = {
            let queue = queue.clone();
            let gate = gate.clone();
            tokio::spawn(async move { queue.sync_all(&Slow(gate)).await })
        };
        while !queue.is_syncing() {
            tokio::task::yield_now().await;
        }

        let second = queue.sync_all(&Slow(gate.clone())).await;
        assert_eq!(second, Err(SyncError::AlreadyRunning));

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap().succeeded, 1);
        assert!(!queue.is_syncing());
    }
}
