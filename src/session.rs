//! Cart session
//!
//! Owns the live `CartModel` of the active user plus the bookkeeping that
//! keeps optimistic updates safe against late confirmations:
//!
//! - a revision counter bumped by every local mutation,
//! - per line, the revision that last touched it and the highest revision the
//!   server has acknowledged,
//! - the mutations currently in flight.
//!
//! Every state update that follows an `.await` goes through this type and is
//! ignored once the session is closed or the active user changed.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::backend::CartOperation;
use crate::cart::models::ServerCart;
use crate::cart::persistence::CartPersistence;
use crate::cart::state::CartModel;
use crate::sync::queue::QueuedCartCommand;
use crate::sync::reconcile::{
    corrective_operation, reconcile_with, CartConflict, ConfirmationPolicy, LocalIntentPolicy,
    ReconcileOutcome,
};

/// Carts without a signed-in user belong to this id
pub const GUEST_USER: &str = "guest";

/// Which lines a local mutation touches
#[derive(Debug, Clone, Copy)]
pub enum Touch<'a> {
    Line(&'a str),
    /// Every line (clear)
    All,
    /// Local-only changes such as coupons
    Nothing,
}

struct SessionState {
    user: String,
    model: CartModel,
    revision: u64,
    touched: HashMap<String, u64>,
    confirmed: HashMap<String, u64>,
    /// revision -> targeted line (`None` = whole cart)
    in_flight: HashMap<u64, Option<String>>,
}

impl SessionState {
    /// Lines restored from disk count as unacknowledged until a sync settles them
    fn hydrate(user: String, model: CartModel, revision: u64) -> Self {
        let revision = revision + 1;
        let touched = model
            .items()
            .iter()
            .map(|item| (item.id.clone(), revision))
            .collect();
        Self {
            user,
            model,
            revision,
            touched,
            confirmed: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    fn is_pending(&self, id: &str) -> bool {
        let confirmed = self.confirmed.get(id).copied().unwrap_or(0);
        self.touched.get(id).is_some_and(|&touched| touched > confirmed)
    }

    fn pending(&self) -> HashSet<String> {
        self.touched
            .keys()
            .filter(|id| self.is_pending(id))
            .cloned()
            .collect()
    }

    fn acknowledge(&mut self, id: &str, revision: u64) {
        let confirmed = self.confirmed.entry(id.to_string()).or_insert(0);
        *confirmed = (*confirmed).max(revision);
    }

    fn acknowledge_target(&mut self, target: Option<&str>, revision: u64) {
        match target {
            Some(id) => self.acknowledge(id, revision),
            None => {
                let ids: Vec<String> = self
                    .touched
                    .iter()
                    .filter(|(_, &touched)| touched <= revision)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in ids {
                    self.acknowledge(&id, revision);
                }
            }
        }
    }
}

/// Outcome of a full reconciliation against a fetched server cart
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub conflicts: Vec<CartConflict>,
    /// Calls needed to push local wins to the server
    pub uploads: Vec<CartOperation>,
    /// Revision the uploads are confirmed at
    pub revision: u64,
}

pub struct CartSession {
    state: Mutex<SessionState>,
    persistence: CartPersistence,
    snapshots: watch::Sender<CartModel>,
    in_flight: watch::Sender<usize>,
    cancel: CancellationToken,
}

impl CartSession {
    /// Hydrates `user`'s cart from the primary snapshot, the backup, or empty
    pub fn new(user: impl Into<String>, persistence: CartPersistence) -> Self {
        let user = user.into();
        let model = persistence.restore(&user, Utc::now());
        let state = SessionState::hydrate(user, model, 0);
        let (snapshots, _) = watch::channel(state.model.clone());
        let (in_flight, _) = watch::channel(0);
        Self {
            state: Mutex::new(state),
            persistence,
            snapshots,
            in_flight,
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persists (primary and backup) and publishes the current model
    fn commit(&self, state: &SessionState) {
        if let Err(e) = self.persistence.save(&state.user, &state.model) {
            tracing::warn!(user_id = %state.user, error = %e, "Failed to persist cart");
        }
        if let Err(e) = self
            .persistence
            .save_backup(&state.user, &state.model, Utc::now())
        {
            tracing::warn!(user_id = %state.user, error = %e, "Failed to write cart backup");
        }
        self.snapshots.send_replace(state.model.clone());
    }

    pub fn user(&self) -> String {
        self.lock().user.clone()
    }

    pub fn snapshot(&self) -> CartModel {
        self.lock().model.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CartModel> {
        self.snapshots.subscribe()
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Applies a local mutation synchronously and returns its result and revision
    pub fn mutate<R>(&self, touch: Touch<'_>, f: impl FnOnce(&mut CartModel) -> R) -> (R, u64) {
        let mut state = self.lock();
        let everything: Vec<String> = match touch {
            Touch::All => state
                .model
                .items()
                .iter()
                .map(|item| item.id.clone())
                .chain(state.touched.keys().cloned())
                .collect(),
            _ => Vec::new(),
        };

        let result = f(&mut state.model);
        state.revision += 1;
        let revision = state.revision;
        match touch {
            Touch::Line(id) => {
                state.touched.insert(id.to_string(), revision);
            }
            Touch::All => {
                for id in everything {
                    state.touched.insert(id, revision);
                }
            }
            Touch::Nothing => {}
        }
        self.commit(&state);
        (result, revision)
    }

    /// Folds a backend confirmation for the mutation at `revision` into the
    /// current model.
    ///
    /// Lines touched again since that mutation keep their local state. When
    /// such a line was already acknowledged at its newer revision but the
    /// server still disagrees, the confirmations crossed on the wire and a
    /// corrective command is returned for the caller to queue.
    pub fn apply_confirmation(
        &self,
        user: &str,
        revision: u64,
        target: Option<&str>,
        server: &ServerCart,
    ) -> Vec<QueuedCartCommand> {
        if self.is_closed() {
            return Vec::new();
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.user != user {
            tracing::debug!(user_id = %user, "Ignoring confirmation for inactive user");
            return Vec::new();
        }

        let policy = ConfirmationPolicy {
            touched: &state.touched,
            confirmed: &state.confirmed,
            revision,
            target,
        };
        let outcome = reconcile_with(&state.model, server, &policy);

        let mut repush = Vec::new();
        let mut seen = HashSet::new();
        for conflict in outcome.local_wins() {
            let id = conflict.item_id.as_str();
            if !policy.is_superseded(id) || !seen.insert(id) {
                continue;
            }
            let touched = state.touched.get(id).copied().unwrap_or(0);
            if state.confirmed.get(id).copied().unwrap_or(0) < touched {
                // the newer mutation is still on its way
                continue;
            }
            if let Some(op) = corrective_operation(&outcome.merged, server, id) {
                repush.push(QueuedCartCommand {
                    user_id: user.to_string(),
                    op,
                    revision: touched,
                });
            }
        }

        state.acknowledge_target(target, revision);
        if state.model != outcome.merged {
            state.model = outcome.merged;
            self.commit(state);
        }
        if !repush.is_empty() {
            tracing::info!(
                user_id = %user,
                revision,
                corrections = repush.len(),
                "Stale confirmation disagreed with newer edits, re-pushing"
            );
        }
        repush
    }

    /// Full reconciliation with the default policy.
    ///
    /// Local wins on lines that have no mutation in flight or queued become
    /// uploads; lines the server already agrees with are acknowledged.
    pub fn reconcile_server(
        &self,
        user: &str,
        server: &ServerCart,
        queued: &[QueuedCartCommand],
    ) -> Option<SyncPlan> {
        if self.is_closed() {
            return None;
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.user != user {
            return None;
        }

        let policy = LocalIntentPolicy {
            pending: state.pending(),
        };
        let outcome = reconcile_with(&state.model, server, &policy);

        let queued: Vec<&QueuedCartCommand> = queued.iter().filter(|c| c.user_id == user).collect();
        let whole_cart_busy = state.in_flight.values().any(Option::is_none)
            || queued.iter().any(|c| c.op.item_id().is_none());
        let busy: HashSet<&str> = state
            .in_flight
            .values()
            .flatten()
            .map(String::as_str)
            .chain(queued.iter().filter_map(|c| c.op.item_id()))
            .collect();

        let mut uploads = Vec::new();
        let mut planned = HashSet::new();
        if !whole_cart_busy {
            for conflict in outcome.local_wins() {
                let id = conflict.item_id.as_str();
                if busy.contains(id) || !planned.insert(id) {
                    continue;
                }
                if let Some(op) = corrective_operation(&outcome.merged, server, id) {
                    uploads.push(op);
                }
            }
        }

        let settled: Vec<(String, u64)> = state
            .touched
            .iter()
            .filter(|(id, _)| {
                !planned.contains(id.as_str())
                    && corrective_operation(&outcome.merged, server, id).is_none()
            })
            .map(|(id, &touched)| (id.clone(), touched))
            .collect();
        for (id, touched) in settled {
            state.acknowledge(&id, touched);
        }

        let ReconcileOutcome { merged, conflicts } = outcome;
        if state.model != merged {
            state.model = merged;
            self.commit(state);
        }

        Some(SyncPlan {
            conflicts,
            uploads,
            revision: state.revision,
        })
    }

    /// Gives up on the mutation at `revision`: its lines stop counting as
    /// unacknowledged, so the next server snapshot wins for them
    pub fn release(&self, user: &str, target: Option<&str>, revision: u64) {
        let mut state = self.lock();
        if state.user == user {
            state.acknowledge_target(target, revision);
        }
    }

    /// Marks lines with queued commands (e.g. restored from disk) as unacknowledged
    pub fn seed_pending(&self, commands: &[QueuedCartCommand]) {
        let mut state = self.lock();
        let user = state.user.clone();
        for command in commands.iter().filter(|c| c.user_id == user) {
            state.revision = state.revision.max(command.revision);
            if let Some(id) = command.op.item_id() {
                let touched = state.touched.entry(id.to_string()).or_insert(0);
                *touched = (*touched).max(command.revision);
            }
        }
    }

    pub fn begin_flight(&self, revision: u64, target: Option<&str>) {
        let mut state = self.lock();
        state.in_flight.insert(revision, target.map(str::to_string));
        self.in_flight.send_replace(state.in_flight.len());
    }

    pub fn end_flight(&self, revision: u64) {
        let mut state = self.lock();
        state.in_flight.remove(&revision);
        self.in_flight.send_replace(state.in_flight.len());
    }

    /// Resolves once no dispatched mutation is awaiting its response
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = rx.wait_for(|count| *count == 0) => {}
        }
    }

    /// Local changes the server has not acknowledged yet
    pub fn has_unacknowledged(&self) -> bool {
        let state = self.lock();
        !state.in_flight.is_empty() || !state.pending().is_empty()
    }

    /// Swaps in another user's persisted cart. Returns `false` if `user` is already active.
    pub fn switch_user(&self, user: &str) -> bool {
        let model = self.persistence.restore(user, Utc::now());
        let mut state = self.lock();
        if state.user == user {
            return false;
        }
        tracing::info!(from = %state.user, to = %user, "Switching cart user");
        let revision = state.revision;
        *state = SessionState::hydrate(user.to_string(), model, revision);
        self.in_flight.send_replace(0);
        self.commit(&state);
        true
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
