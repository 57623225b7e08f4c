//! Keeping the local cart and the server in step

pub mod connectivity;
pub mod coordinator;
pub mod queue;
pub mod reconcile;

pub use connectivity::Connectivity;
pub use coordinator::{CartActionExecutor, SyncCoordinator, SyncReport, SyncStatus};
pub use queue::{
    ActionDomain, ActionExecutor, ActionPriority, NewAction, OfflineAction, OfflineActionQueue,
    QueueEvent, QueuedCartCommand, RetryPolicy, SyncPassReport,
};
pub use reconcile::{
    reconcile, reconcile_with, CartConflict, ConflictKind, ConflictPolicy, ConflictValue,
    LocalIntentPolicy, ReconcileOutcome, Resolution,
};
