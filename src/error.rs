//! Error types shared across the engine
//!
//! Cart model operations never fail; errors only exist at the boundaries
//! (backend transport, local storage, checkout gating, sync passes).

use thiserror::Error;

use crate::checkout::models::CheckoutStepId;

/// Failure of a `CartBackend` call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// Connection could not be established or was dropped
    #[error("Network error: {0}")]
    Network(String),

    /// The call did not complete in time
    #[error("Request timed out")]
    Timeout,

    /// The server failed while handling a valid request (5xx)
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The server refused the request (4xx other than 404)
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The product or line item does not exist server-side
    #[error("Not found: {0}")]
    NotFound(String),

    /// The response body did not match the expected envelope
    #[error("Invalid response: {0}")]
    Decode(String),

    /// The queued action targets a domain this executor cannot replay
    #[error("Unsupported action: {0}")]
    Unsupported(String),

    /// The configured service address is not a usable base URL
    #[error("Invalid base URL: {0}")]
    InvalidUrl(String),
}

impl BackendError {
    /// Transport-level failures are worth retrying; everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Network(_) | BackendError::Timeout | BackendError::Server { .. }
        )
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Network(err.to_string())
        }
    }
}

/// Local persistence failure
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Checkout progression refused
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CheckoutError {
    /// The current step still reports validation errors
    #[error("Step {step} has {} validation error(s)", errors.len())]
    StepInvalid {
        step: CheckoutStepId,
        errors: Vec<String>,
    },

    /// `go_to_step` index outside the step list
    #[error("Step index {0} is out of range")]
    OutOfRange(usize),

    /// `go_to_step` tried to jump past a step that is not completed yet
    #[error("Cannot jump to {target}: {blocking} is not completed")]
    StepLocked {
        target: CheckoutStepId,
        blocking: CheckoutStepId,
    },

    /// `complete_checkout` called before every step was completed
    #[error("Checkout incomplete, pending steps: {0:?}")]
    Incomplete(Vec<CheckoutStepId>),

    /// The machine already produced a confirmation
    #[error("Checkout already completed")]
    AlreadyCompleted,
}

/// Sync pass could not run or could not reach the backend
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("A sync pass is already in progress")]
    AlreadyRunning,

    #[error("Backend is offline")]
    Offline,

    #[error("Cart session has been shut down")]
    ShutDown,

    #[error("Backend unavailable: {0}")]
    Backend(#[from] BackendError),
}

/// Result alias for backend calls
pub type BackendResult<T> = Result<T, BackendError>;
