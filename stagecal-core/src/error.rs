//! Error types for the stagecal ecosystem.
//!
//! Collaborator failures are split by family so callers can tell a per-item
//! failure (skip and audit) from a precondition failure (fail the run).

use thiserror::Error;

/// Failures of the external calendar store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store request timed out after {0}s")]
    Timeout(u64),
}

impl StoreError {
    /// Short machine-readable tag, used in audit details.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::Conflict(_) => "conflict",
            StoreError::Transport(_) => "transport",
            StoreError::Timeout(_) => "timeout",
        }
    }
}

/// Failures of the inference service, surfaced as a single taxonomy value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("Inference service unreachable: {0}")]
    Unreachable(String),

    #[error("Inference request rejected: {0}")]
    Rejected(String),

    #[error("Malformed inference response: {0}")]
    MalformedResponse(String),
}

impl InferenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Unreachable(_) => "unreachable",
            InferenceError::Rejected(_) => "rejected",
            InferenceError::MalformedResponse(_) => "malformed_response",
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Ledger IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger lock poisoned")]
    Poisoned,

    #[error("Unknown run: {0}")]
    UnknownRun(String),
}

/// Errors that end a reconciliation run or reject a request outright.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Calendar discovery failed: {0}")]
    Discovery(StoreError),

    #[error("Managed {0} calendar could not be resolved or created")]
    MissingCalendar(String),

    #[error("A reconciliation run is already in progress")]
    RunInProgress,

    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    #[error("Provider '{0}' not found in PATH")]
    ProviderNotInstalled(String),

    #[error("Audit record {0} not found")]
    AuditNotFound(i64),

    #[error("Audit record {0} carries no snapshot to restore")]
    NoSnapshot(i64),

    #[error("Event '{uid}' changed since audit record {audit_id} was written")]
    ChangeTokenMismatch { audit_id: i64, uid: String },

    #[error("Event '{0}' not found in the user-layer calendar")]
    EventNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type InferenceResult<T> = Result<T, InferenceError>;
pub type LedgerResult<T> = Result<T, LedgerError>;
pub type ReconcileResult<T> = Result<T, ReconcileError>;
