//! Error types for the synapse consensus core.

use thiserror::Error;

use crate::types::Epoch;

/// Top-level error type for chain operations.
#[derive(Debug, Error)]
pub enum ChainError {
    // -- validator registry / selection --------------------------------------
    #[error("validator already registered: {0}")]
    DuplicateValidator(String),

    #[error("validator not found: {0}")]
    ValidatorNotFound(String),

    #[error("validator {address} is selected for pending slot {slot}")]
    ValidatorBusy { address: String, slot: u64 },

    #[error("no eligible validators")]
    NoEligibleValidators,

    #[error("invalid stake amount: {0}")]
    InvalidStake(String),

    // -- fork choice ----------------------------------------------------------
    #[error("unknown parent block: {0}")]
    UnknownParent(String),

    #[error("block {0} conflicts with the finalized chain")]
    ConflictsWithFinalized(String),

    #[error("block already known: {0}")]
    DuplicateBlock(String),

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    // -- AI tasks -------------------------------------------------------------
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task already exists: {0}")]
    DuplicateTask(String),

    #[error("task {task} already assigned (status {status})")]
    AlreadyAssigned { task: String, status: String },

    #[error("invalid task state transition: {from} -> {to}")]
    InvalidTaskState { from: String, to: String },

    #[error("deadline exceeded for task {task}: deadline epoch {deadline}, current {current}")]
    DeadlineExceeded {
        task: String,
        deadline: Epoch,
        current: Epoch,
    },

    // -- storage --------------------------------------------------------------
    #[error("integrity error: {0}")]
    IntegrityError(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("content not found in archive: {0}")]
    ArchiveMiss(String),

    #[error("no committed datum for subnet {subnet} epoch {epoch}")]
    DatumNotFound { subnet: u16, epoch: Epoch },

    // -- score submissions ----------------------------------------------------
    #[error("invalid signature")]
    InvalidSignature,

    #[error("stale submission: timestamp {timestamp} outside window of {now} ± {window_ms}ms")]
    StaleSubmission {
        timestamp: u64,
        now: u64,
        window_ms: u64,
    },

    #[error("malformed submission: {0}")]
    MalformedSubmission(String),

    #[error("unsupported schema version {got}, expected {expected}")]
    UnsupportedSchema { expected: u16, got: u16 },

    #[error("replayed submission: {0}")]
    ReplayedSubmission(String),

    // -- rounds ---------------------------------------------------------------
    #[error("epoch mismatch: expected {expected}, got {got}")]
    EpochMismatch { expected: Epoch, got: Epoch },

    #[error("round aborted: {0}")]
    RoundAborted(String),

    #[error("no round worker for subnet {0}")]
    UnknownSubnet(u16),

    #[error("round worker stopped: {0}")]
    WorkerStopped(String),

    // -- ambient --------------------------------------------------------------
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChainError {
    /// Whether the failed operation may be retried with backoff.
    ///
    /// Storage outages and aborted rounds are transient. Consensus, integrity
    /// and validation errors are final for the slot or round that raised them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChainError::StorageUnavailable(_) | ChainError::RoundAborted(_) | ChainError::Io(_)
        )
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

/// Result type alias using ChainError.
pub type Result<T> = std::result::Result<T, ChainError>;
