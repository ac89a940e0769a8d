//! Error types for the settlement core

use crate::types::{IntentId, IntentPhase};
use thiserror::Error;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
///
/// The first group is the economic taxonomy callers act on. The rest are
/// infrastructure faults.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or out-of-range parameters
    #[error("Validation error: {0}")]
    Validation(String),

    /// Intent id already recorded
    #[error("Duplicate intent: {0}")]
    DuplicateIntent(IntentId),

    /// Re-priced result violates the caller's bound
    #[error("Slippage exceeded: bound {bound}, actual {actual}")]
    SlippageExceeded {
        /// Caller-supplied bound
        bound: u128,
        /// Value produced by re-pricing
        actual: u128,
    },

    /// Supply cap reached or would be exceeded
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// BTC transaction dropped out of the best chain
    #[error("Chain reorg: {0}")]
    ChainReorg(String),

    /// EVM-side execution fault
    #[error("Execution failure: {0}")]
    ExecutionFailure(String),

    /// Inclusion window elapsed
    #[error("Intent expired: {0}")]
    ExpiredIntent(IntentId),

    /// Intent not found
    #[error("Intent not found: {0}")]
    IntentNotFound(String),

    /// Launch not found
    #[error("Launch not found: {0}")]
    LaunchNotFound(String),

    /// Phase change not permitted by the lifecycle
    #[error("Invalid transition for {intent_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Intent being advanced
        intent_id: IntentId,
        /// Current phase
        from: IntentPhase,
        /// Requested phase
        to: IntentPhase,
    },

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transient faults are retried internally; everything else is surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ChainReorg(_) | Error::ExecutionFailure(_) | Error::Concurrency(_)
        )
    }

    /// Stable category name, used in metrics labels and client responses
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::DuplicateIntent(_) => "duplicate_intent",
            Error::SlippageExceeded { .. } => "slippage_exceeded",
            Error::CapacityExceeded(_) => "capacity_exceeded",
            Error::ChainReorg(_) => "chain_reorg",
            Error::ExecutionFailure(_) => "execution_failure",
            Error::ExpiredIntent(_) => "expired_intent",
            Error::IntentNotFound(_) | Error::LaunchNotFound(_) => "not_found",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Storage(_) | Error::Serialization(_) | Error::Json(_) | Error::Io(_) => {
                "storage"
            }
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::ExecutionFailure("rpc timeout".into()).is_transient());
        assert!(Error::ChainReorg("tx dropped".into()).is_transient());
        assert!(!Error::SlippageExceeded { bound: 10, actual: 9 }.is_transient());
        assert!(!Error::CapacityExceeded("launch full".into()).is_transient());
        assert!(!Error::Validation("bad amount".into()).is_transient());
    }

    #[test]
    fn test_categories_distinguish_caller_actions() {
        let slippage = Error::SlippageExceeded { bound: 10, actual: 9 };
        let capacity = Error::CapacityExceeded("full".into());
        let execution = Error::ExecutionFailure("revert".into());

        assert_eq!(slippage.category(), "slippage_exceeded");
        assert_eq!(capacity.category(), "capacity_exceeded");
        assert_eq!(execution.category(), "execution_failure");
    }
}
