//! Closed error taxonomy for the transactional execution engine.
//!
//! Every failure mode the core can produce is enumerated here; there is
//! deliberately no catch-all variant — callers match exhaustively.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("table defined with a duplicate primary key field: {0}")]
    DuplicatePkDefinition(String),

    #[error("primary key value missing for field(s): {0:?}")]
    PrimaryKeyValueNull(Vec<String>),

    #[error("duplicate primary key value: {0}")]
    DuplicatePrimaryKeyValue(String),

    #[error("lock acquisition on {key:?} timed out after {timeout_ms}ms")]
    LockTimeout { key: String, timeout_ms: u64 },

    #[error("invalid lock type requested")]
    InvalidLockType,

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("transaction already completed")]
    TransactionCompleted,

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),
}

pub type Result<T> = std::result::Result<T, Error>;
