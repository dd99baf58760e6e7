//! Isolation levels and the transaction lifecycle state machine.

use std::time::Duration;

/// Governs the read protocol a `TransactionTable` applies to committed
/// rows and whether conflicting writers block on a lock or are deferred
/// to commit-time validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Reads see the latest committed value; still version-validated at
    /// commit.
    ReadLatest,
    /// First read of a committed row holds a Shared lock until
    /// commit/rollback, guaranteeing repeatable reads.
    RepeatableRead,
    /// Like `RepeatableRead`, but the first write upgrades to Exclusive,
    /// blocking conflicting writers instead of deferring to validation.
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::RepeatableRead
    }
}

/// Configuration shared by a `Transaction` and the `TransactionTable`s it
/// creates: isolation level plus lock acquisition timeout.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub isolation_level: IsolationLevel,
    pub lock_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
            lock_timeout: Duration::from_millis(5000),
        }
    }
}

impl Config {
    pub fn lock_timeout_ms(&self) -> u64 {
        self.lock_timeout.as_millis() as u64
    }
}

/// A `Transaction`'s lifecycle: `Active` until it terminates exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}
