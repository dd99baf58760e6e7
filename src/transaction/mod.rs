//! Lock coordination primitives and the isolation/lifecycle types shared by
//! `Transaction` and `TransactionTable`.

pub mod handle;
pub mod lock_manager;
pub mod types;

pub use handle::Transaction;
pub use lock_manager::{LockKind, LockManager, TxnId};
pub use types::{Config, IsolationLevel, TransactionState};
