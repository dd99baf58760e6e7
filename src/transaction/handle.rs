//! Groups the per-table overlays that make up one logical transaction and
//! coordinates its commit/rollback lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::table::{BaseTable, TransactionTable};
use crate::transaction::types::{Config, TransactionState};
use crate::transaction::TxnId;

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_txn_id() -> TxnId {
    NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Groups one `TransactionTable` per participating `BaseTable`. `get` is
/// lazy: a table only gets an overlay the first time this transaction
/// touches it. Participants commit in the order they were first touched —
/// `IndexMap` gives this for free.
pub struct Transaction {
    txn_id: TxnId,
    config: Config,
    registry: HashMap<String, Arc<BaseTable>>,
    participants: Mutex<IndexMap<String, Arc<TransactionTable>>>,
    state: Mutex<TransactionState>,
}

impl Transaction {
    pub(crate) fn new(registry: HashMap<String, Arc<BaseTable>>, config: Config) -> Self {
        Self {
            txn_id: next_txn_id(),
            config,
            registry,
            participants: Mutex::new(IndexMap::new()),
            state: Mutex::new(TransactionState::Active),
        }
    }

    pub fn id(&self) -> TxnId {
        self.txn_id
    }

    /// Returns this transaction's overlay for `name`, constructing it on
    /// first access.
    pub fn get(&self, name: &str) -> Result<Arc<TransactionTable>> {
        if self.state.lock().is_terminal() {
            return Err(Error::TransactionCompleted);
        }
        let mut participants = self.participants.lock();
        if let Some(existing) = participants.get(name) {
            return Ok(existing.clone());
        }
        let base = self
            .registry
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?
            .clone();
        let table = Arc::new(TransactionTable::new(self.txn_id, self.config, base));
        participants.insert(name.to_string(), table.clone());
        Ok(table)
    }

    /// Commits every participant in registration order. Per-table
    /// atomicity is guaranteed (each participant's own two-phase `apply`
    /// either fully lands or fully fails); cross-table atomicity on
    /// partial failure is best-effort — participants already applied
    /// before a later one fails keep their committed changes, and every
    /// participant (applied or not) is rolled back to release its locks.
    pub fn commit(&self) -> Result<()> {
        if self.state.lock().is_terminal() {
            return Err(Error::TransactionCompleted);
        }
        let participants = self.participants.lock();
        let mut result = Ok(());
        for (name, table) in participants.iter() {
            if let Err(e) = table.commit() {
                tracing::error!(txn_id = self.txn_id, table = %name, error = %e, "participant commit failed");
                result = Err(e);
                break;
            }
        }
        *self.state.lock() = if result.is_ok() {
            TransactionState::Committed
        } else {
            TransactionState::RolledBack
        };
        if result.is_err() {
            for table in participants.values() {
                table.rollback();
            }
        }
        result
    }

    /// Idempotent: rolling back an already-terminal transaction is a
    /// no-op.
    pub fn rollback(&self) {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        for table in self.participants.lock().values() {
            table.rollback();
        }
        *state = TransactionState::RolledBack;
    }
}
