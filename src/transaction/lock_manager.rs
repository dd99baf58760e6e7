//! Record-level shared/exclusive lock manager with a FIFO waiter queue.
//!
//! Modeled on the holder-set-plus-waiter-queue shape used throughout this
//! codebase's lock managers, but — unlike a pattern that simply wakes every
//! waiter and lets them race — this one honors strict FIFO fairness: a
//! release only ever drains the contiguous *compatible* prefix of the
//! queue, stopping at the first waiter it cannot satisfy.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterKind {
    Acquire(LockKind),
    WaitToRead,
    WaitToWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterStatus {
    Pending,
    Ready,
    Expired,
}

struct WaiterHandle {
    #[allow(dead_code)]
    txn_id: Option<TxnId>,
    kind: WaiterKind,
    status: Mutex<WaiterStatus>,
    cv: Condvar,
}

#[derive(Default)]
struct LockEntry {
    kind: Option<LockKind>,
    holders: HashSet<TxnId>,
}

#[derive(Default)]
struct KeyState {
    entry: LockEntry,
    waiters: VecDeque<Arc<WaiterHandle>>,
}

fn entry_can_read(entry: &LockEntry) -> bool {
    entry.holders.is_empty() || entry.kind == Some(LockKind::Shared)
}

fn entry_can_write(entry: &LockEntry) -> bool {
    entry.holders.is_empty()
}

/// Non-blocking attempt to grant `kind` to `txn_id` against `entry`.
fn entry_try_acquire(entry: &mut LockEntry, txn_id: TxnId, kind: LockKind) -> bool {
    if entry.holders.is_empty() {
        entry.kind = Some(kind);
        entry.holders.insert(txn_id);
        return true;
    }
    if entry.holders.len() == 1 && entry.holders.contains(&txn_id) {
        // Reentrant: the sole holder may re-acquire any kind as a no-op on
        // the holder set, but the lock's effective kind tracks the latest
        // request so a read-then-write upgrade is properly exclusive.
        entry.kind = Some(kind);
        return true;
    }
    if kind == LockKind::Shared
        && entry.kind == Some(LockKind::Shared)
        && !entry.holders.contains(&txn_id)
    {
        entry.holders.insert(txn_id);
        return true;
    }
    false
}

/// Serializes access to per-key records under shared/exclusive semantics
/// with timeouts and FIFO-fair wake-up.
pub struct LockManager {
    keys: Mutex<HashMap<String, KeyState>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Non-blocking acquire. See the module doc for the grant rules.
    pub fn acquire_lock(&self, txn_id: TxnId, key: &str, kind: LockKind) -> bool {
        let mut keys = self.keys.lock();
        let state = keys.entry(key.to_string()).or_default();
        let granted = entry_try_acquire(&mut state.entry, txn_id, kind);
        if granted {
            tracing::debug!(txn_id, key, ?kind, "lock acquired");
        }
        granted
    }

    /// Blocks (up to `timeout_ms`) until `kind` is granted to `txn_id` on
    /// `key`, enqueuing a FIFO waiter if not immediately available.
    #[tracing::instrument(skip(self))]
    pub fn acquire_lock_with_timeout(
        &self,
        txn_id: TxnId,
        key: &str,
        kind: LockKind,
        timeout_ms: u64,
    ) -> Result<()> {
        self.wait_for(Some(txn_id), key, WaiterKind::Acquire(kind), timeout_ms)
    }

    /// Blocks until `key` is readable (no lock, or Shared).
    pub fn wait_unlock_to_read(&self, key: &str, timeout_ms: u64) -> Result<()> {
        self.wait_for(None, key, WaiterKind::WaitToRead, timeout_ms)
    }

    /// Blocks until `key` is writable (no lock at all).
    pub fn wait_unlock_to_write(&self, key: &str, timeout_ms: u64) -> Result<()> {
        self.wait_for(None, key, WaiterKind::WaitToWrite, timeout_ms)
    }

    fn wait_for(
        &self,
        txn_id: Option<TxnId>,
        key: &str,
        kind: WaiterKind,
        timeout_ms: u64,
    ) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        let handle = {
            let mut keys = self.keys.lock();
            let state = keys.entry(key.to_string()).or_default();
            let immediate = match kind {
                WaiterKind::WaitToRead => entry_can_read(&state.entry),
                WaiterKind::WaitToWrite => entry_can_write(&state.entry),
                WaiterKind::Acquire(k) => entry_try_acquire(
                    &mut state.entry,
                    txn_id.expect("Acquire waiters always carry a txn id"),
                    k,
                ),
            };
            if immediate {
                return Ok(());
            }
            let handle = Arc::new(WaiterHandle {
                txn_id,
                kind,
                status: Mutex::new(WaiterStatus::Pending),
                cv: Condvar::new(),
            });
            state.waiters.push_back(handle.clone());
            handle
        };

        loop {
            let mut status = handle.status.lock();
            match *status {
                WaiterStatus::Ready => return Ok(()),
                WaiterStatus::Expired => {
                    return Err(Error::LockTimeout {
                        key: key.to_string(),
                        timeout_ms,
                    });
                }
                WaiterStatus::Pending => {
                    let now = Instant::now();
                    if now >= deadline {
                        *status = WaiterStatus::Expired;
                        tracing::warn!(key, timeout_ms, "lock wait timed out");
                        return Err(Error::LockTimeout {
                            key: key.to_string(),
                            timeout_ms,
                        });
                    }
                    handle.cv.wait_for(&mut status, deadline - now);
                }
            }
        }
    }

    /// Releases `txn_id`'s hold on `key`, if any, then drains the waiter
    /// queue. Releasing from a non-holder is a silent no-op: the queue is
    /// *not* drained (a release must come from an actual holder to make
    /// progress for anyone else).
    pub fn release_lock(&self, txn_id: TxnId, key: &str) {
        let mut keys = self.keys.lock();
        let is_holder = keys
            .get(key)
            .map(|s| s.entry.holders.contains(&txn_id))
            .unwrap_or(false);
        if !is_holder {
            return;
        }
        {
            let state = keys.get_mut(key).unwrap();
            state.entry.holders.remove(&txn_id);
            if state.entry.holders.is_empty() {
                state.entry.kind = None;
            }
        }
        tracing::debug!(txn_id, key, "lock released");
        Self::drain(&mut keys, key);
        if let Some(state) = keys.get(key) {
            if state.entry.holders.is_empty() && state.waiters.is_empty() {
                keys.remove(key);
            }
        }
    }

    /// Walks the waiter queue in FIFO order, resolving the contiguous
    /// prefix of waiters that are now compatible (or expired), and stops
    /// at the first waiter it cannot satisfy — head-of-line blocking.
    fn drain(keys: &mut HashMap<String, KeyState>, key: &str) {
        let state = match keys.get_mut(key) {
            Some(s) => s,
            None => return,
        };
        loop {
            let front = match state.waiters.front() {
                Some(w) => w.clone(),
                None => break,
            };
            {
                let status = *front.status.lock();
                if status == WaiterStatus::Expired {
                    state.waiters.pop_front();
                    continue;
                }
            }
            let satisfied = match front.kind {
                WaiterKind::WaitToRead => entry_can_read(&state.entry),
                WaiterKind::WaitToWrite => entry_can_write(&state.entry),
                WaiterKind::Acquire(k) => {
                    let txn_id = front.txn_id.expect("Acquire waiters always carry a txn id");
                    entry_try_acquire(&mut state.entry, txn_id, k)
                }
            };
            if satisfied {
                state.waiters.pop_front();
                let mut status = front.status.lock();
                *status = WaiterStatus::Ready;
                front.cv.notify_one();
            } else {
                break;
            }
        }
    }

    pub fn is_locked(&self, txn_id: Option<TxnId>, key: &str, kind: Option<LockKind>) -> bool {
        let keys = self.keys.lock();
        match keys.get(key) {
            None => false,
            Some(state) => {
                if state.entry.holders.is_empty() {
                    return false;
                }
                if let Some(k) = kind {
                    if state.entry.kind != Some(k) {
                        return false;
                    }
                }
                match txn_id {
                    Some(t) => state.entry.holders.contains(&t),
                    None => true,
                }
            }
        }
    }

    pub fn get_lock_count(&self, key: &str) -> usize {
        let keys = self.keys.lock();
        keys.get(key).map(|s| s.entry.holders.len()).unwrap_or(0)
    }

    pub fn get_waiting_queue_length(&self, key: &str) -> usize {
        let keys = self.keys.lock();
        keys.get(key).map(|s| s.waiters.len()).unwrap_or(0)
    }

    pub fn can_read(&self, key: &str) -> bool {
        let keys = self.keys.lock();
        keys.get(key).map(|s| entry_can_read(&s.entry)).unwrap_or(true)
    }

    pub fn can_write(&self, key: &str) -> bool {
        let keys = self.keys.lock();
        keys.get(key).map(|s| entry_can_write(&s.entry)).unwrap_or(true)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
