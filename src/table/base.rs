//! Canonical, committed storage for one logical table and its direct
//! (non-transactional) CRUD surface.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::query::{matches, CompiledQuery};
use crate::table::{project, UpdatedEntry};
use crate::transaction::lock_manager::LockManager;
use crate::transaction::types::Config;
use crate::util::PrimaryKeyDef;
use crate::value::Record;

struct Inner {
    records: HashMap<String, Record>,
    /// Per-record version token, bumped on every mutation — this is what
    /// a `TransactionTable`'s optimistic validation compares against.
    versions: HashMap<String, u64>,
    /// Insertion-ordered sequence of live PKStrings, used for scans.
    order: Vec<String>,
}

/// The committed, authoritative storage of records for one logical table.
pub struct BaseTable {
    name: String,
    pk_def: PrimaryKeyDef,
    config: Config,
    lock_manager: LockManager,
    inner: RwLock<Inner>,
    version_counter: AtomicU64,
}

impl BaseTable {
    pub fn new(name: impl Into<String>, pk_def: PrimaryKeyDef, config: Config) -> Self {
        Self {
            name: name.into(),
            pk_def,
            config,
            lock_manager: LockManager::new(),
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                versions: HashMap::new(),
                order: Vec::new(),
            }),
            version_counter: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pk_def(&self) -> &PrimaryKeyDef {
        &self.pk_def
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    pub fn size(&self) -> usize {
        self.inner.read().order.len()
    }

    fn next_version(&self) -> u64 {
        self.version_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// The version token currently associated with `pk`, if the row
    /// exists.
    pub fn version_of(&self, pk: &str) -> Option<u64> {
        self.inner.read().versions.get(pk).copied()
    }

    pub fn contains_pk(&self, pk: &str) -> bool {
        self.inner.read().records.contains_key(pk)
    }

    /// A shallow copy of the committed record at `pk`, bypassing the lock
    /// manager — callers that need lock-manager coordination (direct CRUD,
    /// or a `TransactionTable` applying its own read protocol) call this
    /// only after they've already satisfied the appropriate wait/acquire.
    pub fn peek(&self, pk: &str) -> Option<Record> {
        self.inner.read().records.get(pk).cloned()
    }

    pub fn ordered_pks(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    pub fn insert(&self, mut record: Record) -> Result<Record> {
        let pk = self.pk_def.build_pk_string(&mut record)?;
        self.lock_manager
            .wait_unlock_to_write(&pk, self.config.lock_timeout_ms())?;
        let mut inner = self.inner.write();
        if inner.records.contains_key(&pk) {
            return Err(Error::DuplicatePrimaryKeyValue(pk));
        }
        let version = self.next_version();
        inner.order.push(pk.clone());
        inner.versions.insert(pk.clone(), version);
        inner.records.insert(pk, record.clone());
        tracing::debug!(table = %self.name, "row inserted");
        Ok(record)
    }

    /// Inserts each record in turn; stops at the first error. Rows
    /// inserted before the failure remain — there is no partial rollback.
    pub fn bulk_insert(&self, records: Vec<Record>) -> Result<usize> {
        let mut inserted = 0;
        for record in records {
            self.insert(record)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    pub fn find_by_pk(&self, pk_partial: &Record) -> Result<Option<Record>> {
        let pk = self.pk_def.build_pk_string_from_partial(pk_partial)?;
        self.lock_manager
            .wait_unlock_to_read(&pk, self.config.lock_timeout_ms())?;
        Ok(self.peek(&pk))
    }

    pub fn select(
        &self,
        fields: Option<&[String]>,
        where_q: &CompiledQuery,
    ) -> Result<Vec<Record>> {
        let order = self.ordered_pks();
        let mut out = Vec::new();
        for pk in order {
            self.lock_manager
                .wait_unlock_to_read(&pk, self.config.lock_timeout_ms())?;
            let record = match self.peek(&pk) {
                Some(r) => r,
                None => continue,
            };
            if matches(&record, where_q) {
                out.push(project(&record, fields));
            }
        }
        Ok(out)
    }

    pub fn update(&self, patch: &Record, where_q: &CompiledQuery) -> Result<usize> {
        if patch.is_empty() {
            return Ok(0);
        }
        let will_touch_pk = self.pk_def.touched_by(patch);
        let order = self.ordered_pks();
        let mut affected = 0;
        for old_pk in order {
            self.lock_manager
                .wait_unlock_to_write(&old_pk, self.config.lock_timeout_ms())?;
            let existing = match self.peek(&old_pk) {
                Some(r) => r,
                None => continue,
            };
            if !matches(&existing, where_q) {
                continue;
            }
            let mut merged = existing.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            let mut inner = self.inner.write();
            if will_touch_pk {
                let new_pk = self.pk_def.build_pk_string(&mut merged)?;
                if new_pk != old_pk && inner.records.contains_key(&new_pk) {
                    return Err(Error::DuplicatePrimaryKeyValue(new_pk));
                }
                inner.records.remove(&old_pk);
                inner.versions.remove(&old_pk);
                if let Some(pos) = inner.order.iter().position(|p| p == &old_pk) {
                    inner.order[pos] = new_pk.clone();
                }
                let version = self.next_version();
                inner.versions.insert(new_pk.clone(), version);
                inner.records.insert(new_pk, merged);
            } else {
                let version = self.next_version();
                inner.versions.insert(old_pk.clone(), version);
                inner.records.insert(old_pk, merged);
            }
            affected += 1;
        }
        Ok(affected)
    }

    pub fn delete_by_pk(&self, pk_partial: &Record) -> Result<Option<Record>> {
        let pk = self.pk_def.build_pk_string_from_partial(pk_partial)?;
        self.lock_manager
            .wait_unlock_to_write(&pk, self.config.lock_timeout_ms())?;
        let mut inner = self.inner.write();
        let removed = inner.records.remove(&pk);
        if removed.is_some() {
            inner.versions.remove(&pk);
            inner.order.retain(|p| p != &pk);
            tracing::debug!(table = %self.name, "row deleted");
        }
        Ok(removed)
    }

    /// Applies a transaction's writing phase: mutates updated rows in
    /// place (to preserve their sequence position), removes tombstoned
    /// rows, and appends newly inserted rows. Called only after
    /// validation has already succeeded and the caller holds Exclusive
    /// locks on every affected key.
    ///
    /// Updates are staged and applied in three passes — remove every old
    /// committed PK, relabel the order sequence from a position snapshot
    /// taken before any relabeling, then insert every new PK — rather than
    /// one remove+insert per entry while iterating the `HashMap` in its
    /// (nondeterministic) order. A single-pass remove+insert can alias: if
    /// one update's new PK equals another still-live committed PK (a PK
    /// swap), the iteration order would decide whether that row survives.
    pub(crate) fn apply_writes(
        &self,
        updates: &HashMap<String, UpdatedEntry>,
        deletes: &HashSet<String>,
        inserts: &[Record],
    ) -> Result<()> {
        let mut inner = self.inner.write();

        let mut staged: Vec<(String, String, Record)> = Vec::with_capacity(updates.len());
        for (committed_pk, entry) in updates {
            let mut merged = entry.record.clone();
            let new_pk = self.pk_def.build_pk_string(&mut merged)?;
            staged.push((committed_pk.clone(), new_pk, merged));
        }

        for (committed_pk, _, _) in &staged {
            inner.records.remove(committed_pk);
            inner.versions.remove(committed_pk);
        }

        // Snapshot every updated row's position before relabeling any of
        // them, so a multi-way PK cycle (A->B, B->C, C->A) relabels each
        // slot exactly once instead of chasing an already-rewritten label.
        let position_of: HashMap<String, usize> = inner
            .order
            .iter()
            .enumerate()
            .map(|(i, pk)| (pk.clone(), i))
            .collect();
        for (committed_pk, new_pk, _) in &staged {
            if new_pk != committed_pk {
                if let Some(&idx) = position_of.get(committed_pk) {
                    inner.order[idx] = new_pk.clone();
                }
            }
        }

        for (_, new_pk, merged) in staged {
            let version = self.version_counter.fetch_add(1, Ordering::SeqCst);
            inner.versions.insert(new_pk.clone(), version);
            inner.records.insert(new_pk, merged);
        }

        for pk in deletes {
            inner.records.remove(pk);
            inner.versions.remove(pk);
        }
        inner.order.retain(|p| !deletes.contains(p));

        for record in inserts {
            let mut rec = record.clone();
            let pk = self.pk_def.build_pk_string(&mut rec)?;
            if inner.records.contains_key(&pk) {
                return Err(Error::TransactionConflict(format!(
                    "duplicate primary key value at insert-apply: {pk}"
                )));
            }
            let version = self.version_counter.fetch_add(1, Ordering::SeqCst);
            inner.order.push(pk.clone());
            inner.versions.insert(pk.clone(), version);
            inner.records.insert(pk, rec);
        }

        Ok(())
    }
}
