//! The per-transaction overlay over one `BaseTable`: temporary inserts, an
//! overlay of updated committed records, a tombstone set, the
//! isolation-level read/write protocol, and two-phase commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::query::{matches, CompiledQuery};
use crate::table::base::BaseTable;
use crate::table::{project, UpdatedEntry};
use crate::transaction::lock_manager::{LockKind, TxnId};
use crate::transaction::types::{Config, IsolationLevel, TransactionState};
use crate::value::Record;

/// A committed row's value and version token as they stood the first time
/// this transaction touched that PK (via `find_by_pk`, `select`, or
/// `update`). Every later access of the same committed PK by this
/// transaction reuses this snapshot instead of re-reading the base, so a
/// transaction's view of a row it has already seen stays consistent even
/// under `ReadLatest`; the version token is what `apply()`'s validation
/// phase compares against the base at commit.
#[derive(Debug, Clone)]
struct ReadSnapshot {
    record: Record,
    version: u64,
}

struct Overlays {
    /// Keyed by *current* PKString; holds both fresh overlay inserts and
    /// the current-view copies of updated committed rows.
    temp_inserts: HashMap<String, Record>,
    /// Insertion-ordered current PKStrings of newly-inserted overlay rows
    /// only (updates to committed rows are not listed here).
    temp_inserts_list: Vec<String>,
    /// Keyed by *committed* PKString.
    temp_updated_by_old_pk: HashMap<String, UpdatedEntry>,
    /// Committed PKStrings tombstoned by this transaction.
    temp_deleted: HashSet<String>,
    /// Keyed by *committed* PKString: the snapshot captured the first time
    /// this transaction read that row, used to validate at commit that no
    /// one else modified it in the meantime (spec's "version token...
    /// captured at first read/update").
    read_cache: HashMap<String, ReadSnapshot>,
    /// Keys this transaction has acquired and must release at
    /// commit/rollback.
    held_locks: HashSet<String>,
}

impl Overlays {
    fn new() -> Self {
        Self {
            temp_inserts: HashMap::new(),
            temp_inserts_list: Vec::new(),
            temp_updated_by_old_pk: HashMap::new(),
            temp_deleted: HashSet::new(),
            read_cache: HashMap::new(),
            held_locks: HashSet::new(),
        }
    }
}

pub struct TransactionTable {
    txn_id: TxnId,
    config: Config,
    base: Arc<BaseTable>,
    state: Mutex<TransactionState>,
    overlays: Mutex<Overlays>,
}

impl TransactionTable {
    pub fn new(txn_id: TxnId, config: Config, base: Arc<BaseTable>) -> Self {
        Self {
            txn_id,
            config,
            base,
            state: Mutex::new(TransactionState::Active),
            overlays: Mutex::new(Overlays::new()),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state.lock().is_terminal() {
            return Err(Error::TransactionCompleted);
        }
        Ok(())
    }

    /// `checkIfPkExistsInMaps`: a PKString must not already be live under
    /// `pk`, and may only coincide with a tombstoned or about-to-be-
    /// vacated committed row.
    fn check_pk_not_used(&self, pk: &str) -> Result<()> {
        let overlays = self.overlays.lock();
        if overlays.temp_inserts.contains_key(pk) {
            return Err(Error::DuplicatePrimaryKeyValue(pk.to_string()));
        }
        if self.base.contains_pk(pk) {
            if overlays.temp_deleted.contains(pk) {
                return Ok(());
            }
            if let Some(entry) = overlays.temp_updated_by_old_pk.get(pk) {
                let mut tmp = entry.record.clone();
                let current_pk = self.base.pk_def().build_pk_string(&mut tmp)?;
                if current_pk != pk {
                    return Ok(());
                }
            }
            return Err(Error::DuplicatePrimaryKeyValue(pk.to_string()));
        }
        Ok(())
    }

    fn acquire_read_protocol(&self, pk: &str) -> Result<()> {
        match self.config.isolation_level {
            IsolationLevel::ReadLatest => self
                .base
                .lock_manager()
                .wait_unlock_to_read(pk, self.config.lock_timeout_ms()),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                self.base.lock_manager().acquire_lock_with_timeout(
                    self.txn_id,
                    pk,
                    LockKind::Shared,
                    self.config.lock_timeout_ms(),
                )?;
                self.overlays.lock().held_locks.insert(pk.to_string());
                Ok(())
            }
        }
    }

    fn acquire_write_protocol(&self, pk: &str) -> Result<()> {
        if matches!(
            self.config.isolation_level,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        ) {
            self.base.lock_manager().acquire_lock_with_timeout(
                self.txn_id,
                pk,
                LockKind::Exclusive,
                self.config.lock_timeout_ms(),
            )?;
            self.overlays.lock().held_locks.insert(pk.to_string());
        }
        Ok(())
    }

    /// Returns this committed row's value and version, reusing the
    /// snapshot captured the first time this transaction touched `pk` if
    /// one already exists, and caching a fresh one (from the base, under
    /// whatever lock the caller already holds) otherwise. Returns `None`
    /// if the row doesn't exist in the base and has never been cached.
    fn first_touch(&self, pk: &str) -> Option<(Record, u64)> {
        let mut overlays = self.overlays.lock();
        if let Some(snapshot) = overlays.read_cache.get(pk) {
            return Some((snapshot.record.clone(), snapshot.version));
        }
        let record = self.base.peek(pk)?;
        let version = self.base.version_of(pk).unwrap_or(0);
        overlays.read_cache.insert(
            pk.to_string(),
            ReadSnapshot {
                record: record.clone(),
                version,
            },
        );
        Some((record, version))
    }

    pub fn insert(&self, record: Record) -> Result<Record> {
        self.ensure_active()?;
        let mut rec = record;
        let pk = self.base.pk_def().build_pk_string(&mut rec)?;
        self.check_pk_not_used(&pk)?;
        let mut overlays = self.overlays.lock();
        overlays.temp_inserts.insert(pk.clone(), rec.clone());
        overlays.temp_inserts_list.push(pk);
        Ok(rec)
    }

    pub fn bulk_insert(&self, records: Vec<Record>) -> Result<usize> {
        let mut inserted = 0;
        for record in records {
            self.insert(record)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    pub fn find_by_pk(&self, pk_partial: &Record) -> Result<Option<Record>> {
        self.ensure_active()?;
        let pk = self.base.pk_def().build_pk_string_from_partial(pk_partial)?;
        {
            let overlays = self.overlays.lock();
            if let Some(r) = overlays.temp_inserts.get(&pk) {
                return Ok(Some(r.clone()));
            }
            if overlays.temp_deleted.contains(&pk) {
                return Ok(None);
            }
            if overlays.temp_updated_by_old_pk.contains_key(&pk) {
                // Shadowed: this committed PK was moved elsewhere by this
                // transaction. A lookup by the old PK finds nothing.
                return Ok(None);
            }
        }
        self.acquire_read_protocol(&pk)?;
        Ok(self.first_touch(&pk).map(|(r, _)| r))
    }

    pub fn select(&self, fields: Option<&[String]>, where_q: &CompiledQuery) -> Result<Vec<Record>> {
        self.ensure_active()?;
        let mut out = Vec::new();
        for pk in self.base.ordered_pks() {
            let overlay_view = {
                let overlays = self.overlays.lock();
                if overlays.temp_deleted.contains(&pk) {
                    continue;
                }
                overlays.temp_updated_by_old_pk.get(&pk).map(|e| e.record.clone())
            };
            let record = match overlay_view {
                Some(r) => r,
                None => {
                    self.acquire_read_protocol(&pk)?;
                    match self.first_touch(&pk) {
                        Some((r, _)) => r,
                        None => continue,
                    }
                }
            };
            if matches(&record, where_q) {
                out.push(project(&record, fields));
            }
        }

        let inserted: Vec<Record> = {
            let overlays = self.overlays.lock();
            overlays
                .temp_inserts_list
                .iter()
                .filter_map(|pk| overlays.temp_inserts.get(pk).cloned())
                .collect()
        };
        for record in inserted {
            if matches(&record, where_q) {
                out.push(project(&record, fields));
            }
        }
        Ok(out)
    }

    pub fn update(&self, patch: &Record, where_q: &CompiledQuery) -> Result<usize> {
        self.ensure_active()?;
        if patch.is_empty() {
            return Ok(0);
        }
        let will_touch_pk = self.base.pk_def().touched_by(patch);
        let mut affected = 0;

        // Overlay-only inserted rows.
        let insert_pks = self.overlays.lock().temp_inserts_list.clone();
        for old_pk in insert_pks {
            let current = self.overlays.lock().temp_inserts.get(&old_pk).cloned();
            let current = match current {
                Some(r) => r,
                None => continue,
            };
            if !matches(&current, where_q) {
                continue;
            }
            let mut merged = current.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            if will_touch_pk {
                let new_pk = self.base.pk_def().build_pk_string(&mut merged)?;
                if new_pk != old_pk {
                    self.check_pk_not_used(&new_pk)?;
                    let mut overlays = self.overlays.lock();
                    overlays.temp_inserts.remove(&old_pk);
                    overlays.temp_inserts.insert(new_pk.clone(), merged);
                    if let Some(pos) = overlays.temp_inserts_list.iter().position(|p| p == &old_pk) {
                        overlays.temp_inserts_list[pos] = new_pk;
                    }
                } else {
                    self.overlays.lock().temp_inserts.insert(old_pk, merged);
                }
            } else {
                self.overlays.lock().temp_inserts.insert(old_pk, merged);
            }
            affected += 1;
        }

        // Committed rows, possibly already shadowed by a prior update in
        // this same transaction.
        for committed_pk in self.base.ordered_pks() {
            let (skip, existing_entry) = {
                let overlays = self.overlays.lock();
                if overlays.temp_deleted.contains(&committed_pk) {
                    (true, None)
                } else {
                    (false, overlays.temp_updated_by_old_pk.get(&committed_pk).cloned())
                }
            };
            if skip {
                continue;
            }
            if let Some(entry) = &existing_entry {
                let mut tmp = entry.record.clone();
                let current_pk = self.base.pk_def().build_pk_string(&mut tmp)?;
                if current_pk != committed_pk {
                    continue; // this committed PK has already been vacated
                }
            }

            let (current_view, read_version) = match &existing_entry {
                Some(entry) => (entry.record.clone(), entry.version),
                None => match self.first_touch(&committed_pk) {
                    Some(pair) => pair,
                    None => continue,
                },
            };
            if !matches(&current_view, where_q) {
                continue;
            }

            self.acquire_write_protocol(&committed_pk)?;

            let mut merged = current_view.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            let new_pk = self.base.pk_def().build_pk_string(&mut merged)?;
            if new_pk != committed_pk {
                self.check_pk_not_used(&new_pk)?;
            }

            let mut overlays = self.overlays.lock();
            match existing_entry {
                Some(_) => {
                    overlays.temp_inserts.remove(&committed_pk);
                    overlays.temp_inserts.insert(new_pk, merged.clone());
                    overlays
                        .temp_updated_by_old_pk
                        .get_mut(&committed_pk)
                        .expect("existing entry just matched above")
                        .record = merged;
                }
                None => {
                    overlays.temp_updated_by_old_pk.insert(
                        committed_pk.clone(),
                        UpdatedEntry {
                            record: merged.clone(),
                            version: read_version,
                        },
                    );
                    overlays.temp_inserts.insert(new_pk, merged);
                }
            }
            affected += 1;
        }

        Ok(affected)
    }

    pub fn delete_by_pk(&self, pk_partial: &Record) -> Result<Option<Record>> {
        self.ensure_active()?;
        let pk = self.base.pk_def().build_pk_string_from_partial(pk_partial)?;

        {
            let mut overlays = self.overlays.lock();
            if overlays.temp_inserts.contains_key(&pk) && !overlays.temp_updated_by_old_pk.contains_key(&pk) {
                overlays.temp_inserts_list.retain(|p| p != &pk);
                return Ok(overlays.temp_inserts.remove(&pk));
            }
            if let Some(entry) = overlays.temp_updated_by_old_pk.remove(&pk) {
                overlays.temp_inserts.remove(&pk);
                overlays.temp_deleted.insert(pk.clone());
                return Ok(Some(entry.record));
            }
        }

        if self.base.contains_pk(&pk) {
            if self.overlays.lock().temp_deleted.contains(&pk) {
                return Ok(None);
            }
            self.acquire_write_protocol(&pk)?;
            let committed = self.base.peek(&pk);
            self.overlays.lock().temp_deleted.insert(pk);
            return Ok(committed);
        }
        Ok(None)
    }

    /// Idempotent: calling again after the first rollback is a no-op.
    pub fn rollback(&self) {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        let mut overlays = self.overlays.lock();
        overlays.temp_inserts.clear();
        overlays.temp_inserts_list.clear();
        overlays.temp_updated_by_old_pk.clear();
        overlays.temp_deleted.clear();
        overlays.read_cache.clear();
        for key in overlays.held_locks.drain() {
            self.base.lock_manager().release_lock(self.txn_id, &key);
        }
        *state = TransactionState::RolledBack;
    }

    pub fn commit(&self) -> Result<()> {
        if self.state.lock().is_terminal() {
            return Err(Error::TransactionCompleted);
        }
        match self.apply() {
            Ok(()) => {
                self.release_all_locks();
                *self.state.lock() = TransactionState::Committed;
                self.clear_overlays();
                Ok(())
            }
            Err(e) => {
                self.release_all_locks();
                *self.state.lock() = TransactionState::RolledBack;
                self.clear_overlays();
                Err(e)
            }
        }
    }

    fn clear_overlays(&self) {
        let mut overlays = self.overlays.lock();
        overlays.temp_inserts.clear();
        overlays.temp_inserts_list.clear();
        overlays.temp_updated_by_old_pk.clear();
        overlays.temp_deleted.clear();
        overlays.read_cache.clear();
    }

    fn release_all_locks(&self) {
        let keys: Vec<String> = self.overlays.lock().held_locks.drain().collect();
        for key in keys {
            self.base.lock_manager().release_lock(self.txn_id, &key);
        }
    }

    /// Two-phase validate-then-write protocol. Keys are locked in sorted
    /// order so that two concurrent commits touching the same key set
    /// never form a lock-ordering cycle.
    fn apply(&self) -> Result<()> {
        let (touched_keys, deletes, updates, insert_records) = {
            let overlays = self.overlays.lock();
            let mut keys: HashSet<String> = overlays.temp_updated_by_old_pk.keys().cloned().collect();
            keys.extend(overlays.temp_deleted.iter().cloned());
            let mut keys: Vec<String> = keys.into_iter().collect();
            keys.sort();
            let inserts: Vec<Record> = overlays
                .temp_inserts_list
                .iter()
                .filter_map(|pk| overlays.temp_inserts.get(pk).cloned())
                .collect();
            (
                keys,
                overlays.temp_deleted.clone(),
                overlays.temp_updated_by_old_pk.clone(),
                inserts,
            )
        };

        // Validation phase: shared locks on the union of affected keys.
        let mut acquired = Vec::new();
        for key in &touched_keys {
            match self.base.lock_manager().acquire_lock_with_timeout(
                self.txn_id,
                key,
                LockKind::Shared,
                self.config.lock_timeout_ms(),
            ) {
                Ok(()) => acquired.push(key.clone()),
                Err(e) => {
                    for k in &acquired {
                        self.base.lock_manager().release_lock(self.txn_id, k);
                    }
                    return Err(e);
                }
            }
        }
        self.overlays.lock().held_locks.extend(acquired.iter().cloned());

        if let Err(e) = self.validate(&deletes, &updates) {
            return Err(e);
        }

        // Writing phase: escalate every touched key to Exclusive.
        for key in &touched_keys {
            self.base.lock_manager().acquire_lock_with_timeout(
                self.txn_id,
                key,
                LockKind::Exclusive,
                self.config.lock_timeout_ms(),
            )?;
        }

        self.base.apply_writes(&updates, &deletes, &insert_records)?;
        tracing::info!(txn_id = self.txn_id, table = %self.base.name(), "transaction table committed");
        Ok(())
    }

    #[tracing::instrument(skip(self, deletes, updates), fields(txn_id = self.txn_id, table = %self.base.name()))]
    fn validate(
        &self,
        deletes: &HashSet<String>,
        updates: &HashMap<String, UpdatedEntry>,
    ) -> Result<()> {
        let overlays = self.overlays.lock();
        for pk in overlays.temp_inserts.keys() {
            if self.base.contains_pk(pk)
                && !overlays.temp_updated_by_old_pk.contains_key(pk)
                && !overlays.temp_deleted.contains(pk)
            {
                tracing::warn!(txn_id = self.txn_id, pk, "commit validation: duplicate primary key");
                return Err(Error::TransactionConflict(format!(
                    "duplicate primary key value: {pk}"
                )));
            }
        }
        for (committed_pk, entry) in updates {
            match self.base.version_of(committed_pk) {
                Some(v) if v == entry.version => {}
                _ => {
                    tracing::warn!(
                        txn_id = self.txn_id,
                        pk = %committed_pk,
                        "commit validation: row externally modified since read"
                    );
                    return Err(Error::TransactionConflict(format!(
                        "{committed_pk} has been externally modified"
                    )));
                }
            }
        }
        for pk in deletes {
            if !self.base.contains_pk(pk) {
                tracing::warn!(txn_id = self.txn_id, pk, "commit validation: row no longer exists");
                return Err(Error::TransactionConflict(format!(
                    "{pk} no longer exists"
                )));
            }
        }
        // Every committed row this transaction has read (and not already
        // covered by an update/delete above) must still match the version
        // seen at first touch — otherwise a concurrent writer changed it
        // out from under a reader that never took a lock (ReadLatest).
        for (pk, snapshot) in &overlays.read_cache {
            if updates.contains_key(pk) || deletes.contains(pk) {
                continue;
            }
            match self.base.version_of(pk) {
                Some(v) if v == snapshot.version => {}
                _ => {
                    tracing::warn!(
                        txn_id = self.txn_id,
                        pk = %pk,
                        "commit validation: read row externally modified since read"
                    );
                    return Err(Error::TransactionConflict(format!(
                        "{pk} has been externally modified"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{compile, Query};
    use crate::record;
    use crate::util::PrimaryKeyDef;
    use crate::value::Value;

    fn base() -> Arc<BaseTable> {
        Arc::new(BaseTable::new(
            "users",
            PrimaryKeyDef::new(vec!["id".into()]).unwrap(),
            Config::default(),
        ))
    }

    #[test]
    fn pk_swap_within_one_transaction() {
        let b = base();
        b.insert(record! { "id" => 3i64, "name" => "C" }).unwrap();
        b.insert(record! { "id" => 4i64, "name" => "D" }).unwrap();

        let tt = TransactionTable::new(1, Config::default(), b.clone());
        let q3 = compile(Query::Eq("id".into(), Value::Int(3)));
        let q4 = compile(Query::Eq("id".into(), Value::Int(4)));
        assert_eq!(tt.update(&record! { "id" => 100i64 }, &q3).unwrap(), 1);
        assert_eq!(tt.update(&record! { "id" => 3i64 }, &q4).unwrap(), 1);
        tt.commit().unwrap();

        assert!(b.find_by_pk(&record! { "id" => 100i64 }).unwrap().is_some());
        assert!(b.find_by_pk(&record! { "id" => 3i64 }).unwrap().is_some());
        assert!(b.find_by_pk(&record! { "id" => 4i64 }).unwrap().is_none());
        assert_eq!(b.size(), 2);
    }

    #[test]
    fn commit_conflict_on_duplicate_pk() {
        let b = base();
        let tt = TransactionTable::new(1, Config::default(), b.clone());
        tt.insert(record! { "id" => 7i64, "name" => "A" }).unwrap();

        b.insert(record! { "id" => 7i64, "name" => "direct" }).unwrap();

        let err = tt.commit().unwrap_err();
        assert!(matches!(err, Error::TransactionConflict(_)));
        assert_eq!(b.size(), 1);
        let row = b.find_by_pk(&record! { "id" => 7i64 }).unwrap().unwrap();
        assert_eq!(row.get("name").unwrap().as_str(), Some("direct"));
    }

    #[test]
    fn optimistic_version_check_detects_external_modification() {
        let b = base();
        b.insert(record! { "id" => 9i64, "stock" => 10i64 }).unwrap();

        let cfg = Config {
            isolation_level: IsolationLevel::ReadLatest,
            ..Config::default()
        };
        let a = TransactionTable::new(1, cfg, b.clone());
        let guard = compile(Query::Eq("stock".into(), Value::Int(10)));
        assert_eq!(a.update(&record! { "stock" => 9i64 }, &guard).unwrap(), 1);

        let bt = TransactionTable::new(2, cfg, b.clone());
        assert_eq!(bt.update(&record! { "stock" => 9i64 }, &guard).unwrap(), 1);
        bt.commit().unwrap();

        let err = a.commit().unwrap_err();
        assert!(matches!(err, Error::TransactionConflict(_)));
        let row = b.find_by_pk(&record! { "id" => 9i64 }).unwrap().unwrap();
        assert_eq!(row.get("stock").unwrap(), &Value::Int(9));
    }

    #[test]
    fn read_then_update_matches_against_first_read_not_latest() {
        let b = base();
        b.insert(record! { "id" => 9i64, "stock" => 10i64 }).unwrap();
        let guard = compile(Query::Eq("stock".into(), Value::Int(10)));

        let cfg = Config {
            isolation_level: IsolationLevel::ReadLatest,
            ..Config::default()
        };
        let a = TransactionTable::new(1, cfg, b.clone());
        assert!(a.find_by_pk(&record! { "id" => 9i64 }).unwrap().is_some());

        let bt = TransactionTable::new(2, cfg, b.clone());
        assert_eq!(bt.update(&record! { "stock" => 9i64 }, &guard).unwrap(), 1);
        bt.commit().unwrap();

        // A's guard still matches its own first-read snapshot (stock == 10),
        // even though the base now holds stock == 9.
        assert_eq!(a.update(&record! { "stock" => 9i64 }, &guard).unwrap(), 1);
        let err = a.commit().unwrap_err();
        assert!(matches!(err, Error::TransactionConflict(_)));
    }

    #[test]
    fn pure_read_is_still_validated_at_commit_under_read_latest() {
        let b = base();
        b.insert(record! { "id" => 9i64, "stock" => 10i64 }).unwrap();

        let cfg = Config {
            isolation_level: IsolationLevel::ReadLatest,
            ..Config::default()
        };
        let a = TransactionTable::new(1, cfg, b.clone());
        assert!(a.find_by_pk(&record! { "id" => 9i64 }).unwrap().is_some());

        let guard = compile(Query::Eq("stock".into(), Value::Int(10)));
        let bt = TransactionTable::new(2, cfg, b.clone());
        assert_eq!(bt.update(&record! { "stock" => 9i64 }, &guard).unwrap(), 1);
        bt.commit().unwrap();

        // A never wrote anything, but it did read a row that has since
        // changed underneath it.
        let err = a.commit().unwrap_err();
        assert!(matches!(err, Error::TransactionConflict(_)));
    }

    #[test]
    fn rollback_is_idempotent() {
        let b = base();
        let tt = TransactionTable::new(1, Config::default(), b);
        tt.insert(record! { "id" => 1i64 }).unwrap();
        tt.rollback();
        tt.rollback();
    }

    #[test]
    fn repeatable_read_blocks_external_write() {
        let b = base();
        b.insert(record! { "id" => 5i64, "name" => "A" }).unwrap();

        let tt = TransactionTable::new(1, Config::default(), b.clone());
        assert!(tt.find_by_pk(&record! { "id" => 5i64 }).unwrap().is_some());

        let q = compile(Query::Eq("id".into(), Value::Int(5)));
        let err = b.update(&record! { "name" => "X" }, &q).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        tt.commit().unwrap();
        assert_eq!(b.update(&record! { "name" => "X" }, &q).unwrap(), 1);
    }
}
