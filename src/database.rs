//! The table registry and the `transaction(callback)` convenience that
//! wraps a `Transaction`'s commit/rollback around a user closure. Thin
//! glue over the core engine, not part of it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::table::BaseTable;
use crate::transaction::{Config, Transaction};
use crate::util::PrimaryKeyDef;

/// The table registry a `Database` hands to every transaction it opens.
pub struct Database {
    tables: RwLock<HashMap<String, Arc<BaseTable>>>,
}

impl Database {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new table. Returns `DuplicatePkDefinition` if
    /// `pk_fields` contains a repeated field name; a second call with the
    /// same table name simply replaces the registry entry (existing
    /// `Arc<BaseTable>` handles held elsewhere keep working against the
    /// table they were handed).
    pub fn create_table(
        &self,
        name: impl Into<String>,
        pk_fields: Vec<String>,
        config: Config,
    ) -> Result<Arc<BaseTable>> {
        let name = name.into();
        let pk_def = PrimaryKeyDef::new(pk_fields)?;
        let table = Arc::new(BaseTable::new(name.clone(), pk_def, config));
        self.tables.write().insert(name, table.clone());
        Ok(table)
    }

    pub fn table(&self, name: &str) -> Result<Arc<BaseTable>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    fn snapshot_registry(&self) -> HashMap<String, Arc<BaseTable>> {
        self.tables.read().clone()
    }

    /// Opens a transaction against a snapshot of the current table
    /// registry, with `Config::default()`. Unlike [`Database::transaction`],
    /// the caller drives commit/rollback explicitly — useful for holding a
    /// transaction open across other work (tests, multi-step workflows).
    pub fn begin(&self) -> Transaction {
        self.begin_with_config(Config::default())
    }

    pub fn begin_with_config(&self, config: Config) -> Transaction {
        Transaction::new(self.snapshot_registry(), config)
    }

    /// Opens a transaction with `Config::default()`, runs `f`, commits on
    /// `Ok` and rolls back on `Err`. The closure's error type must convert
    /// from the engine's `Error` so commit failures surface uniformly.
    pub fn transaction<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        self.transaction_with_config(Config::default(), f)
    }

    pub fn transaction_with_config<F, T, E>(
        &self,
        config: Config,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let tx = Transaction::new(self.snapshot_registry(), config);
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{compile, Query};
    use crate::record;
    use crate::value::Value;

    #[test]
    fn create_table_and_direct_crud() {
        let db = Database::new();
        let users = db
            .create_table("users", vec!["id".to_string()], Config::default())
            .unwrap();
        users.insert(record! { "id" => 1i64, "name" => "A" }).unwrap();
        assert_eq!(db.table("users").unwrap().size(), 1);
    }

    #[test]
    fn duplicate_pk_field_is_rejected_at_table_creation() {
        let db = Database::new();
        let err = db
            .create_table("bad", vec!["id".to_string(), "id".to_string()], Config::default())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicatePkDefinition(_)));
    }

    #[test]
    fn transaction_helper_commits_on_ok_and_rolls_back_on_err() {
        let db = Database::new();
        db.create_table("users", vec!["id".to_string()], Config::default())
            .unwrap();

        let result: std::result::Result<(), Error> = db.transaction(|tx| {
            let users = tx.get("users")?;
            users.insert(record! { "id" => 1i64 })?;
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(db.table("users").unwrap().size(), 1);

        let result: std::result::Result<(), Error> = db.transaction(|tx| {
            let users = tx.get("users")?;
            users.insert(record! { "id" => 2i64 })?;
            Err(Error::TransactionConflict("forced failure".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.table("users").unwrap().size(), 1);
        let q = compile(Query::Eq("id".into(), Value::Int(2)));
        assert!(db.table("users").unwrap().select(None, &q).unwrap().is_empty());
    }

    #[test]
    fn unregistered_table_surfaces_table_not_found() {
        let db = Database::new();
        let err = db.table("missing").unwrap_err();
        assert!(matches!(err, Error::TableNotFound(_)));
    }
}
