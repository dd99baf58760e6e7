//! Committed storage (`BaseTable`) and the per-transaction overlay on top
//! of it (`TransactionTable`).

pub mod base;
pub mod transaction_table;

pub use base::BaseTable;
pub use transaction_table::TransactionTable;

use crate::value::Record;

/// An overlay copy of a committed row plus the version token captured
/// when the overlay was first created — compared against the base's
/// current version at commit-time validation.
#[derive(Debug, Clone)]
pub struct UpdatedEntry {
    pub record: Record,
    pub version: u64,
}

/// Projects `record` onto `fields`, or returns a full copy when no
/// projection was requested.
pub(crate) fn project(record: &Record, fields: Option<&[String]>) -> Record {
    match fields {
        None => record.clone(),
        Some(fields) => {
            let mut out = Record::new();
            for f in fields {
                if let Some(v) = record.get(f) {
                    out.insert(f.clone(), v.clone());
                }
            }
            out
        }
    }
}
