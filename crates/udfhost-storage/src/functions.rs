//! Function catalog storage.
//!
//! One row per registered function in the `func` table, keyed by the
//! case-folded function name. Values are JSON-encoded [`FunctionRecord`]s.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use udfhost_core::catalog::{Catalog, CatalogError, Transaction};
use udfhost_core::types::{name_key, FunctionDefinition, FunctionKind, ReturnType};

use crate::{Error, Result};

// Functions table: key = case-folded name, value = FunctionRecord (JSON)
const FUNCTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("func");

/// A stored function row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// Declared name
    pub name: String,

    /// Return type code
    pub ret: u8,

    /// Library file, relative to the plugin directory
    pub dl: String,

    /// Function kind code; rows from before aggregates have none
    #[serde(default = "scalar_code")]
    pub kind: u8,

    /// Created at timestamp
    pub created_at: DateTime<Utc>,
}

fn scalar_code() -> u8 {
    FunctionKind::Scalar.code()
}

impl FunctionRecord {
    pub fn new(definition: &FunctionDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            ret: definition.return_type.code(),
            dl: definition.library_path.clone(),
            kind: definition.kind.code(),
            created_at: Utc::now(),
        }
    }

    /// Decode the row into a definition.
    pub fn to_definition(&self) -> Result<FunctionDefinition> {
        let return_type = ReturnType::from_code(self.ret).ok_or_else(|| {
            Error::Serialization(format!(
                "function '{}' has unknown return type code {}",
                self.name, self.ret
            ))
        })?;
        let kind = FunctionKind::from_code(self.kind).ok_or_else(|| {
            Error::Serialization(format!(
                "function '{}' has unknown kind code {}",
                self.name, self.kind
            ))
        })?;
        Ok(FunctionDefinition::new(
            self.name.clone(),
            kind,
            return_type,
            self.dl.clone(),
        ))
    }
}

/// Function catalog in a redb database.
#[derive(Clone)]
pub struct FunctionStore {
    db: Arc<Database>,
    /// Path to the database file
    path: PathBuf,
}

impl FunctionStore {
    /// Open the database, creating it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let db = if path.exists() {
            Database::open(path)?
        } else {
            Database::create(path)?
        };

        let store = FunctionStore {
            db: Arc::new(db),
            path: path.to_path_buf(),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(FUNCTIONS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a write transaction for create/drop statements.
    pub fn begin(&self) -> Result<StoreTransaction> {
        Ok(StoreTransaction {
            txn: Some(self.db.begin_write()?),
            committed: false,
            rollback_requested: false,
        })
    }

    /// Committed row for `name`, if any.
    pub fn get(&self, name: &str) -> Result<Option<FunctionRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FUNCTIONS_TABLE)?;

        if let Some(data) = table.get(name_key(name).as_str())? {
            Ok(Some(serde_json::from_slice(data.value())?))
        } else {
            Ok(None)
        }
    }

    /// All committed rows that decode. Undecodable rows are logged and
    /// skipped.
    pub fn records(&self) -> Result<Vec<FunctionRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FUNCTIONS_TABLE)?;

        let mut records = Vec::new();
        for result in table.iter()? {
            let (key, data) = result?;
            match serde_json::from_slice::<FunctionRecord>(data.value()) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %key.value(), error = %e, "Skipping undecodable function row"),
            }
        }
        Ok(records)
    }

    pub fn len(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FUNCTIONS_TABLE)?;
        Ok(table.iter()?.count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn insert_record(&self, txn: &StoreTransaction, definition: &FunctionDefinition) -> Result<()> {
        let write_txn = txn.active()?;
        let key = definition.key();
        let mut table = write_txn.open_table(FUNCTIONS_TABLE)?;

        if table.get(key.as_str())?.is_some() {
            return Err(Error::Duplicate(definition.name.clone()));
        }
        let value = serde_json::to_vec(&FunctionRecord::new(definition))?;
        table.insert(key.as_str(), value.as_slice())?;
        debug!(function = %definition.name, "Function row written");
        Ok(())
    }

    fn delete_record(&self, txn: &StoreTransaction, name: &str) -> Result<()> {
        let write_txn = txn.active()?;
        let mut table = write_txn.open_table(FUNCTIONS_TABLE)?;

        let existed = table.remove(name_key(name).as_str())?.is_some();
        if !existed {
            return Err(Error::NotFound(name.to_string()));
        }
        debug!(function = %name, "Function row deleted");
        Ok(())
    }
}

impl std::fmt::Debug for FunctionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionStore")
            .field("path", &self.path)
            .finish()
    }
}

impl Catalog for FunctionStore {
    type Txn = StoreTransaction;

    fn list_rows(&self) -> std::result::Result<Vec<FunctionDefinition>, CatalogError> {
        let mut rows = Vec::new();
        for record in self.records()? {
            match record.to_definition() {
                Ok(definition) => rows.push(definition),
                Err(e) => warn!(function = %record.name, error = %e, "Skipping function row"),
            }
        }
        Ok(rows)
    }

    fn insert_row(
        &self,
        txn: &mut StoreTransaction,
        definition: &FunctionDefinition,
    ) -> std::result::Result<(), CatalogError> {
        Ok(self.insert_record(txn, definition)?)
    }

    fn delete_row(
        &self,
        txn: &mut StoreTransaction,
        name: &str,
    ) -> std::result::Result<(), CatalogError> {
        Ok(self.delete_record(txn, name)?)
    }
}

/// A write transaction on the function table.
///
/// Dropping it without committing aborts it.
pub struct StoreTransaction {
    txn: Option<WriteTransaction>,
    committed: bool,
    rollback_requested: bool,
}

impl StoreTransaction {
    /// Mark the transaction rollback-only.
    pub fn request_rollback(&mut self) {
        self.rollback_requested = true;
    }

    pub fn is_open(&self) -> bool {
        self.txn.is_some()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    fn active(&self) -> Result<&WriteTransaction> {
        self.txn.as_ref().ok_or(Error::TransactionClosed)
    }
}

impl Transaction for StoreTransaction {
    fn commit(&mut self) -> std::result::Result<(), CatalogError> {
        let txn = self.txn.take().ok_or(CatalogError::NoTransaction)?;
        txn.commit().map_err(Error::from)?;
        self.committed = true;
        Ok(())
    }

    fn rollback(&mut self) -> std::result::Result<(), CatalogError> {
        match self.txn.take() {
            Some(txn) => Ok(txn.abort().map_err(Error::from)?),
            // A failed commit has already discarded everything.
            None if !self.committed => Ok(()),
            None => Err(CatalogError::NoTransaction),
        }
    }

    fn rollback_requested(&self) -> bool {
        self.rollback_requested
    }
}

impl Drop for StoreTransaction {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            if let Err(e) = txn.abort() {
                warn!(error = %e, "Failed to abort function catalog transaction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FunctionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FunctionStore::open(dir.path().join("func.redb")).unwrap();
        (dir, store)
    }

    fn def(name: &str) -> FunctionDefinition {
        FunctionDefinition::aggregate(name, ReturnType::Real, "udf_example.so")
    }

    #[test]
    fn test_rows_visible_after_commit() {
        let (_dir, store) = store();

        let mut txn = store.begin().unwrap();
        store.insert_row(&mut txn, &def("AvgCost")).unwrap();
        txn.commit().unwrap();
        assert!(txn.is_committed());

        let record = store.get("avgcost").unwrap().unwrap();
        assert_eq!(record.name, "AvgCost");
        assert_eq!(record.kind, 2);
        assert_eq!(record.ret, 1);
        assert_eq!(store.list_rows().unwrap(), vec![def("AvgCost")]);
    }

    #[test]
    fn test_dropped_transaction_aborts() {
        let (_dir, store) = store();
        {
            let mut txn = store.begin().unwrap();
            store.insert_row(&mut txn, &def("avgcost")).unwrap();
        }
        assert!(store.is_empty().unwrap());

        // The write lock was released by the abort.
        let mut txn = store.begin().unwrap();
        txn.rollback().unwrap();
        assert!(!txn.is_open());
    }

    #[test]
    fn test_duplicate_and_missing_rows() {
        let (_dir, store) = store();
        let mut txn = store.begin().unwrap();
        store.insert_row(&mut txn, &def("avgcost")).unwrap();

        assert_eq!(
            store.insert_row(&mut txn, &def("AVGCOST")),
            Err(CatalogError::Duplicate("AVGCOST".to_string()))
        );
        assert_eq!(
            store.delete_row(&mut txn, "metaphon"),
            Err(CatalogError::NotFound("metaphon".to_string()))
        );

        store.delete_row(&mut txn, "avgcost").unwrap();
        txn.commit().unwrap();
        assert!(store.is_empty().unwrap());

        assert_eq!(
            store.insert_row(&mut txn, &def("late")),
            Err(CatalogError::NoTransaction)
        );
    }

    #[test]
    fn test_legacy_and_corrupt_rows() {
        let (_dir, store) = store();
        let write_txn = store.db.begin_write().unwrap();
        {
            let mut table = write_txn.open_table(FUNCTIONS_TABLE).unwrap();
            let legacy = br#"{"name":"metaphon","ret":0,"dl":"udf_example.so","created_at":"2020-01-01T00:00:00Z"}"#;
            table.insert("metaphon", legacy.as_slice()).unwrap();
            let bad_code = br#"{"name":"odd","ret":3,"dl":"udf_example.so","kind":1,"created_at":"2020-01-01T00:00:00Z"}"#;
            table.insert("odd", bad_code.as_slice()).unwrap();
            table.insert("junk", b"not json".as_slice()).unwrap();
        }
        write_txn.commit().unwrap();

        assert_eq!(store.records().unwrap().len(), 2);
        let rows = store.list_rows().unwrap();
        assert_eq!(
            rows,
            vec![FunctionDefinition::scalar(
                "metaphon",
                ReturnType::String,
                "udf_example.so"
            )]
        );
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("func.redb");
        {
            let store = FunctionStore::open(&path).unwrap();
            let mut txn = store.begin().unwrap();
            store.insert_row(&mut txn, &def("avgcost")).unwrap();
            txn.commit().unwrap();
        }

        let store = FunctionStore::open(&path).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.path(), path.as_path());
    }
}
