//! Collaborator contracts for the durable function catalog.
//!
//! The registry never stores anything itself. Create and drop write through
//! a [`Catalog`] inside a caller-owned [`Transaction`]; the startup scan reads
//! every row back. [`MemoryCatalog`] is a volatile implementation for hosts
//! without durable storage, and for tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{name_key, FunctionDefinition};

/// Failures reported by catalog and transaction collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// The backing store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// No row exists for the function.
    #[error("No catalog row for function '{0}'")]
    NotFound(String),

    /// A row already exists for the function.
    #[error("Catalog row for function '{0}' already exists")]
    Duplicate(String),

    /// A stored row could not be decoded.
    #[error("Corrupt catalog row: {0}")]
    Corrupt(String),

    /// The transaction was already committed or rolled back.
    #[error("Transaction is no longer active")]
    NoTransaction,
}

/// The transaction a DDL statement runs in.
pub trait Transaction {
    fn commit(&mut self) -> Result<(), CatalogError>;

    fn rollback(&mut self) -> Result<(), CatalogError>;

    /// Whether the session has already decided this transaction must roll
    /// back. Checked before committing.
    fn rollback_requested(&self) -> bool;
}

/// Durable table of registered functions.
///
/// Writes happen inside the caller's transaction; implementations must not
/// commit or roll back on their own.
pub trait Catalog: Send + Sync {
    type Txn: Transaction;

    /// Every persisted row, in no particular order.
    fn list_rows(&self) -> Result<Vec<FunctionDefinition>, CatalogError>;

    fn insert_row(
        &self,
        txn: &mut Self::Txn,
        definition: &FunctionDefinition,
    ) -> Result<(), CatalogError>;

    fn delete_row(&self, txn: &mut Self::Txn, name: &str) -> Result<(), CatalogError>;
}

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<String, FunctionDefinition>,
    fail_writes: bool,
}

/// In-memory catalog. Clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-populated with committed rows.
    pub fn with_rows(rows: impl IntoIterator<Item = FunctionDefinition>) -> Self {
        let catalog = Self::new();
        {
            let mut state = catalog.state.lock();
            for row in rows {
                state.rows.insert(row.key(), row);
            }
        }
        catalog
    }

    pub fn begin(&self) -> MemoryTransaction {
        MemoryTransaction {
            state: self.state.clone(),
            pending: Vec::new(),
            status: TxnStatus::Active,
            rollback_requested: false,
            fail_commit: false,
        }
    }

    /// Make every subsequent row write fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Committed row for `name`, if any.
    pub fn row(&self, name: &str) -> Option<FunctionDefinition> {
        self.state.lock().rows.get(&name_key(name)).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCatalog")
            .field("rows", &self.len())
            .finish()
    }
}

impl Catalog for MemoryCatalog {
    type Txn = MemoryTransaction;

    fn list_rows(&self) -> Result<Vec<FunctionDefinition>, CatalogError> {
        Ok(self.state.lock().rows.values().cloned().collect())
    }

    fn insert_row(
        &self,
        txn: &mut MemoryTransaction,
        definition: &FunctionDefinition,
    ) -> Result<(), CatalogError> {
        txn.ensure_active()?;
        let key = definition.key();
        {
            let state = self.state.lock();
            if state.fail_writes {
                return Err(CatalogError::Storage(format!(
                    "write of '{}' refused",
                    definition.name
                )));
            }
            if txn.row_exists(&state, &key) {
                return Err(CatalogError::Duplicate(definition.name.clone()));
            }
        }
        txn.pending.push(PendingOp::Insert(definition.clone()));
        Ok(())
    }

    fn delete_row(&self, txn: &mut MemoryTransaction, name: &str) -> Result<(), CatalogError> {
        txn.ensure_active()?;
        let key = name_key(name);
        {
            let state = self.state.lock();
            if state.fail_writes {
                return Err(CatalogError::Storage(format!("delete of '{}' refused", name)));
            }
            if !txn.row_exists(&state, &key) {
                return Err(CatalogError::NotFound(name.to_string()));
            }
        }
        txn.pending.push(PendingOp::Delete(key));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStatus {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
enum PendingOp {
    Insert(FunctionDefinition),
    Delete(String),
}

/// Transaction over a [`MemoryCatalog`]. Writes become visible on commit;
/// dropping an uncommitted transaction discards them.
pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    pending: Vec<PendingOp>,
    status: TxnStatus,
    rollback_requested: bool,
    fail_commit: bool,
}

impl MemoryTransaction {
    /// Mark the transaction rollback-only.
    pub fn request_rollback(&mut self) {
        self.rollback_requested = true;
    }

    /// Make the next commit fail.
    pub fn fail_on_commit(&mut self) {
        self.fail_commit = true;
    }

    pub fn is_committed(&self) -> bool {
        self.status == TxnStatus::Committed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.status == TxnStatus::RolledBack
    }

    fn ensure_active(&self) -> Result<(), CatalogError> {
        if self.status == TxnStatus::Active {
            Ok(())
        } else {
            Err(CatalogError::NoTransaction)
        }
    }

    /// Whether `key` exists as seen from inside this transaction.
    fn row_exists(&self, state: &MemoryState, key: &str) -> bool {
        let mut exists = state.rows.contains_key(key);
        for op in &self.pending {
            match op {
                PendingOp::Insert(def) if def.key() == key => exists = true,
                PendingOp::Delete(k) if k == key => exists = false,
                _ => {}
            }
        }
        exists
    }
}

impl Transaction for MemoryTransaction {
    fn commit(&mut self) -> Result<(), CatalogError> {
        self.ensure_active()?;
        if self.fail_commit {
            return Err(CatalogError::Storage("commit failed".to_string()));
        }

        let mut state = self.state.lock();
        for op in self.pending.drain(..) {
            match op {
                PendingOp::Insert(def) => {
                    state.rows.insert(def.key(), def);
                }
                PendingOp::Delete(key) => {
                    state.rows.remove(&key);
                }
            }
        }
        self.status = TxnStatus::Committed;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), CatalogError> {
        self.ensure_active()?;
        self.pending.clear();
        self.status = TxnStatus::RolledBack;
        Ok(())
    }

    fn rollback_requested(&self) -> bool {
        self.rollback_requested
    }
}
