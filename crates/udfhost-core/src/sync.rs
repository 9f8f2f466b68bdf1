//! Keeps the registry and the durable catalog in step.
//!
//! Create and drop run as small state machines:
//!
//! ```text
//!   Staged ──► Persisted ──► Committed
//!      │            │
//!      └────────────┴──────► Aborted
//! ```
//!
//! A create is staged in the registry before its row is written and is
//! withdrawn again if anything after that fails. A drop writes the catalog
//! first and only touches the registry once the transaction has committed.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, Transaction};
use crate::config::UdfConfig;
use crate::error::{Result, UdfError};
use crate::library::LibraryManager;
use crate::policy::{IdentifierPolicy, NameValidator, PathValidator, PluginDirPolicy};
use crate::registry::{FunctionDescriptor, FunctionId, FunctionRegistry};
use crate::symbols::SymbolResolver;
use crate::types::FunctionDefinition;

/// Progress of one create or drop statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlPhase {
    Staged,
    Persisted,
    Committed,
    Aborted,
}

impl fmt::Display for DdlPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            DdlPhase::Staged => "staged",
            DdlPhase::Persisted => "persisted",
            DdlPhase::Committed => "committed",
            DdlPhase::Aborted => "aborted",
        };
        f.write_str(phase)
    }
}

/// Outcome of a startup scan.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Functions registered and callable.
    pub loaded: Vec<String>,
    /// Functions registered whose library could not be opened.
    pub unusable: Vec<String>,
    /// Rows that were not registered, with the reason.
    pub skipped: Vec<(String, UdfError)>,
}

impl ScanReport {
    pub fn total(&self) -> usize {
        self.loaded.len() + self.unusable.len() + self.skipped.len()
    }

    pub fn is_clean(&self) -> bool {
        self.unusable.is_empty() && self.skipped.is_empty()
    }
}

/// Runs create, drop and the startup scan against a catalog.
pub struct CatalogSync<C: Catalog> {
    catalog: C,
    registry: FunctionRegistry,
    resolver: SymbolResolver,
    paths: Box<dyn PathValidator>,
    names: Box<dyn NameValidator>,
    // Create and drop never interleave.
    ddl: Mutex<()>,
}

impl<C: Catalog> CatalogSync<C> {
    pub fn new(catalog: C, libraries: Arc<LibraryManager>, config: &UdfConfig) -> Self {
        Self {
            catalog,
            registry: FunctionRegistry::new(libraries),
            resolver: SymbolResolver::new(config.allow_suspicious_bindings),
            paths: Box::new(PluginDirPolicy),
            names: Box::new(IdentifierPolicy::new(config.max_name_chars)),
            ddl: Mutex::new(()),
        }
    }

    /// Replace the path and identifier checks.
    pub fn with_validators(
        mut self,
        paths: impl PathValidator + 'static,
        names: impl NameValidator + 'static,
    ) -> Self {
        self.paths = Box::new(paths);
        self.names = Box::new(names);
        self
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Register every catalog row.
    ///
    /// Row failures are logged and reported but never stop the scan. Only a
    /// failure to read the catalog itself is returned as an error.
    pub fn load_catalog(&self) -> Result<ScanReport> {
        let rows = self.catalog.list_rows().map_err(|e| {
            error!(error = %e, "Can't read the function catalog; no functions will be available");
            UdfError::from(e)
        })?;

        let mut report = ScanReport::default();
        for definition in rows {
            let name = definition.name.clone();
            match self.load_row(definition) {
                Ok(true) => report.loaded.push(name),
                Ok(false) => report.unusable.push(name),
                Err(e) => {
                    error!(function = %name, error = %e, "Skipping function catalog row");
                    report.skipped.push((name, e));
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            unusable = report.unusable.len(),
            skipped = report.skipped.len(),
            "Function catalog loaded"
        );
        Ok(report)
    }

    /// Register one row. `Ok(false)` means registered without a binding.
    fn load_row(&self, definition: FunctionDefinition) -> Result<bool> {
        self.validate(&definition)?;

        let library = match self.registry.libraries().acquire(&definition.library_path) {
            Ok(library) => library,
            Err(e) => {
                // Kept so the name stays reserved and can still be dropped.
                warn!(function = %definition.name, error = %e, "Function registered without its library");
                self.registry.insert(FunctionDescriptor::unusable(definition))?;
                return Ok(false);
            }
        };

        let entry_points = match self.resolver.resolve(&library, &definition) {
            Ok(entry_points) => entry_points,
            Err(e) => {
                self.registry.libraries().release(library);
                return Err(e);
            }
        };

        self.registry
            .insert(FunctionDescriptor::bound(definition, entry_points, library))?;
        Ok(true)
    }

    /// Register a new function and persist it inside `txn`.
    ///
    /// On failure the transaction is rolled back and the registry is left as
    /// it was.
    pub fn create(&self, txn: &mut C::Txn, definition: FunctionDefinition) -> Result<()> {
        let _ddl = self.ddl.lock();
        let name = definition.name.clone();

        match self.create_staged(txn, definition) {
            Ok(()) => {
                info!(function = %name, phase = %DdlPhase::Committed, "Function created");
                Ok(())
            }
            Err(e) => {
                self.abort(txn, &name, &e);
                Err(e)
            }
        }
    }

    fn create_staged(&self, txn: &mut C::Txn, definition: FunctionDefinition) -> Result<()> {
        self.validate(&definition)?;
        if self.registry.contains(&definition.name) {
            return Err(UdfError::DuplicateName(definition.name));
        }

        let descriptor = self.bind(&definition)?;
        let id = self.registry.insert(descriptor)?;
        debug!(function = %definition.name, id = %id, phase = %DdlPhase::Staged, "Create staged");

        if let Err(e) = self.catalog.insert_row(txn, &definition) {
            self.unstage(id);
            return Err(e.into());
        }
        debug!(function = %definition.name, phase = %DdlPhase::Persisted, "Create persisted");

        if let Err(e) = finish(txn) {
            self.unstage(id);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a function from the catalog inside `txn`, then from the
    /// registry once the transaction has committed.
    pub fn drop_function(&self, txn: &mut C::Txn, name: &str) -> Result<()> {
        let _ddl = self.ddl.lock();

        if let Err(e) = self.drop_staged(txn, name) {
            self.abort(txn, name, &e);
            return Err(e);
        }

        // Committed: the registry follows the catalog from here on.
        if let Err(e) = self.registry.mark_for_removal(name) {
            warn!(function = %name, error = %e, "Dropped function was already unregistered");
        }
        info!(function = %name, phase = %DdlPhase::Committed, "Function dropped");
        Ok(())
    }

    fn drop_staged(&self, txn: &mut C::Txn, name: &str) -> Result<()> {
        if !self.registry.contains(name) {
            return Err(UdfError::not_found(name));
        }
        debug!(function = %name, phase = %DdlPhase::Staged, "Drop staged");

        self.catalog.delete_row(txn, name)?;
        debug!(function = %name, phase = %DdlPhase::Persisted, "Drop persisted");

        finish(txn)
    }

    /// Unregister every function, leaving the catalog untouched. Functions
    /// still in use go away with their last release. Returns how many were
    /// unregistered.
    pub fn shutdown(&self) -> usize {
        let _ddl = self.ddl.lock();
        self.registry.clear()
    }

    fn validate(&self, definition: &FunctionDefinition) -> Result<()> {
        if !self.names.is_valid_name(&definition.name) {
            return Err(UdfError::invalid_name(&definition.name));
        }
        if !self.paths.is_allowed_path(&definition.library_path) {
            return Err(UdfError::invalid_path(&definition.library_path));
        }
        Ok(())
    }

    /// Open the library and resolve the entry points. The library is
    /// released again if resolution fails.
    fn bind(&self, definition: &FunctionDefinition) -> Result<FunctionDescriptor> {
        let libraries = self.registry.libraries();
        let library = libraries.acquire(&definition.library_path)?;

        match self.resolver.resolve(&library, definition) {
            Ok(entry_points) => Ok(FunctionDescriptor::bound(
                definition.clone(),
                entry_points,
                library,
            )),
            Err(e) => {
                libraries.release(library);
                Err(e)
            }
        }
    }

    fn unstage(&self, id: FunctionId) {
        if !self.registry.withdraw(id) {
            warn!(id = %id, "Staged function was already gone");
        }
    }

    fn abort(&self, txn: &mut C::Txn, name: &str, cause: &UdfError) {
        warn!(function = %name, error = %cause, phase = %DdlPhase::Aborted, "DDL aborted");
        if let Err(e) = txn.rollback() {
            error!(function = %name, error = %e, "Rollback failed");
        }
    }
}

/// Commit unless the session already asked for a rollback.
fn finish<T: Transaction>(txn: &mut T) -> Result<()> {
    if txn.rollback_requested() {
        return Err(UdfError::TransactionAborted(
            "rollback requested by the session".to_string(),
        ));
    }
    txn.commit()
        .map_err(|e| UdfError::TransactionAborted(format!("commit failed: {}", e)))
}

impl<C: Catalog + fmt::Debug> fmt::Debug for CatalogSync<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogSync")
            .field("catalog", &self.catalog)
            .field("registry", &self.registry)
            .field("resolver", &self.resolver)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogError, MemoryCatalog};
    use crate::library::SymbolTableLoader;
    use crate::types::ReturnType;

    fn sync(catalog: MemoryCatalog) -> CatalogSync<MemoryCatalog> {
        let libraries = Arc::new(LibraryManager::new(
            Arc::new(SymbolTableLoader::new()),
            "/plugins",
        ));
        CatalogSync::new(catalog, libraries, &UdfConfig::default())
    }

    #[test]
    fn test_invalid_rows_are_skipped() {
        let catalog = MemoryCatalog::with_rows([
            FunctionDefinition::scalar("escape", ReturnType::Int, "../libc.so.6"),
            FunctionDefinition::scalar("", ReturnType::Int, "libdemo.so"),
        ]);
        let sync = sync(catalog);

        let report = sync.load_catalog().unwrap();
        assert_eq!(report.skipped.len(), 2);
        assert!(sync.registry().is_empty());
    }

    #[test]
    fn test_create_rejects_bad_input_and_rolls_back() {
        let sync = sync(MemoryCatalog::new());

        let mut txn = sync.catalog().begin();
        let err = sync
            .create(
                &mut txn,
                FunctionDefinition::scalar("f", ReturnType::Int, "/lib/libc.so.6"),
            )
            .unwrap_err();
        assert_eq!(err, UdfError::InvalidPath("/lib/libc.so.6".to_string()));
        assert!(txn.is_rolled_back());

        let mut txn = sync.catalog().begin();
        let long = "x".repeat(65);
        let err = sync
            .create(&mut txn, FunctionDefinition::scalar(long, ReturnType::Int, "libdemo.so"))
            .unwrap_err();
        assert!(matches!(err, UdfError::InvalidName(_)));
    }

    #[test]
    fn test_drop_unknown_function() {
        let sync = sync(MemoryCatalog::new());
        let mut txn = sync.catalog().begin();

        let err = sync.drop_function(&mut txn, "nothing").unwrap_err();
        assert_eq!(err, UdfError::FunctionNotFound("nothing".to_string()));
        assert!(txn.is_rolled_back());
    }

    /// Unregisters the function behind the sync's back while deleting its
    /// row, so the registry no longer holds it once the drop commits.
    struct UnregisteringCatalog {
        inner: MemoryCatalog,
        registry: Mutex<Option<FunctionRegistry>>,
    }

    impl Catalog for UnregisteringCatalog {
        type Txn = crate::catalog::MemoryTransaction;

        fn list_rows(&self) -> std::result::Result<Vec<FunctionDefinition>, CatalogError> {
            self.inner.list_rows()
        }

        fn insert_row(
            &self,
            txn: &mut Self::Txn,
            definition: &FunctionDefinition,
        ) -> std::result::Result<(), CatalogError> {
            self.inner.insert_row(txn, definition)
        }

        fn delete_row(
            &self,
            txn: &mut Self::Txn,
            name: &str,
        ) -> std::result::Result<(), CatalogError> {
            if let Some(registry) = self.registry.lock().as_ref() {
                registry.mark_for_removal(name).unwrap();
            }
            self.inner.delete_row(txn, name)
        }
    }

    #[test]
    fn test_committed_drop_succeeds_when_already_unregistered() {
        let catalog = UnregisteringCatalog {
            inner: MemoryCatalog::with_rows([FunctionDefinition::scalar(
                "ghost",
                ReturnType::Int,
                "libgone.so",
            )]),
            registry: Mutex::new(None),
        };
        let libraries = Arc::new(LibraryManager::new(
            Arc::new(SymbolTableLoader::new()),
            "/plugins",
        ));
        let sync = CatalogSync::new(catalog, libraries, &UdfConfig::default());
        assert_eq!(sync.load_catalog().unwrap().unusable, vec!["ghost".to_string()]);
        *sync.catalog().registry.lock() = Some(sync.registry().clone());

        let mut txn = sync.catalog().inner.begin();
        sync.drop_function(&mut txn, "ghost").unwrap();

        assert!(txn.is_committed());
        assert!(!txn.is_rolled_back());
        assert!(sync.catalog().inner.is_empty());
        assert!(!sync.registry().contains("ghost"));
    }

    #[test]
    fn test_shutdown_keeps_catalog_rows() {
        let sync = sync(MemoryCatalog::with_rows([
            FunctionDefinition::scalar("one", ReturnType::Int, "libgone.so"),
            FunctionDefinition::scalar("two", ReturnType::Real, "libgone.so"),
        ]));
        sync.load_catalog().unwrap();
        assert_eq!(sync.registry().visible_len(), 2);

        assert_eq!(sync.shutdown(), 2);
        assert!(sync.registry().is_empty());
        assert_eq!(sync.catalog().len(), 2);

        // The next scan brings them back.
        assert_eq!(sync.load_catalog().unwrap().total(), 2);
        assert_eq!(sync.registry().visible_len(), 2);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(DdlPhase::Persisted.to_string(), "persisted");
        assert!(ScanReport::default().is_clean());
    }
}
