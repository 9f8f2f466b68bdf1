//! In-process libraries built from symbol tables.
//!
//! Lets a host register functions compiled into its own binary under a
//! library name, so they go through the same registry path as functions
//! from shared objects. Open and close counts are tracked per library.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{LibraryLoader, NativeLibrary, SymbolAddr};

/// Exported symbols of one in-process library.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, SymbolAddr>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `addr` as `name`. Null addresses are ignored.
    pub fn with(mut self, name: impl Into<String>, addr: *const c_void) -> Self {
        if let Some(addr) = SymbolAddr::new(addr) {
            self.symbols.insert(name.into(), addr);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[derive(Default)]
struct LibraryStats {
    opens: AtomicUsize,
    closes: AtomicUsize,
}

struct Entry {
    symbols: Arc<SymbolTable>,
    stats: Arc<LibraryStats>,
}

/// Loader resolving library file names against registered symbol tables.
#[derive(Default)]
pub struct SymbolTableLoader {
    libraries: RwLock<HashMap<String, Entry>>,
}

impl SymbolTableLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `table` loadable under the file name `library`.
    pub fn register(&self, library: impl Into<String>, table: SymbolTable) {
        self.libraries.write().insert(
            library.into(),
            Entry {
                symbols: Arc::new(table),
                stats: Arc::new(LibraryStats::default()),
            },
        );
    }

    /// Times `library` has been opened.
    pub fn opens(&self, library: &str) -> usize {
        self.stat(library, |s| s.opens.load(Ordering::SeqCst))
    }

    /// Times `library` has been closed.
    pub fn closes(&self, library: &str) -> usize {
        self.stat(library, |s| s.closes.load(Ordering::SeqCst))
    }

    /// Number of open instances of `library`.
    pub fn live(&self, library: &str) -> usize {
        self.opens(library).saturating_sub(self.closes(library))
    }

    fn stat(&self, library: &str, read: impl Fn(&LibraryStats) -> usize) -> usize {
        self.libraries
            .read()
            .get(library)
            .map(|entry| read(&entry.stats))
            .unwrap_or(0)
    }
}

impl LibraryLoader for SymbolTableLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn NativeLibrary>, String> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        let libraries = self.libraries.read();
        let entry = libraries.get(file_name).ok_or_else(|| {
            format!(
                "{}: cannot open shared object file: No such file or directory",
                path.display()
            )
        })?;

        entry.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TableLibrary {
            symbols: entry.symbols.clone(),
            stats: entry.stats.clone(),
        }))
    }
}

struct TableLibrary {
    symbols: Arc<SymbolTable>,
    stats: Arc<LibraryStats>,
}

impl NativeLibrary for TableLibrary {
    fn symbol(&self, name: &str) -> Option<SymbolAddr> {
        self.symbols.symbols.get(name).copied()
    }
}

impl Drop for TableLibrary {
    fn drop(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}
