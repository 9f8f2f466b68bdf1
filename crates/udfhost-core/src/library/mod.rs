//! Shared handles on opened extension libraries.
//!
//! Several functions are usually exported by the same library. The
//! [`LibraryManager`] opens each canonical path once and hands out
//! reference-counted [`LibraryHandle`]s; the OS handle is closed exactly once,
//! when the last handle goes away.
//!
//! ```text
//!   descriptor "metaphon" ──┐
//!                           ├──► LibraryHandle ──► udf_example.so (open once)
//!   descriptor "myfunc_int"─┘
//! ```

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Result, UdfError};

pub mod dylib;
pub mod table;

pub use dylib::DylibLoader;
pub use table::{SymbolTable, SymbolTableLoader};

/// Address of an exported symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddr(NonNull<c_void>);

// SAFETY: a symbol address is an immutable location inside a mapped image;
// sharing the address itself across threads is sound.
unsafe impl Send for SymbolAddr {}
unsafe impl Sync for SymbolAddr {}

impl SymbolAddr {
    pub fn new(ptr: *const c_void) -> Option<Self> {
        NonNull::new(ptr as *mut c_void).map(SymbolAddr)
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0.as_ptr()
    }
}

/// An opened native module. Dropping it closes the module.
pub trait NativeLibrary: Send + Sync {
    /// Look up an exported symbol by name.
    fn symbol(&self, name: &str) -> Option<SymbolAddr>;
}

/// Platform loader used to open libraries.
pub trait LibraryLoader: Send + Sync {
    /// Open the library at `path`, returning the loader's message on failure.
    fn open(&self, path: &Path) -> std::result::Result<Box<dyn NativeLibrary>, String>;
}

struct LoadedLibrary {
    path: PathBuf,
    native: Box<dyn NativeLibrary>,
}

impl Drop for LoadedLibrary {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Closing shared library");
    }
}

/// A counted reference to an open library.
///
/// Handles are only created by [`LibraryManager::acquire`], so the count
/// equals the number of descriptors bound to the library.
pub struct LibraryHandle(Arc<LoadedLibrary>);

impl LibraryHandle {
    /// Canonical path the library was opened from.
    pub fn path(&self) -> &Path {
        &self.0.path
    }

    /// Number of live handles on this library.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn symbol(&self, name: &str) -> Option<SymbolAddr> {
        self.0.native.symbol(name)
    }

    /// Whether two handles refer to the same open library.
    pub fn same_library(&self, other: &LibraryHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("path", &self.0.path)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Opens, deduplicates and closes extension libraries.
///
/// Has its own lock, independent of the function registry, so a slow
/// `dlopen` never blocks function lookups.
pub struct LibraryManager {
    loader: Arc<dyn LibraryLoader>,
    plugin_dir: PathBuf,
    open: Mutex<HashMap<PathBuf, Weak<LoadedLibrary>>>,
}

impl LibraryManager {
    pub fn new(loader: Arc<dyn LibraryLoader>, plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            loader,
            plugin_dir: plugin_dir.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Manager backed by the platform's dynamic loader.
    pub fn dylib(plugin_dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(DylibLoader::new()), plugin_dir)
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Absolute path a catalog-relative library path refers to.
    pub fn resolve_path(&self, library_path: &str) -> PathBuf {
        let joined = self.plugin_dir.join(library_path);
        joined.canonicalize().unwrap_or(joined)
    }

    /// Get a handle on the library, opening it unless it is already open.
    ///
    /// The caller must have checked `library_path` against the path policy.
    pub fn acquire(&self, library_path: &str) -> Result<LibraryHandle> {
        let path = self.resolve_path(library_path);
        let mut open = self.open.lock();

        if let Some(existing) = open.get(&path).and_then(Weak::upgrade) {
            debug!(path = %path.display(), "Reusing open shared library");
            return Ok(LibraryHandle(existing));
        }

        let native = self
            .loader
            .open(&path)
            .map_err(|message| UdfError::LibraryLoad {
                path: library_path.to_string(),
                message,
            })?;

        let loaded = Arc::new(LoadedLibrary {
            path: path.clone(),
            native,
        });
        open.insert(path.clone(), Arc::downgrade(&loaded));
        info!(path = %path.display(), "Opened shared library");

        Ok(LibraryHandle(loaded))
    }

    /// Give a handle back. Returns true if this closed the library.
    pub fn release(&self, handle: LibraryHandle) -> bool {
        let mut open = self.open.lock();
        let path = handle.path().to_path_buf();
        drop(handle);

        let closed = open
            .get(&path)
            .map(|weak| weak.strong_count() == 0)
            .unwrap_or(false);
        if closed {
            open.remove(&path);
        }
        closed
    }

    /// Whether a library is currently open for this catalog-relative path.
    pub fn is_open(&self, library_path: &str) -> bool {
        let path = self.resolve_path(library_path);
        self.open
            .lock()
            .get(&path)
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Number of distinct libraries currently open.
    pub fn open_count(&self) -> usize {
        self.open
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl fmt::Debug for LibraryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryManager")
            .field("plugin_dir", &self.plugin_dir)
            .field("open", &self.open_count())
            .finish()
    }
}
