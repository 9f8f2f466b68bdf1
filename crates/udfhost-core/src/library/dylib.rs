//! Platform dynamic loader (`dlopen`/`LoadLibrary`) via libloading.

use std::ffi::c_void;
use std::path::Path;

use libloading::Library;

use super::{LibraryLoader, NativeLibrary, SymbolAddr};

/// Opens extension libraries with the platform loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl DylibLoader {
    pub fn new() -> Self {
        Self
    }
}

impl LibraryLoader for DylibLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn NativeLibrary>, String> {
        let library = open_now(path).map_err(|e| e.to_string())?;
        Ok(Box::new(Dylib(library)))
    }
}

/// Bind every symbol at load time so unresolved dependencies surface as a
/// load error rather than a crash on first call.
#[cfg(unix)]
fn open_now(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};

    // SAFETY: loading runs the module's initialisers. Libraries are trusted
    // once their path has passed the plugin directory policy.
    unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_LOCAL) }.map(Library::from)
}

#[cfg(not(unix))]
fn open_now(path: &Path) -> Result<Library, libloading::Error> {
    // SAFETY: see the unix variant.
    unsafe { Library::new(path) }
}

struct Dylib(Library);

impl NativeLibrary for Dylib {
    fn symbol(&self, name: &str) -> Option<SymbolAddr> {
        // SAFETY: the symbol is read as an untyped address; it is only
        // reinterpreted as a function pointer by the symbol resolver.
        let symbol = unsafe { self.0.get::<*mut c_void>(name.as_bytes()) }.ok()?;
        SymbolAddr::new(*symbol)
    }
}
