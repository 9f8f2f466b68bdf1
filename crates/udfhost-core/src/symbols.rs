//! Entry-point resolution by naming convention.
//!
//! For a function `f` the library must export `f`. Aggregates must also
//! export `f_clear` and `f_add`. `f_init` and `f_deinit` are optional, but a
//! scalar with neither is refused unless suspicious bindings are allowed:
//! a bare name like `abs` is far more likely to be an unrelated C runtime
//! symbol than an extension function.

use std::ffi::c_void;
use std::mem;

use tracing::warn;

use crate::abi::{
    AddFn, AggregateFns, ClearFn, DeinitFn, EntryPoints, InitFn, IntFn, MainFn, RealFn, StringFn,
};
use crate::error::{Result, UdfError};
use crate::library::{LibraryHandle, SymbolAddr};
use crate::types::{FunctionDefinition, FunctionKind, ReturnType};

/// Resolves the entry points of a function inside an opened library.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolResolver {
    allow_suspicious_bindings: bool,
}

impl SymbolResolver {
    pub fn new(allow_suspicious_bindings: bool) -> Self {
        Self {
            allow_suspicious_bindings,
        }
    }

    /// Resolve every entry point `definition` needs from `library`.
    ///
    /// Touches neither the registry nor the library's reference count.
    pub fn resolve(
        &self,
        library: &LibraryHandle,
        definition: &FunctionDefinition,
    ) -> Result<EntryPoints> {
        let name = definition.name.as_str();

        let main = library
            .symbol(name)
            .ok_or_else(|| UdfError::MissingSymbol {
                name: name.to_string(),
            })?;

        let aggregate = match definition.kind {
            FunctionKind::Aggregate => {
                let clear = aux_symbol(library, name, "_clear")?;
                let add = aux_symbol(library, name, "_add")?;
                // SAFETY: by convention `f_clear`/`f_add` have the aggregate
                // signatures declared in `abi`.
                Some(unsafe {
                    AggregateFns {
                        clear: cast::<ClearFn>(clear),
                        add: cast::<AddFn>(add),
                    }
                })
            }
            FunctionKind::Scalar => None,
        };

        let deinit = library.symbol(&format!("{}_deinit", name));
        let init = library.symbol(&format!("{}_init", name));

        let mut suspicious = false;
        if init.is_none() && deinit.is_none() && definition.kind != FunctionKind::Aggregate {
            if !self.allow_suspicious_bindings {
                return Err(UdfError::SuspiciousBinding {
                    name: name.to_string(),
                });
            }
            warn!(
                function = %name,
                library = %library.path().display(),
                "Can't find {}_init or {}_deinit; binding anyway because suspicious bindings are allowed",
                name,
                name
            );
            suspicious = true;
        }

        // SAFETY: the extension contract fixes each symbol's signature by its
        // suffix and, for the main symbol, by the declared return type.
        let entry_points = unsafe {
            EntryPoints {
                main: main_fn(main, definition.return_type),
                init: init.map(|addr| cast::<InitFn>(addr)),
                deinit: deinit.map(|addr| cast::<DeinitFn>(addr)),
                aggregate,
                suspicious,
            }
        };

        Ok(entry_points)
    }
}

fn aux_symbol(library: &LibraryHandle, name: &str, suffix: &str) -> Result<SymbolAddr> {
    let symbol = format!("{}{}", name, suffix);
    library
        .symbol(&symbol)
        .ok_or(UdfError::AggregateMissingAuxSymbol { name: symbol })
}

unsafe fn main_fn(addr: SymbolAddr, return_type: ReturnType) -> MainFn {
    match return_type {
        ReturnType::String => MainFn::String(cast::<StringFn>(addr)),
        ReturnType::Real => MainFn::Real(cast::<RealFn>(addr)),
        ReturnType::Int => MainFn::Int(cast::<IntFn>(addr)),
        ReturnType::Decimal => MainFn::Decimal(cast::<StringFn>(addr)),
    }
}

/// Reinterpret a symbol address as a function pointer type.
///
/// Safety: `F` must be an `extern "C"` function pointer type matching the
/// code at `addr`.
unsafe fn cast<F: Copy>(addr: SymbolAddr) -> F {
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<*const c_void>());
    let ptr = addr.as_ptr();
    mem::transmute_copy::<*const c_void, F>(&ptr)
}
