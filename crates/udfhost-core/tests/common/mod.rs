//! Shared fixtures: in-process extension libraries built from plain
//! `extern "C"` functions.

#![allow(dead_code)]

use std::ffi::{c_char, c_longlong, c_uchar, c_void};
use std::sync::Arc;

use udfhost_core::abi::{AddFn, ClearFn, DeinitFn, InitFn, IntFn, RealFn, UdfArgs, UdfInit};
use udfhost_core::library::{LibraryManager, SymbolTable, SymbolTableLoader};
use udfhost_core::{CatalogSync, MemoryCatalog, UdfConfig};

pub unsafe extern "C" fn myfunc_int(
    _: *mut UdfInit,
    _: *mut UdfArgs,
    _: *mut c_uchar,
    _: *mut c_uchar,
) -> c_longlong {
    7
}

pub unsafe extern "C" fn myfunc_double(
    _: *mut UdfInit,
    _: *mut UdfArgs,
    _: *mut c_uchar,
    _: *mut c_uchar,
) -> f64 {
    2.5
}

pub unsafe extern "C" fn noop_init(_: *mut UdfInit, _: *mut UdfArgs, _: *mut c_char) -> bool {
    false
}

pub unsafe extern "C" fn noop_deinit(_: *mut UdfInit) {}

pub unsafe extern "C" fn noop_clear(_: *mut UdfInit, _: *mut c_uchar, _: *mut c_uchar) {}

pub unsafe extern "C" fn noop_add(
    _: *mut UdfInit,
    _: *mut UdfArgs,
    _: *mut c_uchar,
    _: *mut c_uchar,
) {
}

/// Loader knowing three libraries:
///
/// - `libdemo.so`: `myfunc_int`, `myfunc_double` and the aggregate `avgcost`,
///   all with auxiliary symbols
/// - `libx.so`: a bare `myfunc` with no auxiliary symbols
/// - `libhalf.so`: an aggregate `avgcost` missing `avgcost_add`
pub fn demo_loader() -> Arc<SymbolTableLoader> {
    let loader = Arc::new(SymbolTableLoader::new());
    loader.register(
        "libdemo.so",
        SymbolTable::new()
            .with("myfunc_int", myfunc_int as IntFn as *const c_void)
            .with("myfunc_int_init", noop_init as InitFn as *const c_void)
            .with("myfunc_double", myfunc_double as RealFn as *const c_void)
            .with("myfunc_double_init", noop_init as InitFn as *const c_void)
            .with("myfunc_double_deinit", noop_deinit as DeinitFn as *const c_void)
            .with("avgcost", myfunc_double as RealFn as *const c_void)
            .with("avgcost_init", noop_init as InitFn as *const c_void)
            .with("avgcost_deinit", noop_deinit as DeinitFn as *const c_void)
            .with("avgcost_clear", noop_clear as ClearFn as *const c_void)
            .with("avgcost_add", noop_add as AddFn as *const c_void),
    );
    loader.register(
        "libx.so",
        SymbolTable::new().with("myfunc", myfunc_int as IntFn as *const c_void),
    );
    loader.register(
        "libhalf.so",
        SymbolTable::new()
            .with("avgcost", myfunc_double as RealFn as *const c_void)
            .with("avgcost_clear", noop_clear as ClearFn as *const c_void),
    );
    loader
}

pub fn config(allow_suspicious_bindings: bool) -> UdfConfig {
    UdfConfig {
        plugin_dir: "/nonexistent/plugins".into(),
        allow_suspicious_bindings,
        ..UdfConfig::default()
    }
}

pub fn sync_over(
    loader: &Arc<SymbolTableLoader>,
    catalog: MemoryCatalog,
    config: &UdfConfig,
) -> CatalogSync<MemoryCatalog> {
    let libraries = Arc::new(LibraryManager::new(loader.clone(), config.plugin_dir.clone()));
    CatalogSync::new(catalog, libraries, config)
}

/// Call an integer entry point with empty argument blocks.
pub fn call_int(entry_points: &udfhost_core::abi::EntryPoints) -> c_longlong {
    match entry_points.main {
        udfhost_core::abi::MainFn::Int(f) => unsafe {
            f(
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        },
        other => panic!("expected an integer entry point, got {:?}", other),
    }
}
