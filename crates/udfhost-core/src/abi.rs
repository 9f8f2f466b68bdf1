//! C calling conventions of extension-library entry points.
//!
//! A function `f` is exported as the symbol `f` plus optional `f_init` and
//! `f_deinit`; aggregates additionally export `f_clear` and `f_add`. The
//! argument blocks are owned by the query engine and opaque here.

use std::ffi::{c_char, c_longlong, c_uchar, c_ulong};

/// Per-call state block handed to every entry point.
#[repr(C)]
pub struct UdfInit {
    _opaque: [u8; 0],
}

/// Argument block describing the SQL arguments of a call.
#[repr(C)]
pub struct UdfArgs {
    _opaque: [u8; 0],
}

/// `f_init(initid, args, message) -> error`
pub type InitFn = unsafe extern "C" fn(*mut UdfInit, *mut UdfArgs, *mut c_char) -> bool;

/// `f_deinit(initid)`
pub type DeinitFn = unsafe extern "C" fn(*mut UdfInit);

/// String and decimal results: `f(initid, args, result, length, is_null, error) -> ptr`
pub type StringFn = unsafe extern "C" fn(
    *mut UdfInit,
    *mut UdfArgs,
    *mut c_char,
    *mut c_ulong,
    *mut c_uchar,
    *mut c_uchar,
) -> *mut c_char;

/// `f(initid, args, is_null, error) -> f64`
pub type RealFn = unsafe extern "C" fn(*mut UdfInit, *mut UdfArgs, *mut c_uchar, *mut c_uchar) -> f64;

/// `f(initid, args, is_null, error) -> i64`
pub type IntFn =
    unsafe extern "C" fn(*mut UdfInit, *mut UdfArgs, *mut c_uchar, *mut c_uchar) -> c_longlong;

/// `f_clear(initid, is_null, error)`
pub type ClearFn = unsafe extern "C" fn(*mut UdfInit, *mut c_uchar, *mut c_uchar);

/// `f_add(initid, args, is_null, error)`
pub type AddFn = unsafe extern "C" fn(*mut UdfInit, *mut UdfArgs, *mut c_uchar, *mut c_uchar);

/// The evaluation entry point, tagged by the declared return type.
#[derive(Debug, Clone, Copy)]
pub enum MainFn {
    String(StringFn),
    Real(RealFn),
    Int(IntFn),
    Decimal(StringFn),
}

/// Entry points only aggregates have.
#[derive(Debug, Clone, Copy)]
pub struct AggregateFns {
    pub clear: ClearFn,
    pub add: AddFn,
}

/// Everything resolved for one function.
///
/// The pointers are only valid while the library they came from stays open;
/// descriptors keep that library alive for as long as they exist.
#[derive(Debug, Clone, Copy)]
pub struct EntryPoints {
    pub main: MainFn,
    pub init: Option<InitFn>,
    pub deinit: Option<DeinitFn>,
    /// Present exactly when the function is an aggregate.
    pub aggregate: Option<AggregateFns>,
    /// Bound without any `_init`/`_deinit` because the policy allowed it.
    pub suspicious: bool,
}
