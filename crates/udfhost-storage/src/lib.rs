//! Durable function catalog for udfhost.
//!
//! Stores one row per registered function in a redb database and plugs into
//! [`udfhost_core::CatalogSync`] as its catalog and transaction collaborator.

pub mod error;
pub mod functions;

pub use error::{Error, Result};
pub use functions::{FunctionRecord, FunctionStore, StoreTransaction};
