//! Registry for native user-defined functions.
//!
//! Lets a query engine call functions exported by dynamically loaded
//! extension libraries as if they were built in. Libraries are opened once
//! per path and shared, functions are reference counted while callers use
//! them, and create/drop are kept consistent with a durable catalog.

pub mod abi;
pub mod catalog;
pub mod config;
pub mod error;
pub mod library;
pub mod policy;
pub mod registry;
pub mod symbols;
pub mod sync;
pub mod types;

pub use catalog::{Catalog, CatalogError, MemoryCatalog, MemoryTransaction, Transaction};
pub use config::UdfConfig;
pub use error::{Result, UdfError};
pub use library::{LibraryHandle, LibraryLoader, LibraryManager, NativeLibrary};
pub use registry::{FunctionDescriptor, FunctionGuard, FunctionId, FunctionRegistry, Visibility};
pub use symbols::SymbolResolver;
pub use sync::{CatalogSync, ScanReport};
pub use types::{FunctionDefinition, FunctionKind, ReturnType};
