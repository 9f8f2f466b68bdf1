//! Error types for the function registry.
//!
//! Every failure a create/drop statement can report maps to exactly one
//! variant, carrying enough context (function, symbol or loader message) to
//! diagnose it without looking at registry internals.

use crate::catalog::CatalogError;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, UdfError>;

/// Errors raised while loading, resolving or registering functions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UdfError {
    /// The library path escapes the plugin directory or is malformed.
    #[error("No paths allowed for shared library: {0}")]
    InvalidPath(String),

    /// The function name fails the identifier policy.
    #[error("Invalid function name: {0}")]
    InvalidName(String),

    /// A visible function with this name is already registered.
    #[error("Function '{0}' already exists")]
    DuplicateName(String),

    /// The platform loader refused the library.
    #[error("Can't open shared library '{path}': {message}")]
    LibraryLoad { path: String, message: String },

    /// The library does not export the function's entry point.
    #[error("Can't find symbol '{name}' in library")]
    MissingSymbol { name: String },

    /// Neither `_init` nor `_deinit` was found next to the entry point.
    #[error("Can't find symbol '{name}_init' or '{name}_deinit' in library; refusing a suspicious binding")]
    SuspiciousBinding { name: String },

    /// An aggregate function lacks its `_clear` or `_add` symbol.
    #[error("Can't find aggregate symbol '{name}' in library")]
    AggregateMissingAuxSymbol { name: String },

    /// No function is registered under this name.
    #[error("Function '{0}' is not defined")]
    FunctionNotFound(String),

    /// The catalog collaborator failed to read or write a row.
    #[error("Error writing function catalog: {0}")]
    Persistence(#[from] CatalogError),

    /// The surrounding transaction was rolled back.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// Configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl UdfError {
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName(name.into())
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self::FunctionNotFound(name.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error came out of loading or resolving a library, as
    /// opposed to validation or persistence.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::LibraryLoad { .. }
                | Self::MissingSymbol { .. }
                | Self::SuspiciousBinding { .. }
                | Self::AggregateMissingAuxSymbol { .. }
        )
    }
}
