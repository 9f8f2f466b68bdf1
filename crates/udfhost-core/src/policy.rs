//! Path and identifier checks consulted before any library is opened or any
//! function is registered.

use crate::config::DEFAULT_MAX_NAME_CHARS;

/// Decides whether a catalog library path may be opened.
pub trait PathValidator: Send + Sync {
    fn is_allowed_path(&self, path: &str) -> bool;
}

/// Decides whether a function name is an acceptable identifier.
pub trait NameValidator: Send + Sync {
    fn is_valid_name(&self, name: &str) -> bool;
}

impl<F> PathValidator for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_allowed_path(&self, path: &str) -> bool {
        self(path)
    }
}

impl<F> NameValidator for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_valid_name(&self, name: &str) -> bool {
        self(name)
    }
}

/// Library paths are bare file names inside the plugin directory.
///
/// Any directory separator is refused, so nothing can be reached outside
/// the plugin directory, not even a subdirectory of it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginDirPolicy;

impl PathValidator for PluginDirPolicy {
    fn is_allowed_path(&self, path: &str) -> bool {
        !path.is_empty()
            && path != "."
            && path != ".."
            && !path.contains(&['/', '\\', '\0'][..])
    }
}

/// Non-empty names of bounded length without NUL bytes.
#[derive(Debug, Clone, Copy)]
pub struct IdentifierPolicy {
    max_chars: usize,
}

impl IdentifierPolicy {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }
}

impl Default for IdentifierPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NAME_CHARS)
    }
}

impl NameValidator for IdentifierPolicy {
    fn is_valid_name(&self, name: &str) -> bool {
        !name.is_empty()
            && name.chars().count() <= self.max_chars
            && !name.contains('\0')
            && !name.ends_with(' ')
    }
}
