//! Function definitions as stored in the catalog.

use serde::{Deserialize, Serialize};

/// How the engine drives a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    /// One call per row.
    #[default]
    Scalar,
    /// Accumulates rows through `_clear`/`_add` and yields one value per group.
    Aggregate,
}

impl FunctionKind {
    /// Stable numeric code used in persisted rows.
    pub fn code(self) -> u8 {
        match self {
            FunctionKind::Scalar => 1,
            FunctionKind::Aggregate => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FunctionKind::Scalar),
            2 => Some(FunctionKind::Aggregate),
            _ => None,
        }
    }
}

impl std::fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionKind::Scalar => write!(f, "function"),
            FunctionKind::Aggregate => write!(f, "aggregate"),
        }
    }
}

/// SQL result type a function returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    String,
    Real,
    Int,
    Decimal,
}

impl ReturnType {
    /// Stable numeric code used in persisted rows.
    pub fn code(self) -> u8 {
        match self {
            ReturnType::String => 0,
            ReturnType::Real => 1,
            ReturnType::Int => 2,
            ReturnType::Decimal => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ReturnType::String),
            1 => Some(ReturnType::Real),
            2 => Some(ReturnType::Int),
            4 => Some(ReturnType::Decimal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReturnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReturnType::String => "string",
            ReturnType::Real => "real",
            ReturnType::Int => "integer",
            ReturnType::Decimal => "decimal",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ReturnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Ok(ReturnType::String),
            "real" => Ok(ReturnType::Real),
            "int" | "integer" => Ok(ReturnType::Int),
            "decimal" => Ok(ReturnType::Decimal),
            other => Err(format!("unknown return type: {}", other)),
        }
    }
}

/// One row of the function catalog: everything needed to bind a function
/// again after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Declared name, also the entry-point symbol.
    pub name: String,
    pub return_type: ReturnType,
    /// Library file, relative to the plugin directory.
    pub library_path: String,
    /// Rows written before aggregates existed carry no kind.
    #[serde(default)]
    pub kind: FunctionKind,
}

impl FunctionDefinition {
    pub fn new(
        name: impl Into<String>,
        kind: FunctionKind,
        return_type: ReturnType,
        library_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            return_type,
            library_path: library_path.into(),
            kind,
        }
    }

    pub fn scalar(
        name: impl Into<String>,
        return_type: ReturnType,
        library_path: impl Into<String>,
    ) -> Self {
        Self::new(name, FunctionKind::Scalar, return_type, library_path)
    }

    pub fn aggregate(
        name: impl Into<String>,
        return_type: ReturnType,
        library_path: impl Into<String>,
    ) -> Self {
        Self::new(name, FunctionKind::Aggregate, return_type, library_path)
    }

    /// Case-folded name used as the lookup key everywhere.
    pub fn key(&self) -> String {
        name_key(&self.name)
    }
}

/// Function names compare case-insensitively.
pub fn name_key(name: &str) -> String {
    name.to_lowercase()
}
