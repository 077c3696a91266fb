//! Defaults for new documents and cache behaviour.

use serde::{Deserialize, Serialize};

use crate::types::{CellFormat, Endian};

/// Memory view configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemviewConfig {
    /// Size expression given to new views.
    #[serde(default = "default_size_expr")]
    pub default_size_expr: String,

    /// Window size used until the size expression resolves.
    #[serde(default = "default_max_bytes")]
    pub default_max_bytes: u64,

    /// Cell format for new views.
    #[serde(default)]
    pub default_format: CellFormat,

    /// Byte order for new views.
    #[serde(default)]
    pub default_endian: Endian,

    /// Columns per row for new views.
    #[serde(default = "default_columns")]
    pub default_columns: u32,

    /// Surface writes into unloaded pages as errors.
    #[serde(default)]
    pub strict: bool,
}

pub(crate) fn default_size_expr() -> String {
    "4 * 1024 * 1024".to_string()
}

pub(crate) fn default_max_bytes() -> u64 {
    4 * 1024 * 1024
}

pub(crate) fn default_columns() -> u32 {
    4
}

impl Default for MemviewConfig {
    fn default() -> Self {
        Self {
            default_size_expr: default_size_expr(),
            default_max_bytes: default_max_bytes(),
            default_format: CellFormat::default(),
            default_endian: Endian::default(),
            default_columns: default_columns(),
            strict: false,
        }
    }
}

impl MemviewConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `MEMVIEW_DEFAULT_SIZE_EXPR` | Size expression for new views |
    /// | `MEMVIEW_DEFAULT_MAX_BYTES` | Window size before resolution |
    /// | `MEMVIEW_DEFAULT_FORMAT` | Cell format (`1-byte` .. `8-byte`) |
    /// | `MEMVIEW_DEFAULT_COLUMNS` | Columns per row |
    /// | `MEMVIEW_STRICT` | Strict cache writes |
    pub fn from_env() -> Self {
        Self {
            default_size_expr: std::env::var("MEMVIEW_DEFAULT_SIZE_EXPR")
                .unwrap_or_else(|_| default_size_expr()),
            default_max_bytes: std::env::var("MEMVIEW_DEFAULT_MAX_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_bytes),
            default_format: std::env::var("MEMVIEW_DEFAULT_FORMAT")
                .ok()
                .and_then(|v| CellFormat::parse(&v))
                .unwrap_or_default(),
            default_endian: Endian::default(),
            default_columns: std::env::var("MEMVIEW_DEFAULT_COLUMNS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_columns),
            strict: std::env::var("MEMVIEW_STRICT")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Enable strict cache writes.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set the default cell format.
    pub fn with_format(mut self, format: CellFormat) -> Self {
        self.default_format = format;
        self
    }

    /// Set the default column count.
    pub fn with_columns(mut self, columns: u32) -> Self {
        self.default_columns = columns;
        self
    }
}
