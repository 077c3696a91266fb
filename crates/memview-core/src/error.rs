//! Error types for the memory view core.

use crate::types::Address;

/// Memory view errors.
#[derive(Debug, thiserror::Error)]
pub enum MemviewError {
    /// Address lies outside the document window.
    #[error("address {addr:#x} outside window {base:#x}..{end:#x}")]
    OutOfRange {
        addr: Address,
        base: Address,
        end: Address,
    },

    /// Address below the cache base produced a negative slot.
    #[error("invalid slot for address {addr:#x} (base {base:#x})")]
    InvalidSlot { addr: Address, base: Address },

    /// Strict write into a page that is not loaded.
    #[error("address {addr:#x} not loaded: base {base:#x}, loaded up to {loaded_end:#x}")]
    OutOfBounds {
        addr: Address,
        base: Address,
        loaded_end: Address,
    },

    /// Remote read failed.
    #[error("memory read failed at {addr:#x}: {message}")]
    FetchFailed { addr: Address, message: String },

    /// Remote write or evaluate failed.
    #[error("write failed for {expr}: {message}")]
    WriteFailed { expr: String, message: String },

    /// Document is readonly.
    #[error("document is readonly: {doc_id}")]
    ReadOnly { doc_id: String },

    /// Document not owned by the registry.
    #[error("document not found: {doc_id}")]
    DocumentNotFound { doc_id: String },

    /// Transfer descriptor could not be interpreted.
    #[error("invalid descriptor: {message}")]
    InvalidDescriptor { message: String },

    /// Snapshot file error.
    #[error("snapshot error: {message}")]
    Snapshot { message: String },

    /// Writing an export failed.
    #[error("export error: {message}")]
    Export { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl MemviewError {
    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            // Bad input
            Self::DocumentNotFound { .. } => 1,
            Self::InvalidDescriptor { .. } => 1,
            Self::Config { .. } => 1,
            Self::OutOfRange { .. } => 1,
            Self::ReadOnly { .. } => 1,

            // Remote failures
            Self::FetchFailed { .. } => 3,
            Self::WriteFailed { .. } => 3,

            // Invariant violations
            Self::InvalidSlot { .. } => 4,
            Self::OutOfBounds { .. } => 4,

            // Other
            Self::Snapshot { .. } => 2,
            Self::Export { .. } => 2,
        }
    }

    /// Whether the failure is transient and the operation may succeed on a later stop.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::FetchFailed { .. } | Self::WriteFailed { .. })
    }
}

impl From<serde_json::Error> for MemviewError {
    fn from(err: serde_json::Error) -> Self {
        Self::Snapshot {
            message: err.to_string(),
        }
    }
}

/// Result type for memory view operations.
pub type MemviewResult<T> = Result<T, MemviewError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_failures_are_recoverable() {
        let err = MemviewError::FetchFailed {
            addr: 0x1000,
            message: "timeout".to_string(),
        };
        assert!(err.is_recoverable());
        assert_eq!(err.exit_code(), 3);

        let err = MemviewError::InvalidSlot {
            addr: 0x10,
            base: 0x1000,
        };
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "invalid slot for address 0x10 (base 0x1000)");
    }
}
