//! Error types for the controller metadata core
//!
//! Provides one structured error type for the access gate, the transactional
//! object protocol, the identifier allocators and the entity graph.

use crate::security::AccessType;
use thiserror::Error;

/// Unified error type for the metadata core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Access Gate
    // =========================================================================
    #[error("Access denied: {requested} access to {object}")]
    AccessDenied { object: String, requested: AccessType },

    #[error("Access to deleted object: {object}")]
    AccessToDeletedData { object: String },

    // =========================================================================
    // Entity Graph
    // =========================================================================
    #[error("Object already exists: {kind} {name}")]
    DataAlreadyExists { kind: String, name: String },

    #[error("Object not found: {kind} {name}")]
    NotFound { kind: String, name: String },

    #[error("Object in use: {object} - {reason}")]
    InUse { object: String, reason: String },

    // =========================================================================
    // Validation
    // =========================================================================
    #[error("Invalid {kind} '{name}': {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("{kind} value {value} is out of range [{min}, {max}]")]
    ValueOutOfRange {
        kind: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("{kind} value {value} is already in use")]
    ValueInUse { kind: &'static str, value: i64 },

    #[error("Volume size {size_kib} KiB is below the minimum of {min_kib} KiB")]
    VolumeSizeTooLow { size_kib: u64, min_kib: u64 },

    #[error("Volume size {size_kib} KiB exceeds the maximum of {max_kib} KiB")]
    VolumeSizeTooHigh { size_kib: u64, max_kib: u64 },

    // =========================================================================
    // Identifier Allocation
    // =========================================================================
    #[error("Number pool '{pool}' exhausted: no free value in [{start}, {end}]")]
    ExhaustedPool { pool: String, start: i32, end: i32 },

    // =========================================================================
    // Transactions & Persistence
    // =========================================================================
    #[error("Mutation attempted without an active transaction")]
    NoActiveTransaction,

    #[error("Persistence error: {0}")]
    Persistence(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Implementation error: {0}")]
    Implementation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an error, used to decide how a caller reacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected by the access gate, no state was touched
    Authorization,
    /// A reference to a deleted object was used
    StaleAccess,
    /// The object to create already exists
    Uniqueness,
    /// No free identifier left in a number pool
    PoolExhausted,
    /// An invariant maintained by this crate was violated
    Internal,
    /// Caller supplied an invalid value
    Validation,
    /// Backing store failed
    Persistence,
    /// Invalid configuration
    Configuration,
}

impl Error {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::AccessDenied { .. } => ErrorCategory::Authorization,
            Error::AccessToDeletedData { .. } => ErrorCategory::StaleAccess,
            Error::DataAlreadyExists { .. } => ErrorCategory::Uniqueness,
            Error::ExhaustedPool { .. } => ErrorCategory::PoolExhausted,

            Error::Implementation(_) | Error::NoActiveTransaction => ErrorCategory::Internal,

            Error::NotFound { .. }
            | Error::InUse { .. }
            | Error::InvalidName { .. }
            | Error::ValueOutOfRange { .. }
            | Error::ValueInUse { .. }
            | Error::VolumeSizeTooLow { .. }
            | Error::VolumeSizeTooHigh { .. } => ErrorCategory::Validation,

            Error::Persistence(_) | Error::Io(_) => ErrorCategory::Persistence,

            Error::Configuration(_) | Error::YamlParse(_) | Error::JsonParse(_) => {
                ErrorCategory::Configuration
            }
        }
    }

    /// Check if this error points at a bug in the calling code
    pub fn is_caller_bug(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::StaleAccess | ErrorCategory::Internal
        )
    }

    /// Check if this error must abort the current operation and be logged
    /// with full context
    pub fn is_fatal(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }

    pub(crate) fn implementation(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(error = %msg, "internal consistency violation");
        Error::Implementation(msg)
    }

    pub(crate) fn not_found(kind: impl Into<String>, name: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.to_string(),
        }
    }

    pub(crate) fn already_exists(kind: impl Into<String>, name: impl std::fmt::Display) -> Self {
        Error::DataAlreadyExists {
            kind: kind.into(),
            name: name.to_string(),
        }
    }
}

/// Result type alias for the metadata core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = Error::AccessDenied {
            object: "Node: 'alpha'".into(),
            requested: AccessType::Change,
        };
        assert_eq!(err.category(), ErrorCategory::Authorization);
        assert!(!err.is_fatal());

        let err = Error::ExhaustedPool {
            pool: "minor".into(),
            start: 1000,
            end: 1001,
        };
        assert_eq!(err.category(), ErrorCategory::PoolExhausted);

        let err = Error::VolumeSizeTooLow {
            size_kib: 1,
            min_kib: 4,
        };
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_error_caller_bug() {
        let stale = Error::AccessToDeletedData {
            object: "Resource".into(),
        };
        assert!(stale.is_caller_bug());
        assert!(!stale.is_fatal());

        let internal = Error::Implementation("volume still reserved".into());
        assert!(internal.is_caller_bug());
        assert!(internal.is_fatal());

        let dup = Error::DataAlreadyExists {
            kind: "Node".into(),
            name: "alpha".into(),
        };
        assert!(!dup.is_caller_bug());
    }

    #[test]
    fn test_error_display() {
        let err = Error::AccessDenied {
            object: "Node: 'alpha'".into(),
            requested: AccessType::Control,
        };
        assert_eq!(err.to_string(), "Access denied: CONTROL access to Node: 'alpha'");
    }
}
