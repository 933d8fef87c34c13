//! WolfLite Error Types

use thiserror::Error;

use crate::txlog::Position;

/// Result type alias for WolfLite operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfLite error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Transaction log errors
    #[error("Log error: {0}")]
    Log(String),

    #[error("Log record corrupted at position {position}: {reason}")]
    LogCorrupted { position: Position, reason: String },

    #[error("Log serialization error: {0}")]
    LogSerialization(#[from] bincode::Error),

    #[error("Out of order append to {database}: expected position {expected}, got {got}")]
    OutOfOrder {
        database: String,
        expected: Position,
        got: Position,
    },

    #[error("Position {position} of {database} is no longer retained (retained minimum {retained_min})")]
    PositionExpired {
        database: String,
        position: Position,
        retained_min: Position,
    },

    // Database errors
    #[error("Invalid database name: {0:?}")]
    InvalidDatabaseName(String),

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    // Replication errors
    #[error("Replication gap in {database}: expected position {expected}, received {received}")]
    Gap {
        database: String,
        expected: Position,
        received: Position,
    },

    #[error("Checksum mismatch in {database} at position {position}: {reason}")]
    ChecksumMismatch {
        database: String,
        position: Position,
        reason: String,
    },

    #[error("Commit delivered to {database} while node is not primary")]
    NotPrimary { database: String },

    #[error("No primary available")]
    NoPrimary,

    #[error("Replication error: {0}")]
    Replication(String),

    // Lease errors
    #[error("Lease service unavailable: {0}")]
    LeaseUnavailable(String),

    #[error("Lease already held by {holder}")]
    LeaseHeld { holder: String },

    #[error("Lease lost")]
    LeaseLost,

    #[error("Lease expired locally before renewal completed")]
    LeaseExpired,

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LeaseUnavailable(_)
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Http(_)
                | Error::NoPrimary
        )
    }

    /// Check if this error indicates a correctness hazard that must be
    /// surfaced to the operator rather than retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::NotPrimary { .. } | Error::LogCorrupted { .. } | Error::OutOfOrder { .. }
        )
    }

    /// Check if this error means the replica must resynchronize the database
    /// from a full snapshot instead of applying incrementally
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            Error::Gap { .. } | Error::ChecksumMismatch { .. } | Error::PositionExpired { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let gap = Error::Gap {
            database: "db".into(),
            expected: 4,
            received: 6,
        };
        assert!(gap.requires_resync());
        assert!(!gap.is_retryable());

        let not_primary = Error::NotPrimary {
            database: "db".into(),
        };
        assert!(not_primary.is_fatal());
        assert!(!not_primary.requires_resync());

        assert!(Error::LeaseUnavailable("timeout".into()).is_retryable());
        assert!(!Error::LeaseLost.is_retryable());
    }
}
