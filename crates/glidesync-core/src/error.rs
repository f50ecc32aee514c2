//! Error types for glidesync

use thiserror::Error;

/// Core error type for glidesync operations
#[derive(Error, Debug)]
pub enum GlideError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("User {user} is not authorised for {method} {url}")]
    Unauthorised {
        user: String,
        method: String,
        url: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Cannot coerce {column}: {reason}")]
    Coercion { column: String, reason: String },

    #[error("Plan error: {0}")]
    Plan(String),

    #[error("Query matches {count} rows, over the {limit} row limit")]
    Quota { count: u64, limit: u64 },

    #[error("{0}")]
    Operational(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GlideError {
    /// Shorthand for a coercion failure on a named column.
    pub fn coercion(column: impl Into<String>, reason: impl Into<String>) -> Self {
        GlideError::Coercion {
            column: column.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for glidesync operations
pub type Result<T> = std::result::Result<T, GlideError>;
