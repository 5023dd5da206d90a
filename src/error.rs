// src/error.rs

//! Unified error handling for the changelog pipeline.

use std::fmt;

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// AWS S3 error
    #[error("S3 error: {0}")]
    S3(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be built or a request failed outside a fetch
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Registry unreachable, timed out or rate limited
    #[error("Transient fetch error from {registry}: {message}")]
    TransientFetch { registry: String, message: String },

    /// Package gone or registry response unusable
    #[error("Permanent fetch error from {registry}: {message}")]
    PermanentFetch { registry: String, message: String },

    /// A concurrent writer kept winning the conditional write race
    #[error("Store contention on {identity} after {attempts} attempts")]
    StoreContention { identity: String, attempts: u32 },

    /// The dispatch bus gave up on a message
    #[error("Dispatch delivery failed for {identity} after {attempts} attempts: {message}")]
    DispatchDelivery {
        identity: String,
        attempts: u32,
        message: String,
    },
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a transient fetch error.
    pub fn transient(registry: impl fmt::Display, message: impl fmt::Display) -> Self {
        Self::TransientFetch {
            registry: registry.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a permanent fetch error.
    pub fn permanent(registry: impl fmt::Display, message: impl fmt::Display) -> Self {
        Self::PermanentFetch {
            registry: registry.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a dispatch delivery error.
    pub fn delivery(identity: impl fmt::Display, attempts: u32, message: impl fmt::Display) -> Self {
        Self::DispatchDelivery {
            identity: identity.to_string(),
            attempts,
            message: message.to_string(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFetch { .. })
    }
}
