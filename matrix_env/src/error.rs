//! Error types for the environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Delivery failed (channel closed, topic not joined, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Payload serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Durable storage failed
    #[error("Storage error: {0}")]
    StorageError(String),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a storage error.
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Self::StorageError(msg.to_string())
    }
}
