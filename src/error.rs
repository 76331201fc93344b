//! Top-level error types for the tracker service
//!
//! Wraps the per-module error types (config, store, transport) into a single
//! service error so binaries and embedders deal with one failure surface.

use thiserror::Error;

/// Main error type for tracker service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ServiceError {
    /// Wrap a transport-layer error
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(err))
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for tracker service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
