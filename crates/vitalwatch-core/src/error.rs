//! Error types for VitalWatch

use thiserror::Error;

use crate::models::MetricKind;

/// Result type alias using VitalWatch's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for VitalWatch operations
#[derive(Error, Debug)]
pub enum Error {
    /// The user declined access to one or more metrics
    #[error("Authorization denied for {metrics:?}")]
    AuthorizationDenied {
        /// Metrics that were requested when access was refused
        metrics: Vec<MetricKind>,
    },

    /// Query or subscription failure at the data source
    #[error("Data source error: {0}")]
    DataSource(String),

    /// Notification delivery failed
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a data source error
    pub fn data_source(msg: impl Into<String>) -> Self {
        Self::DataSource(msg.into())
    }

    /// Create a dispatch error
    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the failure is expected to clear on the next poll or push event
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DataSource(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
