//! Error types for the gateway runtime.

use thiserror::Error;

use crate::config::ConfigError;
use crate::document::DocumentError;
use crate::master::MasterError;

/// Result type alias using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors raised by the gateway's long-running components.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Gateway settings error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Device document error.
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Serial master error.
    #[error(transparent)]
    Master(#[from] MasterError),

    /// Token could not be issued.
    #[error("Credential error: {0}")]
    Credential(String),

    /// Cloud connection could not be established.
    #[error("Cloud connection error: {0}")]
    Connection(String),

    /// Subscribe failed on an established connection.
    #[error("Failed to subscribe to {topic}: {message}")]
    Subscribe { topic: String, message: String },

    /// Publish failed on an established connection.
    #[error("Failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },

    /// A service failed to stop or start.
    #[error("Service {service} failed: {message}")]
    Service { service: String, message: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] fieldlink_common::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a credential error.
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential(msg.into())
    }

    /// Create a service error.
    pub fn service(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Service {
            service: service.into(),
            message: msg.into(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for GatewayError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Credential(err.to_string())
    }
}
