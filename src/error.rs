//! Top-level error type for iotlink operations
//!
//! Each layer keeps its own error enum; `IotError` wraps them so the role
//! entry points and binaries can use a single `?`-friendly result type.

use crate::config::ConfigError;
use crate::protocol::{ProtocolError, TopicError, ValidationError};
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Main error type for device and coordinator operations
#[derive(Debug, Error)]
pub enum IotError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Invalid device id: {0}")]
    InvalidId(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl IotError {
    /// Wrap any transport error; transports are generic so no `From` impl
    pub fn transport<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(error))
    }

    /// Create invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<MqttError> for IotError {
    fn from(error: MqttError) -> Self {
        Self::transport(error)
    }
}

/// Result type for iotlink operations
pub type IotResult<T> = Result<T, IotError>;
