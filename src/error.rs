//! Error types for the stream adapter
//!
//! Argument errors are raised synchronously at the call boundary. Everything
//! else travels inside streams, which is why [`RxMqttError`] is cheap to clone:
//! one subscribe failure is delivered to every consumer attached to the topic.

use crate::transport::ClientError;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for stream adapter operations
#[derive(Debug, Clone, Error)]
pub enum RxMqttError {
    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("Client has been disposed")]
    Disposed,

    #[error("Subscribing to '{topic}' failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: ClientError,
    },

    #[error("Registering the {event} handler failed: {source}")]
    Registration {
        event: &'static str,
        #[source]
        source: ClientError,
    },

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Payload transform failed: {0}")]
    Transform(Arc<dyn std::error::Error + Send + Sync>),
}

impl RxMqttError {
    /// Create invalid argument error
    pub fn invalid_argument<S: Into<String>>(name: &'static str, reason: S) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    /// Create payload transform error
    pub fn transform<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Transform(Arc::from(error.into()))
    }

    /// Whether the error only reports disposal of the client
    pub fn is_disposed(&self) -> bool {
        match self {
            RxMqttError::Disposed => true,
            RxMqttError::Client(error)
            | RxMqttError::Subscribe { source: error, .. }
            | RxMqttError::Registration { source: error, .. } => error.is_disposed(),
            _ => false,
        }
    }
}

/// Result type for stream adapter operations
pub type RxMqttResult<T> = Result<T, RxMqttError>;
