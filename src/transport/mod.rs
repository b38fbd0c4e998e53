//! Managed client seam
//!
//! The stream adapter never talks to the network itself. Everything it needs
//! from an MQTT client (subscribe, unsubscribe, a queued publish path and a set
//! of notification hooks) is captured by the [`ManagedClient`] trait, which
//! enables dependency injection and testing with
//! [`crate::testing::MockManagedClient`].

use crate::config::ManagedClientOptions;
use crate::protocol::{ManagedMessage, MqttMessage, TopicSubscription};
use thiserror::Error;

pub mod handlers;
pub mod mqtt;

pub use handlers::{ClientHandlers, Handler, HandlerSlot};

/// Errors reported by a managed client
///
/// Cloneable so a single failure can be fanned out to every consumer of a
/// shared topic stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Client has been disposed")]
    Disposed,
    #[error("Client is not connected")]
    NotConnected,
    #[error("Client has not been started")]
    NotStarted,
    #[error("Client has already been started")]
    AlreadyStarted,
    #[error("Invalid client options: {0}")]
    InvalidOptions(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Handler registration failed for {0}")]
    HandlerRegistration(&'static str),
}

impl ClientError {
    /// Whether this error only reports that the client was already torn down
    pub fn is_disposed(&self) -> bool {
        matches!(self, ClientError::Disposed)
    }
}

/// Capability set of a managed MQTT client
///
/// A managed client owns the connection, reconnects on its own, keeps track of
/// subscriptions across reconnects and queues outgoing messages. Notifications
/// are delivered through the single-slot handlers returned by
/// [`ManagedClient::handlers`].
#[async_trait::async_trait]
pub trait ManagedClient: Send + Sync {
    /// Notification hooks, one slot per event kind
    fn handlers(&self) -> &ClientHandlers;

    /// Add topic filters to the managed subscription set
    async fn subscribe(&self, topics: &[TopicSubscription]) -> Result<(), ClientError>;

    /// Remove topics from the managed subscription set
    async fn unsubscribe(&self, topics: &[String]) -> Result<(), ClientError>;

    /// Queue a message; its outcome is reported via the processed or skipped hooks
    async fn enqueue(&self, message: ManagedMessage) -> Result<(), ClientError>;

    /// Publish a message immediately, bypassing the queue
    async fn publish(&self, message: MqttMessage) -> Result<(), ClientError>;

    /// Check broker liveness
    async fn ping(&self) -> Result<(), ClientError>;

    /// Start the client with the given options
    async fn start(&self, options: ManagedClientOptions) -> Result<(), ClientError>;

    /// Stop the client, keeping it reusable
    async fn stop(&self) -> Result<(), ClientError>;

    /// Tear the client down; every later call fails with [`ClientError::Disposed`]
    fn dispose(&self);

    fn is_connected(&self) -> bool;

    fn is_started(&self) -> bool;

    fn options(&self) -> Option<ManagedClientOptions>;

    fn pending_message_count(&self) -> usize;
}
