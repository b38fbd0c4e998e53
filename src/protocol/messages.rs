//! Message and event types
//!
//! This module defines the message structures exchanged with a managed client
//! and the notification payloads it raises.

use crate::error::RxMqttError;
use crate::transport::ClientError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub use rumqttc::v5::mqttbytes::QoS;

/// An MQTT application message
///
/// # Examples
/// ```
/// use rxmqtt::protocol::{MqttMessage, QoS};
///
/// let message = MqttMessage::new("sensors/kitchen/temperature", "21.5")
///     .with_qos(QoS::AtLeastOnce)
///     .with_retain(true);
///
/// assert_eq!(message.topic, "sensors/kitchen/temperature");
/// assert_eq!(message.payload_str(), Some("21.5"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl MqttMessage {
    /// Create a QoS 0, non-retained message
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// A message queued with a managed client, tagged with a unique identity
///
/// The identity correlates the message with the processed or skipped
/// notification the client raises for it later.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedMessage {
    pub id: Uuid,
    pub message: MqttMessage,
}

impl ManagedMessage {
    pub fn new(message: MqttMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
        }
    }
}

impl From<MqttMessage> for ManagedMessage {
    fn from(message: MqttMessage) -> Self {
        Self::new(message)
    }
}

/// An inbound message delivered by a managed client
///
/// Clones share one "handled" flag. When two overlapping topic filters are
/// connected, the flag makes sure a single physical message reaches only the
/// first filter that claims it.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub client_id: String,
    pub message: MqttMessage,
    pub received_at: DateTime<Utc>,
    handled: Arc<AtomicBool>,
}

impl ReceivedMessage {
    pub fn new(client_id: impl Into<String>, message: MqttMessage) -> Self {
        Self {
            client_id: client_id.into(),
            message,
            received_at: Utc::now(),
            handled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.message.topic
    }

    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Acquire)
    }

    /// Mark the message handled; true only for the first caller
    pub fn try_claim(&self) -> bool {
        self.handled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A topic filter together with the QoS to subscribe with
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSubscription {
    pub topic: String,
    pub qos: QoS,
}

impl TopicSubscription {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// Raised when the client has (re)connected to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedEvent {
    pub session_present: bool,
    pub timestamp: DateTime<Utc>,
}

impl ConnectedEvent {
    pub fn new(session_present: bool) -> Self {
        Self {
            session_present,
            timestamp: Utc::now(),
        }
    }
}

/// Raised when the connection to the broker was lost or closed
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectedEvent {
    pub client_was_connected: bool,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DisconnectedEvent {
    pub fn new(client_was_connected: bool, reason: Option<String>) -> Self {
        Self {
            client_was_connected,
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// Raised when connecting or re-synchronising subscriptions failed
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessFailedEvent {
    pub error: ClientError,
    pub timestamp: DateTime<Utc>,
}

impl ProcessFailedEvent {
    pub fn new(error: ClientError) -> Self {
        Self {
            error,
            timestamp: Utc::now(),
        }
    }
}

/// Raised once a queued message has been handed to the MQTT connection, or
/// failed to be
///
/// Success means the publish request was accepted for sending. It is not a
/// broker acknowledgement: no PUBACK or PUBCOMP has been seen at that point,
/// whatever the message QoS. Messages still queued when the client stops are
/// reported as failed.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageProcessedEvent {
    pub message: ManagedMessage,
    pub error: Option<ClientError>,
}

impl MessageProcessedEvent {
    pub fn succeeded(message: ManagedMessage) -> Self {
        Self {
            message,
            error: None,
        }
    }

    pub fn failed(message: ManagedMessage, error: ClientError) -> Self {
        Self {
            message,
            error: Some(error),
        }
    }

    pub fn has_succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Raised when a message was dropped because the pending queue was full
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSkippedEvent {
    pub message: ManagedMessage,
}

/// Outcome category of a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReasonCode {
    /// Message handed to the MQTT connection; not a broker acknowledgement
    HasSucceeded,
    /// Message not published, the client was not connected
    ClientNotConnected,
    /// Message not published, the publish failed
    HasFailed,
    /// Message not published, it was dropped due to queue overflow
    HasSkipped,
}

/// Result of publishing one message from a stream
///
/// Produced exactly once per input message and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub reason_code: PublishReasonCode,
    pub message: ManagedMessage,
    pub error: Option<RxMqttError>,
}

impl PublishResult {
    pub fn succeeded(message: ManagedMessage) -> Self {
        Self {
            reason_code: PublishReasonCode::HasSucceeded,
            message,
            error: None,
        }
    }

    pub fn not_connected(message: ManagedMessage) -> Self {
        Self {
            reason_code: PublishReasonCode::ClientNotConnected,
            message,
            error: None,
        }
    }

    pub fn failed(message: ManagedMessage, error: RxMqttError) -> Self {
        Self {
            reason_code: PublishReasonCode::HasFailed,
            message,
            error: Some(error),
        }
    }

    pub fn skipped(message: ManagedMessage) -> Self {
        Self {
            reason_code: PublishReasonCode::HasSkipped,
            message,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.reason_code == PublishReasonCode::HasSucceeded
    }
}

impl From<MessageProcessedEvent> for PublishResult {
    fn from(event: MessageProcessedEvent) -> Self {
        match event.error {
            None => PublishResult::succeeded(event.message),
            Some(error) => PublishResult::failed(event.message, RxMqttError::Client(error)),
        }
    }
}

impl From<MessageSkippedEvent> for PublishResult {
    fn from(event: MessageSkippedEvent) -> Self {
        PublishResult::skipped(event.message)
    }
}
