//! rxmqtt - stream-based MQTT client
//!
//! Wraps a managed MQTT client (one that owns reconnects, tracks subscriptions
//! and queues outgoing messages) and exposes it through `futures` streams.
//!
//! # Overview
//!
//! - [`rx::RxMqttClient::connect`] returns a stream of messages for a topic
//!   filter. Any number of streams for the same topic share one underlying
//!   subscription, which is released once the last stream is dropped.
//! - [`rx::RxMqttClient::publish`] turns a stream of outgoing messages into a
//!   stream of [`protocol::PublishResult`]s, one per message.
//! - Client notifications (connected, disconnected, processed, skipped, ...)
//!   are multicast streams.
//! - [`protocol::TopicFilter`] implements MQTT `+` and `#` wildcard matching.
//! - [`transport::mqtt::MqttManagedClient`] is a rumqttc-backed managed client.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use futures::{stream, StreamExt};
//! use rxmqtt::config::ManagedClientOptions;
//! use rxmqtt::protocol::MqttMessage;
//! use rxmqtt::rx::{MessageStreamExt, PublishExt, RxMqttClient};
//!
//! # tokio_test::block_on(async {
//! rxmqtt::observability::init_default_logging();
//!
//! let client = RxMqttClient::mqtt();
//! client
//!     .start(ManagedClientOptions::new("mqtt://localhost:1883", "quick-start"))
//!     .await?;
//!
//! let mut greetings = client.connect("greetings/+")?.select_payload_string(true);
//!
//! let results: Vec<_> = stream::iter(vec![MqttMessage::new("greetings/en", "hello")])
//!     .publish_on(&client)
//!     .collect()
//!     .await;
//! assert_eq!(results.len(), 1);
//!
//! if let Some(greeting) = greetings.next().await {
//!     println!("{}", greeting?);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod rx;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ManagedClientOptions};
pub use error::{RxMqttError, RxMqttResult};
pub use protocol::{
    ManagedMessage, MqttMessage, PublishReasonCode, PublishResult, QoS, ReceivedMessage,
    TopicFilter,
};
pub use rx::{MessageStreamExt, PublishExt, RxMqttClient, TopicStream};
pub use transport::{ClientError, ManagedClient};
