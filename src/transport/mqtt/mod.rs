//! rumqttc-backed managed client
//!
//! The module separates pure functions from I/O:
//!
//! - [`connection`] - Pure option and broker URL handling
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`client`] - Background tasks and the [`ManagedClient`](crate::transport::ManagedClient) implementation
//!
//! # Usage
//!
//! ```rust,no_run
//! use rxmqtt::config::ManagedClientOptions;
//! use rxmqtt::transport::mqtt::MqttManagedClient;
//! use rxmqtt::transport::ManagedClient;
//!
//! # tokio_test::block_on(async {
//! let client = MqttManagedClient::new();
//! client
//!     .start(ManagedClientOptions::new("mqtt://localhost:1883", "my-client"))
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttManagedClient;
pub use connection::{configure_mqtt_options, parse_broker_url, BrokerAddress};
pub use message_handler::{route_mqtt_event, EventRoute};
