//! Message types and topic filters
//!
//! This module holds the value types that flow through the adapter: outgoing
//! and received MQTT messages, the notification payloads raised by a managed
//! client, publish results, and the wildcard [`TopicFilter`].

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
