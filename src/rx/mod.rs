//! Stream adapter over a managed MQTT client
//!
//! - [`event_bridge`] - Single-slot handlers as multicast streams
//! - [`client`] - [`RxMqttClient`] and the topic subscription multiplexer
//! - [`publish`] - Publish correlation into [`PublishResult`](crate::protocol::PublishResult)s
//! - [`transform`] - Fallible payload projection
//! - [`operators`] - Filtering and projection helpers for message streams

use futures::FutureExt;
use tracing::debug;

pub mod client;
pub mod event_bridge;
pub mod operators;
pub mod publish;
pub mod transform;

pub use client::{RxMqttClient, TopicStream};
pub use event_bridge::{BridgeGuard, EventBridge, EventSink, EventStream};
pub use operators::{utf8_payload, AsMqttMessage, MessageStreamExt};
pub use publish::{PublishExt, PublishStream};
pub use transform::MessageTransform;

/// Run teardown work from a synchronous context
///
/// The work is polled once inline and is usually done by then. Otherwise it
/// moves to the current tokio runtime. Without one, it stays parked with its
/// topic and the next subscription to that topic finishes it first.
pub(crate) fn drive_detached(work: client::TopicWork) {
    if work.clone().now_or_never().is_some() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(work);
        }
        Err(_) => debug!("No tokio runtime available, teardown resumes with the next subscription"),
    }
}
