//! Publish correlation
//!
//! Every message of an input stream is queued with the managed client and
//! matched, by identity, against the processed and skipped notifications the
//! client raises later. Each input yields exactly one [`PublishResult`].
//! Correlations run concurrently, so results come out in completion order
//! rather than input order.

use super::client::RxMqttClient;
use crate::error::{RxMqttError, RxMqttResult};
use crate::protocol::{ManagedMessage, PublishResult};
use futures::stream::{self, BoxStream};
use futures::{future, Stream, StreamExt};
use tracing::debug;
use uuid::Uuid;

/// Results of a publish, one per input message
pub type PublishStream = BoxStream<'static, PublishResult>;

impl RxMqttClient {
    /// Publish every message of `messages` through the managed queue
    ///
    /// Accepts [`MqttMessage`](crate::protocol::MqttMessage)s, which get a
    /// fresh identity, or [`ManagedMessage`]s. Per-message failures are
    /// reported as results, never as stream errors. The returned stream ends
    /// once the input has ended and every message has its result.
    pub fn publish<S>(&self, messages: S) -> PublishStream
    where
        S: Stream + Send + 'static,
        S::Item: Into<ManagedMessage>,
    {
        let client = self.clone();
        messages
            .map(Into::<ManagedMessage>::into)
            .flat_map_unordered(None, move |message| {
                stream::once(correlate(client.clone(), message)).boxed()
            })
            .boxed()
    }
}

/// Fluent form of [`RxMqttClient::publish`]
///
/// # Examples
/// ```rust,no_run
/// use futures::{stream, StreamExt};
/// use rxmqtt::protocol::MqttMessage;
/// use rxmqtt::rx::{PublishExt, RxMqttClient};
///
/// # tokio_test::block_on(async {
/// let client = RxMqttClient::mqtt();
/// let readings = stream::iter(vec![
///     MqttMessage::new("sensors/kitchen/temperature", "21.5"),
///     MqttMessage::new("sensors/hall/temperature", "19.0"),
/// ]);
///
/// let results: Vec<_> = readings.publish_on(&client).collect().await;
/// assert_eq!(results.len(), 2);
/// # });
/// ```
pub trait PublishExt: Stream + Sized {
    fn publish_on(self, client: &RxMqttClient) -> PublishStream
    where
        Self: Send + 'static,
        Self::Item: Into<ManagedMessage>,
    {
        client.publish(self)
    }
}

impl<S: Stream> PublishExt for S {}

async fn correlate(client: RxMqttClient, message: ManagedMessage) -> PublishResult {
    if !client.is_connected() {
        debug!(message_id = %message.id, topic = %message.message.topic, "Client not connected, message not sent");
        return PublishResult::not_connected(message);
    }

    // Listen before enqueueing; the outcome may be raised during enqueue
    let mut outcomes = match outcome_stream(&client, message.id) {
        Ok(outcomes) => outcomes,
        Err(e) => return PublishResult::failed(message, e),
    };

    if let Err(e) = client.enqueue_async(message.clone()).await {
        debug!(message_id = %message.id, error = %e, "Enqueue failed");
        return PublishResult::failed(message, e);
    }

    match outcomes.next().await {
        Some(result) => result,
        None => {
            debug!(message_id = %message.id, "Client disposed before the message was processed");
            PublishResult::failed(message, RxMqttError::Disposed)
        }
    }
}

/// Processed and skipped notifications for one message, as results
fn outcome_stream(
    client: &RxMqttClient,
    id: Uuid,
) -> RxMqttResult<BoxStream<'static, PublishResult>> {
    let processed = client
        .message_processed_event()?
        .filter(move |event| future::ready(event.message.id == id))
        .map(PublishResult::from);
    let skipped = client
        .message_skipped_event()?
        .filter(move |event| future::ready(event.message.id == id))
        .map(PublishResult::from);

    Ok(stream::select(processed, skipped).boxed())
}
