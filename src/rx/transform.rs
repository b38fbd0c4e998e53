//! Fallible payload projection
//!
//! [`MessageTransform`] maps every message of a stream through a projection
//! of its payload bytes. A failed projection either drops that one message or
//! ends the stream with [`RxMqttError::Transform`], depending on
//! `skip_on_error`. Errors coming from upstream are passed through unchanged
//! and end the stream as well.

use super::operators::AsMqttMessage;
use crate::error::{RxMqttError, RxMqttResult};
use futures::stream::BoxStream;
use futures::{ready, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Projection<T> = Box<dyn FnMut(&[u8]) -> Result<T, BoxError> + Send>;

/// Stream of projected payloads
///
/// # Examples
/// ```
/// use futures::{stream, StreamExt};
/// use rxmqtt::protocol::MqttMessage;
/// use rxmqtt::rx::MessageTransform;
///
/// # tokio_test::block_on(async {
/// let source = stream::iter(vec![
///     Ok(MqttMessage::new("t", "1")),
///     Ok(MqttMessage::new("t", "x")),
///     Ok(MqttMessage::new("t", "3")),
/// ]);
///
/// let parsed: Vec<u32> = MessageTransform::new(
///     source,
///     |payload: &[u8]| -> Result<u32, Box<dyn std::error::Error + Send + Sync>> {
///         Ok(std::str::from_utf8(payload)?.parse()?)
///     },
///     true,
/// )
/// .map(|item| item.unwrap())
/// .collect()
/// .await;
///
/// assert_eq!(parsed, vec![1, 3]);
/// # });
/// ```
pub struct MessageTransform<M, T> {
    source: BoxStream<'static, RxMqttResult<M>>,
    projection: Projection<T>,
    skip_on_error: bool,
    done: bool,
}

impl<M, T> MessageTransform<M, T>
where
    M: AsMqttMessage + Send + 'static,
    T: Send + 'static,
{
    pub fn new<S, F, E>(source: S, mut projection: F, skip_on_error: bool) -> Self
    where
        S: Stream<Item = RxMqttResult<M>> + Send + 'static,
        F: FnMut(&[u8]) -> Result<T, E> + Send + 'static,
        E: Into<BoxError>,
    {
        Self {
            source: source.boxed(),
            projection: Box::new(move |payload: &[u8]| projection(payload).map_err(Into::into)),
            skip_on_error,
            done: false,
        }
    }

    /// Erase the concrete type
    pub fn run(self) -> BoxStream<'static, RxMqttResult<T>> {
        self.boxed()
    }
}

impl<M, T> Stream for MessageTransform<M, T>
where
    M: AsMqttMessage,
{
    type Item = RxMqttResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        loop {
            let item = match ready!(this.source.poll_next_unpin(cx)) {
                Some(Ok(item)) => item,
                Some(Err(error)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(error)));
                }
                None => {
                    this.done = true;
                    return Poll::Ready(None);
                }
            };

            match (this.projection)(item.mqtt_message().payload()) {
                Ok(value) => return Poll::Ready(Some(Ok(value))),
                Err(error) if this.skip_on_error => {
                    debug!(topic = %item.mqtt_message().topic, error = %error, "Skipping message, payload transform failed");
                }
                Err(error) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(RxMqttError::transform(error))));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MqttMessage;
    use crate::transport::ClientError;
    use futures::stream;

    fn parse_u32(payload: &[u8]) -> Result<u32, BoxError> {
        Ok(std::str::from_utf8(payload)?.trim().parse::<u32>()?)
    }

    fn messages(payloads: &[&'static str]) -> Vec<RxMqttResult<MqttMessage>> {
        payloads
            .iter()
            .map(|payload| Ok(MqttMessage::new("numbers", *payload)))
            .collect()
    }

    #[tokio::test]
    async fn test_skip_on_error_drops_failed_items() {
        let source = stream::iter(messages(&["1", "two", "3"]));
        let values: Vec<_> = MessageTransform::new(source, parse_u32, true)
            .collect()
            .await;

        let values: Vec<u32> = values.into_iter().map(|v| v.unwrap()).collect();
        assert_eq!(values, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_failure_ends_stream_when_not_skipping() {
        let source = stream::iter(messages(&["1", "two", "3"]));
        let mut transform = MessageTransform::new(source, parse_u32, false);

        assert_eq!(transform.next().await.unwrap().unwrap(), 1);
        assert!(matches!(
            transform.next().await,
            Some(Err(RxMqttError::Transform(_)))
        ));
        assert!(transform.next().await.is_none());
    }

    #[tokio::test]
    async fn test_upstream_error_passes_through_unchanged() {
        let source = stream::iter(vec![
            Ok(MqttMessage::new("numbers", "7")),
            Err(RxMqttError::Client(ClientError::NotConnected)),
            Ok(MqttMessage::new("numbers", "8")),
        ]);
        let values: Vec<_> = MessageTransform::new(source, parse_u32, true)
            .run()
            .collect()
            .await;

        assert_eq!(values.len(), 2);
        assert!(matches!(
            values[1],
            Err(RxMqttError::Client(ClientError::NotConnected))
        ));
    }

    #[tokio::test]
    async fn test_each_item_projected_once() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let source = stream::iter(messages(&["a", "b", "c"]));

        let values: Vec<_> = MessageTransform::new(
            source,
            move |payload: &[u8]| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, BoxError>(payload.len())
            },
            false,
        )
        .collect()
        .await;

        assert_eq!(values.len(), 3);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
