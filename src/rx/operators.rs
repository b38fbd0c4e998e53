//! Helper operators for message streams
//!
//! [`MessageStreamExt`] works on any stream of `RxMqttResult<M>` whose items
//! carry an [`MqttMessage`], such as a [`TopicStream`](super::TopicStream).
//! Errors always pass through the filters untouched.

use super::transform::MessageTransform;
use crate::error::RxMqttResult;
use crate::protocol::{ManagedMessage, MqttMessage, QoS, ReceivedMessage, TopicFilter};
use futures::stream::BoxStream;
use futures::{future, Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::str::Utf8Error;

/// Access to the MQTT message carried by a stream item
pub trait AsMqttMessage {
    fn mqtt_message(&self) -> &MqttMessage;
}

impl AsMqttMessage for MqttMessage {
    fn mqtt_message(&self) -> &MqttMessage {
        self
    }
}

impl AsMqttMessage for ReceivedMessage {
    fn mqtt_message(&self) -> &MqttMessage {
        &self.message
    }
}

impl AsMqttMessage for ManagedMessage {
    fn mqtt_message(&self) -> &MqttMessage {
        &self.message
    }
}

/// Decode a payload as UTF-8, substituting `default_on_empty` for an empty one
pub fn utf8_payload(payload: &[u8], default_on_empty: &str) -> Result<String, Utf8Error> {
    if payload.is_empty() {
        return Ok(default_on_empty.to_string());
    }
    std::str::from_utf8(payload).map(str::to_owned)
}

/// Filtering and projection for streams of MQTT messages
///
/// # Examples
/// ```rust,no_run
/// use futures::StreamExt;
/// use rxmqtt::protocol::QoS;
/// use rxmqtt::rx::{MessageStreamExt, RxMqttClient};
///
/// # tokio_test::block_on(async {
/// let client = RxMqttClient::mqtt();
/// let mut kitchen = client
///     .connect("sensors/#")?
///     .filter_topic("sensors/kitchen/+")?
///     .filter_qos(QoS::AtLeastOnce)
///     .select_payload_json::<f64>(true);
///
/// while let Some(reading) = kitchen.next().await {
///     println!("kitchen: {}", reading?);
/// }
/// # Ok::<(), rxmqtt::error::RxMqttError>(())
/// # });
/// ```
pub trait MessageStreamExt<M>: Stream<Item = RxMqttResult<M>> + Sized + Send + 'static
where
    M: AsMqttMessage + Send + 'static,
{
    /// Keep only messages with the given QoS
    fn filter_qos(self, qos: QoS) -> BoxStream<'static, RxMqttResult<M>> {
        self.filter(move |item| {
            future::ready(match item {
                Ok(message) => message.mqtt_message().qos == qos,
                Err(_) => true,
            })
        })
        .boxed()
    }

    /// Keep only messages whose topic matches `filter`
    ///
    /// Fails with [`RxMqttError::InvalidArgument`](crate::error::RxMqttError::InvalidArgument)
    /// for a malformed filter.
    fn filter_topic(self, filter: &str) -> RxMqttResult<BoxStream<'static, RxMqttResult<M>>> {
        let filter = TopicFilter::new(filter)?;
        Ok(self
            .filter(move |item| {
                future::ready(match item {
                    Ok(message) => filter.is_match(&message.mqtt_message().topic),
                    Err(_) => true,
                })
            })
            .boxed())
    }

    fn select_message(self) -> BoxStream<'static, RxMqttResult<MqttMessage>> {
        self.map(|item| item.map(|message| message.mqtt_message().clone()))
            .boxed()
    }

    /// Project each payload; see [`MessageTransform`]
    fn select_payload<T, E, F>(self, projection: F, skip_on_error: bool) -> MessageTransform<M, T>
    where
        T: Send + 'static,
        F: FnMut(&[u8]) -> Result<T, E> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        MessageTransform::new(self, projection, skip_on_error)
    }

    /// Payloads as UTF-8 strings; an empty payload becomes an empty string
    fn select_payload_string(self, skip_on_error: bool) -> MessageTransform<M, String> {
        self.select_payload(|payload: &[u8]| utf8_payload(payload, ""), skip_on_error)
    }

    /// Payloads deserialized from JSON
    fn select_payload_json<T>(self, skip_on_error: bool) -> MessageTransform<M, T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.select_payload(
            |payload: &[u8]| serde_json::from_slice::<T>(payload),
            skip_on_error,
        )
    }
}

impl<S, M> MessageStreamExt<M> for S
where
    S: Stream<Item = RxMqttResult<M>> + Send + 'static,
    M: AsMqttMessage + Send + 'static,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RxMqttError;
    use futures::stream;
    use serde::Deserialize;

    fn source(messages: Vec<MqttMessage>) -> BoxStream<'static, RxMqttResult<MqttMessage>> {
        stream::iter(messages.into_iter().map(Ok)).boxed()
    }

    #[test]
    fn test_utf8_payload() {
        assert_eq!(utf8_payload(b"hello", "none").unwrap(), "hello");
        assert_eq!(utf8_payload(b"", "none").unwrap(), "none");
        assert!(utf8_payload(&[0xff, 0xfe], "none").is_err());
    }

    #[tokio::test]
    async fn test_filter_qos() {
        let topics: Vec<String> = source(vec![
            MqttMessage::new("a", "x"),
            MqttMessage::new("b", "x").with_qos(QoS::AtLeastOnce),
        ])
        .filter_qos(QoS::AtLeastOnce)
        .map(|item| item.unwrap().topic)
        .collect()
        .await;

        assert_eq!(topics, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_filter_topic_keeps_errors() {
        let items: Vec<_> = stream::iter(vec![
            Ok(MqttMessage::new("home/kitchen/temp", "1")),
            Ok(MqttMessage::new("home/hall/humidity", "2")),
            Err(RxMqttError::Disposed),
        ])
        .filter_topic("home/+/temp")
        .unwrap()
        .collect()
        .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().topic, "home/kitchen/temp");
        assert!(matches!(items[1], Err(RxMqttError::Disposed)));
    }

    #[test]
    fn test_filter_topic_rejects_malformed_filter() {
        let result = source(vec![]).filter_topic("");
        assert!(matches!(result, Err(RxMqttError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn test_select_message_from_received() {
        let received = ReceivedMessage::new("client", MqttMessage::new("a/b", "x"));
        let messages: Vec<_> = stream::iter(vec![Ok(received)])
            .select_message()
            .collect()
            .await;

        assert_eq!(messages[0].as_ref().unwrap().topic, "a/b");
    }

    #[tokio::test]
    async fn test_select_payload_string() {
        let strings: Vec<_> = source(vec![
            MqttMessage::new("a", "hello"),
            MqttMessage::new("a", ""),
            MqttMessage::new("a", vec![0xff]),
        ])
        .select_payload_string(true)
        .map(|item| item.unwrap())
        .collect()
        .await;

        assert_eq!(strings, vec!["hello".to_string(), String::new()]);
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reading {
        sensor: String,
        value: f64,
    }

    #[tokio::test]
    async fn test_select_payload_json() {
        let mut readings = source(vec![
            MqttMessage::new("r", r#"{"sensor":"kitchen","value":21.5}"#),
            MqttMessage::new("r", "not json"),
        ])
        .select_payload_json::<Reading>(false);

        assert_eq!(
            readings.next().await.unwrap().unwrap(),
            Reading {
                sensor: "kitchen".to_string(),
                value: 21.5
            }
        );
        assert!(matches!(
            readings.next().await,
            Some(Err(RxMqttError::Transform(_)))
        ));
        assert!(readings.next().await.is_none());
    }
}
