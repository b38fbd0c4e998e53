//! Integration Tests with Real MQTT Broker
//!
//! Exercise the stream client on top of the rumqttc-backed managed client.
//! Ignored by default; run with a broker on localhost:1883:
//!
//! ```text
//! cargo test --test test_mqtt_broker_integration -- --ignored
//! ```


use futures::{stream, StreamExt};
use mqtt_integration_helpers::{broker_options, unique_topic, within_timeout};
use rxmqtt::protocol::{MqttMessage, PublishReasonCode, QoS};
use rxmqtt::rx::{MessageStreamExt, PublishExt, RxMqttClient};
use std::time::Duration;
use tokio::time::sleep;

async fn started_client(prefix: &str) -> RxMqttClient {
    let client = RxMqttClient::mqtt();
    let mut connected = client.connected().unwrap();
    client.start(broker_options(prefix)).await.unwrap();

    within_timeout(async {
        while let Some(is_connected) = connected.next().await {
            if is_connected {
                break;
            }
        }
    })
    .await;
    client
}

#[tokio::test]
#[ignore = "requires an MQTT broker at localhost:1883"]
async fn test_connect_to_real_broker() {
    let client = started_client("connect").await;

    assert!(client.is_connected());
    assert!(client.is_started());
    client.ping().await.unwrap();

    client.stop().await.unwrap();
    assert!(!client.is_connected());
}

#[tokio::test]
#[ignore = "requires an MQTT broker at localhost:1883"]
async fn test_publish_and_receive_round_trip() {
    let client = started_client("round-trip").await;
    let topic = unique_topic("round-trip");

    let mut received = client
        .connect_with_qos(&format!("{topic}/+"), QoS::AtLeastOnce)
        .unwrap()
        .select_payload_string(false);
    // First poll attaches and subscribes
    assert!(futures::poll!(received.next()).is_pending());
    sleep(Duration::from_millis(300)).await;

    let results: Vec<_> = stream::iter(vec![
        MqttMessage::new(format!("{topic}/a"), "first").with_qos(QoS::AtLeastOnce)
    ])
    .publish_on(&client)
    .collect()
    .await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].reason_code, PublishReasonCode::HasSucceeded);

    let payload = within_timeout(received.next()).await.unwrap().unwrap();
    assert_eq!(payload, "first");

    client.dispose();
    assert!(received.next().await.is_none());
}

#[tokio::test]
#[ignore = "requires an MQTT broker at localhost:1883"]
async fn test_direct_publish_reaches_subscriber() {
    let client = started_client("direct").await;
    let topic = unique_topic("direct");

    let mut received = client.connect(&topic).unwrap();
    assert!(futures::poll!(received.next()).is_pending());
    sleep(Duration::from_millis(300)).await;

    client
        .publish_async(MqttMessage::new(topic.clone(), "direct"))
        .await
        .unwrap();

    let message = within_timeout(received.next()).await.unwrap().unwrap();
    assert_eq!(message.topic(), topic);
    assert_eq!(message.message.payload_str(), Some("direct"));
}
