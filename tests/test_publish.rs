//! Publish correlation tests
//!
//! Every input message must yield exactly one result, whatever the managed
//! client reports for it and in whatever order it reports it.

use futures::{stream, StreamExt};
use rxmqtt::error::RxMqttError;
use rxmqtt::protocol::{
    ManagedMessage, MessageProcessedEvent, MqttMessage, PublishReasonCode, PublishResult,
};
use rxmqtt::rx::{PublishExt, PublishStream, RxMqttClient};
use rxmqtt::testing::{EnqueueOutcome, MockManagedClient};
use rxmqtt::transport::ClientError;
use std::sync::Arc;
use tokio::sync::mpsc;

fn connected_client() -> (Arc<MockManagedClient>, RxMqttClient) {
    let mock = Arc::new(MockManagedClient::new());
    mock.set_connected(true);
    let rx = RxMqttClient::new(mock.clone());
    (mock, rx)
}

fn managed(count: usize) -> Vec<ManagedMessage> {
    (0..count)
        .map(|i| ManagedMessage::new(MqttMessage::new(format!("out/{i}"), i.to_string())))
        .collect()
}

/// Drive a publish stream in the background, forwarding its results
fn drive(results: PublishStream) -> mpsc::UnboundedReceiver<PublishResult> {
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut results = results;
        while let Some(result) = results.next().await {
            let _ = sender.send(result);
        }
    });
    receiver
}

async fn wait_for_enqueued(mock: &MockManagedClient, count: usize) {
    while mock.enqueued_messages().len() < count {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_one_success_per_message() {
    let (mock, rx) = connected_client();
    mock.set_enqueue_outcome(Some(EnqueueOutcome::Process));
    let messages = managed(5);

    let results: Vec<PublishResult> = stream::iter(messages.clone())
        .publish_on(&rx)
        .collect()
        .await;

    assert_eq!(results.len(), 5);
    assert!(results.iter().all(PublishResult::is_success));
    let mut ids: Vec<_> = results.iter().map(|r| r.message.id).collect();
    let mut expected: Vec<_> = messages.iter().map(|m| m.id).collect();
    ids.sort();
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_not_connected_results_without_enqueue() {
    let mock = Arc::new(MockManagedClient::new());
    let rx = RxMqttClient::new(mock.clone());

    let results: Vec<_> = rx
        .publish(stream::iter(vec![
            MqttMessage::new("a", "1"),
            MqttMessage::new("b", "2"),
        ]))
        .collect()
        .await;

    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|r| r.reason_code == PublishReasonCode::ClientNotConnected && r.error.is_none()));
    assert!(mock.enqueued_messages().is_empty());
}

#[tokio::test]
async fn test_failed_processing_carries_error() {
    let (mock, rx) = connected_client();
    mock.set_enqueue_outcome(Some(EnqueueOutcome::Fail(ClientError::Transport(
        "payload too large".to_string(),
    ))));

    let results: Vec<_> = rx.publish(stream::iter(managed(1))).collect().await;

    assert_eq!(results[0].reason_code, PublishReasonCode::HasFailed);
    match &results[0].error {
        Some(RxMqttError::Client(ClientError::Transport(reason))) => {
            assert_eq!(reason, "payload too large")
        }
        other => panic!("Expected transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_skipped_message_result() {
    let (mock, rx) = connected_client();
    mock.set_enqueue_outcome(Some(EnqueueOutcome::Skip));

    let results: Vec<_> = rx.publish(stream::iter(managed(2))).collect().await;

    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|r| r.reason_code == PublishReasonCode::HasSkipped));
}

#[tokio::test]
async fn test_enqueue_error_does_not_halt_stream() {
    let (mock, rx) = connected_client();
    mock.fail_enqueue(ClientError::NotStarted);

    let results: Vec<_> = rx.publish(stream::iter(managed(3))).collect().await;

    assert_eq!(results.len(), 3);
    for result in &results {
        assert_eq!(result.reason_code, PublishReasonCode::HasFailed);
        assert!(matches!(
            result.error,
            Some(RxMqttError::Client(ClientError::NotStarted))
        ));
    }
}

#[tokio::test]
async fn test_results_follow_completion_order() {
    let (mock, rx) = connected_client();
    let messages = managed(2);
    let mut results = drive(rx.publish(stream::iter(messages.clone())));
    wait_for_enqueued(&mock, 2).await;

    // Unrelated notifications are ignored
    mock.raise_message_processed(MessageProcessedEvent::succeeded(managed(1).remove(0)));
    mock.raise_message_processed(MessageProcessedEvent::succeeded(messages[1].clone()));

    let first = results.recv().await.unwrap();
    assert_eq!(first.message.id, messages[1].id);
    assert!(first.is_success());

    // The earlier input completes second
    mock.raise_message_skipped(messages[0].clone());
    let second = results.recv().await.unwrap();
    assert_eq!(second.message.id, messages[0].id);
    assert_eq!(second.reason_code, PublishReasonCode::HasSkipped);

    assert!(results.recv().await.is_none());
}

#[tokio::test]
async fn test_stream_waits_for_every_outcome() {
    let (mock, rx) = connected_client();
    let messages = managed(2);
    let mut results = drive(rx.publish(stream::iter(messages.clone())));
    wait_for_enqueued(&mock, 2).await;

    mock.raise_message_processed(MessageProcessedEvent::succeeded(messages[0].clone()));
    assert!(results.recv().await.is_some());
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(matches!(
        results.try_recv(),
        Err(mpsc::error::TryRecvError::Empty)
    ));

    mock.raise_message_processed(MessageProcessedEvent::succeeded(messages[1].clone()));
    assert!(results.recv().await.is_some());
    assert!(results.recv().await.is_none());
}

#[tokio::test]
async fn test_dispose_fails_in_flight_messages() {
    let (mock, rx) = connected_client();
    let results = tokio::spawn(rx.publish(stream::iter(managed(2))).collect::<Vec<_>>());

    wait_for_enqueued(&mock, 2).await;
    rx.dispose();

    let results = results.await.unwrap();
    assert_eq!(results.len(), 2);
    for result in &results {
        assert_eq!(result.reason_code, PublishReasonCode::HasFailed);
        assert!(matches!(result.error, Some(RxMqttError::Disposed)));
    }
}

#[tokio::test]
async fn test_publish_after_dispose_yields_one_result_per_message() {
    let (mock, rx) = connected_client();
    rx.dispose();
    assert!(mock.is_disposed());

    let results: Vec<_> = rx.publish(stream::iter(managed(2))).collect().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| !r.is_success()));
}
