//! Mock implementations for testing
//!
//! [`MockManagedClient`] stands in for a real managed client. It records every
//! subscribe, unsubscribe, enqueue and publish call, can be scripted to fail
//! any of them, and exposes `raise_*` helpers that fire the registered handler
//! slots the way a live event loop would.

use crate::config::ManagedClientOptions;
use crate::protocol::{
    ConnectedEvent, DisconnectedEvent, ManagedMessage, MessageProcessedEvent,
    MessageSkippedEvent, MqttMessage, ProcessFailedEvent, ReceivedMessage, TopicSubscription,
};
use crate::transport::{ClientError, ClientHandlers, ManagedClient};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

pub const MOCK_CLIENT_ID: &str = "mock-client";

/// What the mock reports for a message right after it is enqueued
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// Raise a successful `message_processed`
    Process,
    /// Raise a failed `message_processed`
    Fail(ClientError),
    /// Raise `message_skipped`
    Skip,
}

#[derive(Debug, Default)]
struct ScriptedFailures {
    subscribe: Option<ClientError>,
    unsubscribe: Option<ClientError>,
    enqueue: Option<ClientError>,
    publish: Option<ClientError>,
}

/// Scripted in-memory managed client
#[derive(Default)]
pub struct MockManagedClient {
    handlers: ClientHandlers,
    connected: AtomicBool,
    started: AtomicBool,
    disposed: AtomicBool,
    options: Mutex<Option<ManagedClientOptions>>,
    pub subscribe_calls: Arc<Mutex<Vec<Vec<TopicSubscription>>>>,
    pub unsubscribe_calls: Arc<Mutex<Vec<Vec<String>>>>,
    pub enqueued: Arc<Mutex<Vec<ManagedMessage>>>,
    pub published: Arc<Mutex<Vec<MqttMessage>>>,
    failures: Mutex<ScriptedFailures>,
    enqueue_outcome: Mutex<Option<EnqueueOutcome>>,
    subscribe_paused: AtomicBool,
    subscribe_resumed: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockManagedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn fail_subscribe(&self, error: ClientError) {
        lock(&self.failures).subscribe = Some(error);
    }

    pub fn fail_unsubscribe(&self, error: ClientError) {
        lock(&self.failures).unsubscribe = Some(error);
    }

    pub fn fail_enqueue(&self, error: ClientError) {
        lock(&self.failures).enqueue = Some(error);
    }

    pub fn fail_publish(&self, error: ClientError) {
        lock(&self.failures).publish = Some(error);
    }

    pub fn clear_failures(&self) {
        *lock(&self.failures) = ScriptedFailures::default();
    }

    /// Hold every subscribe call open until [`resume_subscribe`](Self::resume_subscribe)
    ///
    /// Calls are recorded as soon as they start.
    pub fn pause_subscribe(&self) {
        self.subscribe_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_subscribe(&self) {
        self.subscribe_paused.store(false, Ordering::SeqCst);
        self.subscribe_resumed.notify_waiters();
    }

    /// Report an outcome for every message as soon as it is enqueued
    pub fn set_enqueue_outcome(&self, outcome: Option<EnqueueOutcome>) {
        *lock(&self.enqueue_outcome) = outcome;
    }

    pub fn subscribe_calls(&self) -> Vec<Vec<TopicSubscription>> {
        lock(&self.subscribe_calls).clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<Vec<String>> {
        lock(&self.unsubscribe_calls).clone()
    }

    pub fn enqueued_messages(&self) -> Vec<ManagedMessage> {
        lock(&self.enqueued).clone()
    }

    pub fn published_messages(&self) -> Vec<MqttMessage> {
        lock(&self.published).clone()
    }

    pub fn clear_history(&self) {
        lock(&self.subscribe_calls).clear();
        lock(&self.unsubscribe_calls).clear();
        lock(&self.enqueued).clear();
        lock(&self.published).clear();
    }

    pub fn raise_connected(&self, session_present: bool) {
        self.set_connected(true);
        self.handlers
            .connected
            .invoke(ConnectedEvent::new(session_present));
    }

    pub fn raise_disconnected(&self, reason: Option<&str>) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.handlers.disconnected.invoke(DisconnectedEvent::new(
            was_connected,
            reason.map(str::to_string),
        ));
    }

    pub fn raise_connecting_failed(&self, error: ClientError) {
        self.handlers
            .connecting_failed
            .invoke(ProcessFailedEvent::new(error));
    }

    pub fn raise_synchronizing_subscriptions_failed(&self, error: ClientError) {
        self.handlers
            .synchronizing_subscriptions_failed
            .invoke(ProcessFailedEvent::new(error));
    }

    pub fn raise_message_processed(&self, event: MessageProcessedEvent) {
        self.handlers.message_processed.invoke(event);
    }

    pub fn raise_message_skipped(&self, message: ManagedMessage) {
        self.handlers
            .message_skipped
            .invoke(MessageSkippedEvent { message });
    }

    /// Deliver an inbound message; the returned clone shares its handled flag
    pub fn raise_message_received(&self, message: MqttMessage) -> ReceivedMessage {
        let received = ReceivedMessage::new(MOCK_CLIENT_ID, message);
        self.handlers.message_received.invoke(received.clone());
        received
    }

    fn ensure_not_disposed(&self) -> Result<(), ClientError> {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        Ok(())
    }
}

#[async_trait]
impl ManagedClient for MockManagedClient {
    fn handlers(&self) -> &ClientHandlers {
        &self.handlers
    }

    async fn subscribe(&self, topics: &[TopicSubscription]) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        lock(&self.subscribe_calls).push(topics.to_vec());
        while self.subscribe_paused.load(Ordering::SeqCst) {
            let resumed = self.subscribe_resumed.notified();
            if !self.subscribe_paused.load(Ordering::SeqCst) {
                break;
            }
            resumed.await;
        }
        match lock(&self.failures).subscribe.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        lock(&self.unsubscribe_calls).push(topics.to_vec());
        match lock(&self.failures).unsubscribe.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn enqueue(&self, message: ManagedMessage) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        if let Some(error) = lock(&self.failures).enqueue.clone() {
            return Err(error);
        }
        lock(&self.enqueued).push(message.clone());

        let outcome = lock(&self.enqueue_outcome).clone();
        match outcome {
            Some(EnqueueOutcome::Process) => {
                self.raise_message_processed(MessageProcessedEvent::succeeded(message))
            }
            Some(EnqueueOutcome::Fail(error)) => {
                self.raise_message_processed(MessageProcessedEvent::failed(message, error))
            }
            Some(EnqueueOutcome::Skip) => self.raise_message_skipped(message),
            None => {}
        }
        Ok(())
    }

    async fn publish(&self, message: MqttMessage) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        if let Some(error) = lock(&self.failures).publish.clone() {
            return Err(error);
        }
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        lock(&self.published).push(message);
        Ok(())
    }

    async fn ping(&self) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    async fn start(&self, options: ManagedClientOptions) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyStarted);
        }
        *lock(&self.options) = Some(options);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if self.connected.load(Ordering::SeqCst) {
            self.raise_disconnected(Some("client stopped"));
        }
        Ok(())
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        self.handlers.close_all();
    }

    fn is_connected(&self) -> bool {
        !self.is_disposed() && self.connected.load(Ordering::SeqCst)
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn options(&self) -> Option<ManagedClientOptions> {
        lock(&self.options).clone()
    }

    fn pending_message_count(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_records_calls() {
        let mock = MockManagedClient::new();
        mock.subscribe(&[TopicSubscription::new("a", crate::protocol::QoS::AtMostOnce)])
            .await
            .unwrap();
        mock.unsubscribe(&["a".to_string()]).await.unwrap();

        assert_eq!(mock.subscribe_calls().len(), 1);
        assert_eq!(mock.unsubscribe_calls(), vec![vec!["a".to_string()]]);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let mock = MockManagedClient::new();
        mock.fail_subscribe(ClientError::NotConnected);
        assert_eq!(
            mock.subscribe(&[]).await,
            Err(ClientError::NotConnected)
        );
        mock.clear_failures();
        assert!(mock.subscribe(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_enqueue_outcome_fires_handler() {
        let mock = MockManagedClient::new();
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = processed.clone();
        mock.handlers()
            .message_processed
            .set(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        mock.set_enqueue_outcome(Some(EnqueueOutcome::Process));
        mock.enqueue(ManagedMessage::new(MqttMessage::new("a", "x")))
            .await
            .unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), 1);
        assert_eq!(mock.enqueued_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_dispose_rejects_calls() {
        let mock = MockManagedClient::new();
        mock.set_connected(true);
        mock.dispose();

        assert!(mock.is_disposed());
        assert!(!mock.is_connected());
        assert_eq!(mock.ping().await, Err(ClientError::Disposed));
        assert!(mock.handlers().connected.set(Arc::new(|_| {})).is_err());
    }
}
