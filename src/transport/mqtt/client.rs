//! rumqttc-backed managed client
//!
//! [`MqttManagedClient`] owns two background tasks once started:
//!
//! - the event loop task polls rumqttc, raises notifications and restores the
//!   tracked subscriptions after every (re)connect
//! - the publisher task drains the bounded outgoing queue, waiting for
//!   connectivity before handing each message to rumqttc
//!
//! rumqttc reconnects on the next poll after an error, so the event loop only
//! has to back off for `auto_reconnect_delay_ms` between failed polls.

use super::connection::configure_mqtt_options;
use super::message_handler::{route_mqtt_event, EventRoute};
use crate::config::ManagedClientOptions;
use crate::protocol::{
    ConnectedEvent, DisconnectedEvent, ManagedMessage, MessageProcessedEvent, MessageSkippedEvent,
    MqttMessage, ProcessFailedEvent, QoS, ReceivedMessage, TopicSubscription,
};
use crate::transport::{ClientError, ClientHandlers, ManagedClient};
use async_trait::async_trait;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared between the client handle and its background tasks
struct Shared {
    handlers: ClientHandlers,
    connected: watch::Sender<bool>,
    disposed: AtomicBool,
    subscriptions: Mutex<HashMap<String, QoS>>,
}

impl Shared {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Record the new connectivity, returning the previous value
    fn set_connected(&self, connected: bool) -> bool {
        self.connected.send_replace(connected)
    }

    fn tracked_subscriptions(&self) -> Vec<TopicSubscription> {
        let subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subscriptions
            .iter()
            .map(|(topic, qos)| TopicSubscription::new(topic.clone(), *qos))
            .collect()
    }
}

/// Handles of a started client
struct Running {
    client: AsyncClient,
    options: ManagedClientOptions,
    queue_tx: mpsc::Sender<ManagedMessage>,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: JoinHandle<()>,
    publisher_handle: JoinHandle<()>,
}

impl Running {
    fn abort(self) {
        let _ = self.shutdown_tx.send(true);
        self.event_loop_handle.abort();
        self.publisher_handle.abort();
    }
}

/// Outgoing queue as owned by the publisher task
///
/// Whatever is still queued or held when the task ends, aborted or not, is
/// reported through `message_processed` as failed, so no queued message goes
/// without an outcome.
struct PublishQueue {
    receiver: mpsc::Receiver<ManagedMessage>,
    /// Taken off the queue, not yet handed to rumqttc
    held: Option<ManagedMessage>,
    shared: Arc<Shared>,
}

impl PublishQueue {
    fn fail(&self, message: ManagedMessage, error: &ClientError) {
        self.shared
            .handlers
            .message_processed
            .invoke(MessageProcessedEvent::failed(message, error.clone()));
    }
}

impl Drop for PublishQueue {
    fn drop(&mut self) {
        self.receiver.close();
        let error = if self.shared.disposed.load(Ordering::Acquire) {
            ClientError::Disposed
        } else {
            ClientError::NotConnected
        };

        let mut failed = 0usize;
        if let Some(message) = self.held.take() {
            self.fail(message, &error);
            failed += 1;
        }
        while let Ok(message) = self.receiver.try_recv() {
            self.fail(message, &error);
            failed += 1;
        }
        if failed > 0 {
            warn!(failed, error = %error, "Client stopped with unsent queued messages");
        }
    }
}

/// Managed MQTT client over rumqttc
pub struct MqttManagedClient {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl MqttManagedClient {
    pub fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                handlers: ClientHandlers::new(),
                connected,
                disposed: AtomicBool::new(false),
                subscriptions: Mutex::new(HashMap::new()),
            }),
            running: Mutex::new(None),
        }
    }

    fn ensure_not_disposed(&self) -> Result<(), ClientError> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(ClientError::Disposed);
        }
        Ok(())
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// rumqttc handle of a started client
    fn started_client(&self) -> Result<AsyncClient, ClientError> {
        self.ensure_not_disposed()?;
        self.lock_running()
            .as_ref()
            .map(|running| running.client.clone())
            .ok_or(ClientError::NotStarted)
    }

    /// rumqttc handle, only when started and connected
    fn connected_client(&self) -> Option<AsyncClient> {
        if !self.shared.is_connected() {
            return None;
        }
        self.lock_running()
            .as_ref()
            .map(|running| running.client.clone())
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        client: AsyncClient,
        shared: Arc<Shared>,
        client_id: String,
        reconnect_delay_ms: u64,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(client_id = %client_id, "Starting MQTT event loop");

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping event loop");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            Self::process_event_route(
                                route_mqtt_event(&event),
                                &client,
                                &shared,
                                &client_id,
                            );
                        }
                        Err(e) => {
                            Self::handle_connection_error(&shared, e.to_string());
                            if !Self::interruptible_sleep(shutdown_rx.clone(), reconnect_delay_ms).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        shared.set_connected(false);
        info!(client_id = %client_id, "MQTT event loop stopped");
    }

    fn process_event_route(
        route: EventRoute,
        client: &AsyncClient,
        shared: &Arc<Shared>,
        client_id: &str,
    ) {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                shared.set_connected(true);
                info!(session_present, "Connected to MQTT broker");
                shared
                    .handlers
                    .connected
                    .invoke(ConnectedEvent::new(session_present));
                Self::resubscribe_to_topics(client.clone(), shared.clone());
            }
            EventRoute::MessageReceived(message) => {
                debug!(target: "mqtt_transport", topic = %message.topic, "Received MQTT message");
                shared
                    .handlers
                    .message_received
                    .invoke(ReceivedMessage::new(client_id, message));
            }
            EventRoute::Disconnected { reason } => {
                let was_connected = shared.set_connected(false);
                warn!(reason = %reason, "Broker closed the connection");
                shared
                    .handlers
                    .disconnected
                    .invoke(DisconnectedEvent::new(was_connected, Some(reason)));
            }
            EventRoute::SubscriptionConfirmed { packet_id, filters } => {
                debug!(target: "mqtt_transport", packet_id, filters, "Subscription confirmed");
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            EventRoute::OutgoingEvent => {}
        }
    }

    fn handle_connection_error(shared: &Shared, reason: String) {
        let was_connected = shared.set_connected(false);
        if was_connected {
            error!(error = %reason, "MQTT connection lost");
            shared
                .handlers
                .disconnected
                .invoke(DisconnectedEvent::new(true, Some(reason)));
        } else {
            warn!(error = %reason, "Connecting to MQTT broker failed");
            shared
                .handlers
                .connecting_failed
                .invoke(ProcessFailedEvent::new(ClientError::Transport(reason)));
        }
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Restore tracked subscriptions after a (re)connect
    ///
    /// Runs on its own task: the request channel is drained by the event loop,
    /// which must keep polling while subscribe requests are queued.
    fn resubscribe_to_topics(client: AsyncClient, shared: Arc<Shared>) {
        let subscriptions = shared.tracked_subscriptions();
        if subscriptions.is_empty() {
            return;
        }

        tokio::spawn(async move {
            for subscription in subscriptions {
                match client
                    .subscribe(subscription.topic.clone(), subscription.qos)
                    .await
                {
                    Ok(()) => {
                        debug!(target: "mqtt_transport", topic = %subscription.topic, "Re-subscribed");
                    }
                    Err(e) => {
                        error!(topic = %subscription.topic, error = %e, "Failed to re-subscribe");
                        shared.handlers.synchronizing_subscriptions_failed.invoke(
                            ProcessFailedEvent::new(ClientError::Transport(e.to_string())),
                        );
                    }
                }
            }
        });
    }

    async fn run_publisher(
        client: AsyncClient,
        shared: Arc<Shared>,
        queue_rx: mpsc::Receiver<ManagedMessage>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut connected_rx = shared.connected.subscribe();
        let mut queue = PublishQueue {
            receiver: queue_rx,
            held: None,
            shared: shared.clone(),
        };

        loop {
            let message = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                message = queue.receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let outgoing = message.message.clone();
            queue.held = Some(message);

            // Hold the message until the broker is reachable
            let ready = tokio::select! {
                ready = connected_rx.wait_for(|connected| *connected) => ready.is_ok(),
                _ = shutdown_rx.changed() => false,
            };
            if !ready {
                break;
            }

            let published = client
                .publish(
                    outgoing.topic.clone(),
                    outgoing.qos,
                    outgoing.retain,
                    outgoing.payload,
                )
                .await;
            let Some(message) = queue.held.take() else {
                continue;
            };
            let event = match published {
                Ok(()) => {
                    debug!(target: "mqtt_transport", id = %message.id, topic = %outgoing.topic, "Published queued message");
                    MessageProcessedEvent::succeeded(message)
                }
                Err(e) => {
                    error!(id = %message.id, error = %e, "Publishing queued message failed");
                    MessageProcessedEvent::failed(message, ClientError::Transport(e.to_string()))
                }
            };
            shared.handlers.message_processed.invoke(event);
        }

        drop(queue);
        debug!("Publisher task stopped");
    }
}

impl Default for MqttManagedClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManagedClient for MqttManagedClient {
    fn handlers(&self) -> &ClientHandlers {
        &self.shared.handlers
    }

    async fn subscribe(&self, topics: &[TopicSubscription]) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        {
            let mut subscriptions = self
                .shared
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for subscription in topics {
                subscriptions.insert(subscription.topic.clone(), subscription.qos);
            }
        }

        // Offline subscriptions are sent on the next ConnAck
        if let Some(client) = self.connected_client() {
            for subscription in topics {
                client
                    .subscribe(subscription.topic.clone(), subscription.qos)
                    .await
                    .map_err(|e| ClientError::Transport(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        {
            let mut subscriptions = self
                .shared
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for topic in topics {
                subscriptions.remove(topic);
            }
        }

        if let Some(client) = self.connected_client() {
            for topic in topics {
                client
                    .unsubscribe(topic.clone())
                    .await
                    .map_err(|e| ClientError::Transport(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn enqueue(&self, message: ManagedMessage) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        let queue_tx = self
            .lock_running()
            .as_ref()
            .map(|running| running.queue_tx.clone())
            .ok_or(ClientError::NotStarted)?;

        match queue_tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(id = %message.id, "Pending message queue full, skipping message");
                self.shared
                    .handlers
                    .message_skipped
                    .invoke(MessageSkippedEvent { message });
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ClientError::NotStarted),
        }
    }

    async fn publish(&self, message: MqttMessage) -> Result<(), ClientError> {
        let client = self.started_client()?;
        if !self.shared.is_connected() {
            return Err(ClientError::NotConnected);
        }
        client
            .publish(message.topic, message.qos, message.retain, message.payload)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn ping(&self) -> Result<(), ClientError> {
        self.started_client()?;
        if self.shared.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    async fn start(&self, options: ManagedClientOptions) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        options
            .validate()
            .map_err(|e| ClientError::InvalidOptions(e.to_string()))?;
        let mqtt_options = configure_mqtt_options(&options)?;

        let mut running = self.lock_running();
        if running.is_some() {
            return Err(ClientError::AlreadyStarted);
        }

        let (client, event_loop) =
            AsyncClient::new(mqtt_options, options.queue.request_channel_capacity);
        let (queue_tx, queue_rx) = mpsc::channel(options.queue.max_pending_messages);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let span = crate::mqtt_span!(client_id = %options.connection.client_id);
        let event_loop_handle = tokio::spawn(
            Self::run_event_loop(
                event_loop,
                client.clone(),
                self.shared.clone(),
                options.connection.client_id.clone(),
                options.connection.auto_reconnect_delay_ms,
                shutdown_rx.clone(),
            )
            .instrument(span.clone()),
        );
        let publisher_handle = tokio::spawn(
            Self::run_publisher(client.clone(), self.shared.clone(), queue_rx, shutdown_rx)
                .instrument(span),
        );

        info!(
            broker_url = %options.connection.broker_url,
            client_id = %options.connection.client_id,
            "Managed MQTT client started"
        );

        *running = Some(Running {
            client,
            options,
            queue_tx,
            shutdown_tx,
            event_loop_handle,
            publisher_handle,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClientError> {
        self.ensure_not_disposed()?;
        let Some(running) = self.lock_running().take() else {
            return Ok(());
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.client.disconnect().await {
            debug!(error = %e, "Disconnect request not delivered");
        }

        let was_connected = self.shared.set_connected(false);
        if was_connected {
            self.shared
                .handlers
                .disconnected
                .invoke(DisconnectedEvent::new(true, Some("client stopped".to_string())));
        }

        for handle in [running.event_loop_handle, running.publisher_handle] {
            let abort_handle = handle.abort_handle();
            match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("Client task ended with error: {}", e);
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Client task didn't shut down gracefully, forcing abort");
                    abort_handle.abort();
                }
            }
        }

        info!("Managed MQTT client stopped");
        Ok(())
    }

    fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(running) = self.lock_running().take() {
            running.abort();
        }
        self.shared.set_connected(false);
        self.shared.handlers.close_all();
        debug!("Managed MQTT client disposed");
    }

    fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    fn is_started(&self) -> bool {
        self.lock_running().is_some()
    }

    fn options(&self) -> Option<ManagedClientOptions> {
        self.lock_running()
            .as_ref()
            .map(|running| running.options.clone())
    }

    fn pending_message_count(&self) -> usize {
        self.lock_running()
            .as_ref()
            .map(|running| running.queue_tx.max_capacity() - running.queue_tx.capacity())
            .unwrap_or(0)
    }
}

impl Drop for MqttManagedClient {
    fn drop(&mut self) {
        // Background tasks hold the shared state, not the client; stop them here
        if let Some(running) = self.lock_running().take() {
            running.abort();
        }
    }
}
