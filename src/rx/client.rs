//! Stream-based MQTT client
//!
//! [`RxMqttClient`] wraps a [`ManagedClient`] and exposes its notifications
//! and topic subscriptions as streams.
//!
//! Topic subscriptions are multiplexed: every `connect` for the same topic
//! string shares one [`TopicHub`], which issues a single underlying subscribe
//! when its first consumer attaches and a single unsubscribe when its last
//! consumer detaches.
//!
//! The subscribe is polled by the consumers themselves, so topic streams work
//! on any executor. Teardown runs from `Drop` and is finished inline when it
//! can be.

use super::drive_detached;
use super::event_bridge::{BridgeGuard, EventBridge, EventSink, EventStream};
use crate::config::ManagedClientOptions;
use crate::error::{RxMqttError, RxMqttResult};
use crate::protocol::{
    ConnectedEvent, DisconnectedEvent, ManagedMessage, MessageProcessedEvent,
    MessageSkippedEvent, MqttMessage, ProcessFailedEvent, QoS, ReceivedMessage, TopicFilter,
    TopicSubscription,
};
use crate::transport::mqtt::MqttManagedClient;
use crate::transport::ManagedClient;
use futures::future::{BoxFuture, Shared};
use futures::stream::{self, BoxStream};
use futures::{future, FutureExt, Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, error, Instrument};

type TopicItem = RxMqttResult<ReceivedMessage>;

/// Subscribe or unsubscribe work for one topic, pollable from several places
pub(crate) type TopicWork = Shared<BoxFuture<'static, ()>>;

pub(crate) struct Bridges {
    pub(crate) connected: EventBridge<ConnectedEvent>,
    pub(crate) disconnected: EventBridge<DisconnectedEvent>,
    pub(crate) connecting_failed: EventBridge<ProcessFailedEvent>,
    pub(crate) synchronizing_subscriptions_failed: EventBridge<ProcessFailedEvent>,
    pub(crate) message_processed: EventBridge<MessageProcessedEvent>,
    pub(crate) message_skipped: EventBridge<MessageSkippedEvent>,
    pub(crate) message_received: EventBridge<ReceivedMessage>,
}

impl Bridges {
    fn new(client: &Arc<dyn ManagedClient>) -> Self {
        Self {
            connected: EventBridge::new(client.clone(), |handlers| &handlers.connected),
            disconnected: EventBridge::new(client.clone(), |handlers| &handlers.disconnected),
            connecting_failed: EventBridge::new(client.clone(), |handlers| {
                &handlers.connecting_failed
            }),
            synchronizing_subscriptions_failed: EventBridge::new(client.clone(), |handlers| {
                &handlers.synchronizing_subscriptions_failed
            }),
            message_processed: EventBridge::new(client.clone(), |handlers| {
                &handlers.message_processed
            }),
            message_skipped: EventBridge::new(client.clone(), |handlers| &handlers.message_skipped),
            message_received: EventBridge::new(client.clone(), |handlers| {
                &handlers.message_received
            }),
        }
    }

    fn dispose(&self) {
        self.connected.dispose();
        self.disconnected.dispose();
        self.connecting_failed.dispose();
        self.synchronizing_subscriptions_failed.dispose();
        self.message_processed.dispose();
        self.message_skipped.dispose();
        self.message_received.dispose();
    }
}

/// A consumer slot in a hub, as handed to a [`TopicStream`]
struct Attachment {
    hub: Arc<TopicHub>,
    id: u64,
    receiver: mpsc::UnboundedReceiver<TopicItem>,
    activation: Option<TopicWork>,
}

pub(crate) struct ClientInner {
    client: Arc<dyn ManagedClient>,
    pub(crate) bridges: Bridges,
    topics: Mutex<HashMap<String, Arc<TopicHub>>>,
    /// Unfinished teardown per topic; a new hub for the topic waits for it
    teardowns: Mutex<HashMap<String, TopicWork>>,
    disposed: AtomicBool,
}

impl ClientInner {
    fn lock_topics(&self) -> MutexGuard<'_, HashMap<String, Arc<TopicHub>>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_teardowns(&self) -> MutexGuard<'_, HashMap<String, TopicWork>> {
        self.teardowns.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_not_disposed(&self) -> RxMqttResult<()> {
        if self.is_disposed() {
            return Err(RxMqttError::Disposed);
        }
        Ok(())
    }

    /// Attach a consumer to the hub for `filter`, creating the hub if needed
    ///
    /// Returns `None` once the client is disposed.
    fn attach_consumer(self: &Arc<Self>, filter: &TopicFilter, qos: QoS) -> Option<Attachment> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut topics = self.lock_topics();
        if self.is_disposed() {
            return None;
        }
        let cached = topics
            .get(filter.pattern())
            .filter(|hub| !hub.is_closed())
            .cloned();
        let hub = match cached {
            Some(hub) => hub,
            None => {
                let hub = Arc::new(TopicHub::new(filter.clone(), qos));
                debug!(
                    topic = %hub.topic(),
                    wildcards = filter.has_wildcards(),
                    "Topic hub created"
                );
                topics.insert(filter.pattern().to_string(), hub.clone());
                hub
            }
        };

        let mut state = hub.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.consumers.insert(id, sender);
        let activation = if matches!(state.phase, HubPhase::Idle) {
            let previous = self.lock_teardowns().remove(hub.topic());
            let activation = self.activation(&hub, previous);
            state.phase = HubPhase::Subscribing(activation.clone());
            Some(activation)
        } else if let HubPhase::Subscribing(activation) = &state.phase {
            Some(activation.clone())
        } else {
            None
        };
        drop(state);
        drop(topics);

        debug!(topic = %hub.topic(), consumer = id, "Consumer attached");
        Some(Attachment {
            hub,
            id,
            receiver,
            activation,
        })
    }

    /// Subscribe work for a fresh hub, run after any teardown of the same topic
    fn activation(self: &Arc<Self>, hub: &Arc<TopicHub>, previous: Option<TopicWork>) -> TopicWork {
        let cache = Arc::downgrade(self);
        let client = self.client.clone();
        let span = crate::topic_span!(topic = %hub.topic());
        let hub = hub.clone();
        async move {
            if let Some(previous) = previous {
                previous.await;
            }
            Self::activate_hub(cache, client, hub).await;
        }
        .instrument(span)
        .boxed()
        .shared()
    }

    /// Subscribe for a fresh hub and start routing received messages to it
    async fn activate_hub(cache: Weak<ClientInner>, client: Arc<dyn ManagedClient>, hub: Arc<TopicHub>) {
        let subscription = TopicSubscription::new(hub.topic(), hub.qos);
        if let Err(source) = client.subscribe(&[subscription]).await {
            if source.is_disposed() {
                hub.complete();
            } else {
                error!(topic = %hub.topic(), error = %source, "Error while subscribing to topic");
                Self::fail_hub(
                    &cache,
                    &hub,
                    RxMqttError::Subscribe {
                        topic: hub.topic().to_string(),
                        source,
                    },
                );
            }
            return;
        }

        let attached = match cache.upgrade() {
            Some(inner) => inner.bridges.message_received.attach(Arc::new(HubSink {
                hub: Arc::downgrade(&hub),
            })),
            None => Err(RxMqttError::Disposed),
        };
        let guard = match attached {
            Ok(guard) => guard,
            Err(e) if e.is_disposed() => {
                hub.complete();
                return;
            }
            Err(e) => {
                error!(topic = %hub.topic(), error = %e, "Error while routing received messages");
                Self::fail_hub(&cache, &hub, e);
                Self::unsubscribe(client, hub.topic().to_string()).await;
                return;
            }
        };

        let (replaced, stale) = {
            let mut state = hub.lock();
            if matches!(state.phase, HubPhase::Subscribing(_)) {
                (Some(std::mem::replace(&mut state.phase, HubPhase::Active(guard))), None)
            } else {
                (None, Some(guard))
            }
        };
        drop(replaced);

        match stale {
            None => debug!(topic = %hub.topic(), "Topic subscription active"),
            Some(guard) => {
                // Every consumer left while the subscribe was in flight
                drop(guard);
                Self::unsubscribe(client, hub.topic().to_string()).await;
            }
        }
    }

    fn fail_hub(cache: &Weak<ClientInner>, hub: &Arc<TopicHub>, error: RxMqttError) {
        let consumers = match cache.upgrade() {
            Some(inner) => {
                let mut topics = inner.lock_topics();
                if topics
                    .get(hub.topic())
                    .is_some_and(|cached| Arc::ptr_eq(cached, hub))
                {
                    topics.remove(hub.topic());
                }
                hub.close()
            }
            None => hub.close(),
        };
        for (_, consumer) in consumers {
            let _ = consumer.send(Err(error.clone()));
        }
    }

    fn detach_consumer(&self, hub: &Arc<TopicHub>, id: u64) {
        let (teardown, guard) = {
            let mut topics = self.lock_topics();
            let mut state = hub.lock();
            state.consumers.remove(&id);
            if !state.consumers.is_empty() {
                return;
            }

            if topics
                .get(hub.topic())
                .is_some_and(|cached| Arc::ptr_eq(cached, hub))
            {
                topics.remove(hub.topic());
            }
            let (teardown, guard) = match std::mem::replace(&mut state.phase, HubPhase::Closed) {
                // The activation unsubscribes once its subscribe completes
                HubPhase::Subscribing(activation) => (activation, None),
                HubPhase::Active(guard) => (
                    Self::unsubscribe(self.client.clone(), hub.topic().to_string())
                        .boxed()
                        .shared(),
                    Some(guard),
                ),
                HubPhase::Idle | HubPhase::Closed => return,
            };

            let mut teardowns = self.lock_teardowns();
            teardowns.retain(|_, pending| pending.peek().is_none());
            teardowns.insert(hub.topic().to_string(), teardown.clone());
            (teardown, guard)
        };

        debug!(topic = %hub.topic(), "Last consumer detached");
        drop(guard);
        drive_detached(teardown);
    }

    async fn unsubscribe(client: Arc<dyn ManagedClient>, topic: String) {
        match client.unsubscribe(std::slice::from_ref(&topic)).await {
            Ok(()) => debug!(topic = %topic, "Unsubscribed from topic"),
            Err(e) if e.is_disposed() => {
                debug!(topic = %topic, "Client disposed, nothing to unsubscribe");
            }
            Err(e) => {
                error!(topic = %topic, error = %e, "Error while unsubscribing from topic");
            }
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let hubs: Vec<Arc<TopicHub>> = self.lock_topics().drain().map(|(_, hub)| hub).collect();
        for hub in hubs {
            hub.complete();
        }
        self.lock_teardowns().clear();
        self.bridges.dispose();
        self.client.dispose();
        debug!("Stream client disposed");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

enum HubPhase {
    Idle,
    Subscribing(TopicWork),
    Active(BridgeGuard<ReceivedMessage>),
    Closed,
}

struct HubState {
    consumers: HashMap<u64, mpsc::UnboundedSender<TopicItem>>,
    next_id: u64,
    phase: HubPhase,
}

/// Shared state of all consumers connected to one topic string
pub(crate) struct TopicHub {
    filter: TopicFilter,
    qos: QoS,
    state: Mutex<HubState>,
}

impl TopicHub {
    fn new(filter: TopicFilter, qos: QoS) -> Self {
        Self {
            filter,
            qos,
            state: Mutex::new(HubState {
                consumers: HashMap::new(),
                next_id: 0,
                phase: HubPhase::Idle,
            }),
        }
    }

    fn topic(&self) -> &str {
        self.filter.pattern()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        matches!(self.lock().phase, HubPhase::Closed)
    }

    /// Mark the hub closed and hand back its consumers
    fn close(&self) -> HashMap<u64, mpsc::UnboundedSender<TopicItem>> {
        let (consumers, previous) = {
            let mut state = self.lock();
            let previous = std::mem::replace(&mut state.phase, HubPhase::Closed);
            (std::mem::take(&mut state.consumers), previous)
        };
        // Detaching from the bridge happens outside the hub lock
        drop(previous);
        consumers
    }

    /// End every consumer stream without an error
    fn complete(&self) {
        let consumers = self.close();
        if !consumers.is_empty() {
            debug!(topic = %self.topic(), consumers = consumers.len(), "Completing topic streams");
        }
    }

    fn deliver(&self, message: &ReceivedMessage) {
        if message.is_handled() || !self.filter.is_match(message.topic()) {
            return;
        }
        let state = self.lock();
        if !matches!(state.phase, HubPhase::Active(_)) {
            return;
        }
        if !message.try_claim() {
            return;
        }
        for consumer in state.consumers.values() {
            let _ = consumer.send(Ok(message.clone()));
        }
    }
}

struct HubSink {
    hub: Weak<TopicHub>,
}

impl EventSink<ReceivedMessage> for HubSink {
    fn on_next(&self, message: &ReceivedMessage) {
        if let Some(hub) = self.hub.upgrade() {
            hub.deliver(message);
        }
    }

    fn on_completed(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.complete();
        }
    }
}

/// Feeds a connectivity flag into a channel shared by two bridges
struct ConnectivitySink {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<bool>>>>,
    state: bool,
}

impl<T> EventSink<T> for ConnectivitySink {
    fn on_next(&self, _event: &T) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = sender.as_ref() {
            let _ = sender.send(self.state);
        }
    }

    fn on_completed(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

enum TopicStreamState {
    Pending,
    Attached(Attachment),
    Done,
}

/// Messages received on one topic filter
///
/// Attaches to the shared topic subscription when first polled and detaches
/// when dropped or finished. While the subscribe is in flight, polling the
/// stream drives it. Yields `Err` at most once, as its last item, when
/// subscribing failed. Ends without an error when the client is disposed.
pub struct TopicStream {
    client: Weak<ClientInner>,
    filter: TopicFilter,
    qos: QoS,
    state: TopicStreamState,
}

impl TopicStream {
    fn new(client: Weak<ClientInner>, filter: TopicFilter, qos: QoS) -> Self {
        Self {
            client,
            filter,
            qos,
            state: TopicStreamState::Pending,
        }
    }

    /// The topic filter this stream was connected with
    pub fn topic(&self) -> &str {
        self.filter.pattern()
    }

    fn detach(&mut self) {
        if let TopicStreamState::Attached(attachment) =
            std::mem::replace(&mut self.state, TopicStreamState::Done)
        {
            if let Some(client) = self.client.upgrade() {
                client.detach_consumer(&attachment.hub, attachment.id);
            }
        }
    }
}

impl Stream for TopicStream {
    type Item = TopicItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TopicItem>> {
        let this = &mut *self;

        if let TopicStreamState::Pending = this.state {
            let attached = this
                .client
                .upgrade()
                .and_then(|client| client.attach_consumer(&this.filter, this.qos));
            this.state = match attached {
                Some(attachment) => TopicStreamState::Attached(attachment),
                None => TopicStreamState::Done,
            };
        }

        let polled = match &mut this.state {
            TopicStreamState::Attached(attachment) => {
                let subscribed = attachment
                    .activation
                    .as_mut()
                    .is_some_and(|activation| activation.poll_unpin(cx).is_ready());
                if subscribed {
                    attachment.activation = None;
                }
                attachment.receiver.poll_recv(cx)
            }
            _ => return Poll::Ready(None),
        };

        match polled {
            Poll::Ready(Some(Ok(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Some(Err(error))) => {
                this.detach();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.detach();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TopicStream {
    fn drop(&mut self) {
        self.detach();
    }
}

/// A stream-based client over a [`ManagedClient`]
///
/// Cloning shares the client. Dropping the last clone disposes it, which
/// completes every stream handed out and disposes the managed client.
///
/// # Examples
/// ```rust,no_run
/// use futures::StreamExt;
/// use rxmqtt::config::ManagedClientOptions;
/// use rxmqtt::rx::RxMqttClient;
///
/// # tokio_test::block_on(async {
/// let client = RxMqttClient::mqtt();
/// client
///     .start(ManagedClientOptions::new("mqtt://localhost:1883", "rx-demo"))
///     .await?;
///
/// let mut temperatures = client.connect("sensors/+/temperature")?;
/// while let Some(message) = temperatures.next().await {
///     let message = message?;
///     println!("{}: {:?}", message.topic(), message.message.payload_str());
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # });
/// ```
#[derive(Clone)]
pub struct RxMqttClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl RxMqttClient {
    pub fn new(client: Arc<dyn ManagedClient>) -> Self {
        let bridges = Bridges::new(&client);
        Self {
            inner: Arc::new(ClientInner {
                client,
                bridges,
                topics: Mutex::new(HashMap::new()),
                teardowns: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Client backed by a rumqttc [`MqttManagedClient`]
    pub fn mqtt() -> Self {
        Self::new(Arc::new(MqttManagedClient::new()))
    }

    /// The wrapped managed client
    pub fn internal_client(&self) -> Arc<dyn ManagedClient> {
        self.inner.client.clone()
    }

    /// Messages on `topic`, subscribed with QoS 0
    pub fn connect(&self, topic: &str) -> RxMqttResult<TopicStream> {
        self.connect_with_qos(topic, QoS::AtMostOnce)
    }

    /// Messages on `topic`, which may contain `+` and `#` wildcards
    ///
    /// Fails with [`RxMqttError::InvalidArgument`] for an empty or malformed
    /// filter and with [`RxMqttError::Disposed`] after disposal. All streams
    /// for the same topic string share one subscription; the QoS of the
    /// first attached stream is the one subscribed with.
    pub fn connect_with_qos(&self, topic: &str, qos: QoS) -> RxMqttResult<TopicStream> {
        let filter = TopicFilter::new(topic)?;
        self.inner.ensure_not_disposed()?;
        Ok(TopicStream::new(Arc::downgrade(&self.inner), filter, qos))
    }

    /// Connectivity, starting with the current state and ending with `false`
    /// when the client is disposed
    pub fn connected(&self) -> RxMqttResult<BoxStream<'static, bool>> {
        self.inner.ensure_not_disposed()?;
        // One channel for both notifications keeps transitions in raise order
        let (sender, receiver) = mpsc::unbounded_channel();
        let sender = Arc::new(Mutex::new(Some(sender)));
        let connected = self.inner.bridges.connected.attach(Arc::new(ConnectivitySink {
            sender: sender.clone(),
            state: true,
        }))?;
        let disconnected = self
            .inner
            .bridges
            .disconnected
            .attach(Arc::new(ConnectivitySink {
                sender,
                state: false,
            }))?;
        // Read after attaching so no transition slips in between
        let current = self.inner.client.is_connected();

        let transitions = stream::unfold(
            (receiver, connected, disconnected),
            |(mut receiver, connected, disconnected)| async move {
                let state = receiver.recv().await?;
                Some((state, (receiver, connected, disconnected)))
            },
        );

        Ok(stream::once(future::ready(current))
            .chain(transitions)
            .chain(stream::once(future::ready(false)))
            .boxed())
    }

    pub fn connected_event(&self) -> RxMqttResult<EventStream<ConnectedEvent>> {
        self.inner.bridges.connected.stream()
    }

    pub fn disconnected_event(&self) -> RxMqttResult<EventStream<DisconnectedEvent>> {
        self.inner.bridges.disconnected.stream()
    }

    pub fn connecting_failed_event(&self) -> RxMqttResult<EventStream<ProcessFailedEvent>> {
        self.inner.bridges.connecting_failed.stream()
    }

    pub fn synchronizing_subscriptions_failed_event(
        &self,
    ) -> RxMqttResult<EventStream<ProcessFailedEvent>> {
        self.inner.bridges.synchronizing_subscriptions_failed.stream()
    }

    pub fn message_processed_event(&self) -> RxMqttResult<EventStream<MessageProcessedEvent>> {
        self.inner.bridges.message_processed.stream()
    }

    pub fn message_skipped_event(&self) -> RxMqttResult<EventStream<MessageSkippedEvent>> {
        self.inner.bridges.message_skipped.stream()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.client.is_connected()
    }

    pub fn is_started(&self) -> bool {
        self.inner.client.is_started()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn options(&self) -> Option<ManagedClientOptions> {
        self.inner.client.options()
    }

    pub fn pending_message_count(&self) -> usize {
        self.inner.client.pending_message_count()
    }

    pub async fn ping(&self) -> RxMqttResult<()> {
        self.inner.ensure_not_disposed()?;
        Ok(self.inner.client.ping().await?)
    }

    /// Publish directly, bypassing the managed queue
    pub async fn publish_async(&self, message: MqttMessage) -> RxMqttResult<()> {
        self.inner.ensure_not_disposed()?;
        Ok(self.inner.client.publish(message).await?)
    }

    /// Queue a message with the managed client
    pub async fn enqueue_async(&self, message: ManagedMessage) -> RxMqttResult<()> {
        self.inner.ensure_not_disposed()?;
        Ok(self.inner.client.enqueue(message).await?)
    }

    pub async fn start(&self, options: ManagedClientOptions) -> RxMqttResult<()> {
        self.inner.ensure_not_disposed()?;
        Ok(self.inner.client.start(options).await?)
    }

    pub async fn stop(&self) -> RxMqttResult<()> {
        self.inner.ensure_not_disposed()?;
        Ok(self.inner.client.stop().await?)
    }

    /// Complete every stream and dispose the managed client
    ///
    /// Synchronous and idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    #[cfg(test)]
    fn cached_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.lock_topics().keys().cloned().collect();
        topics.sort();
        topics
    }
}
