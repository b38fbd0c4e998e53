//! Callback-to-stream adaptation
//!
//! An [`EventBridge`] turns one single-slot notification of a managed client
//! into a multicast source. The underlying handler is installed when the first
//! sink attaches and removed when the last one detaches, so a slot is never
//! claimed by an adapter nobody listens to.
//!
//! Notifications are dispatched synchronously, in the order the client raises
//! them, to a snapshot of the attached sinks. [`EventStream`] is the
//! stream-shaped sink handed to application code.

use crate::error::{RxMqttError, RxMqttResult};
use crate::transport::{ClientHandlers, HandlerSlot, ManagedClient};
use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// Receiver of bridged notifications
pub trait EventSink<T>: Send + Sync {
    fn on_next(&self, event: &T);

    /// The bridge was disposed; no further notifications follow
    fn on_completed(&self);
}

/// Selects one handler slot of a managed client
pub type SlotSelector<T> = fn(&ClientHandlers) -> &HandlerSlot<T>;

struct BridgeState<T> {
    sinks: Vec<(u64, Arc<dyn EventSink<T>>)>,
    next_id: u64,
    disposed: bool,
}

struct BridgeInner<T> {
    client: Arc<dyn ManagedClient>,
    select: SlotSelector<T>,
    state: Mutex<BridgeState<T>>,
}

impl<T: Send + 'static> BridgeInner<T> {
    fn slot(&self) -> &HandlerSlot<T> {
        (self.select)(self.client.handlers())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BridgeState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, event: &T) {
        let sinks: Vec<Arc<dyn EventSink<T>>> = {
            let state = self.lock();
            if state.disposed {
                return;
            }
            state.sinks.iter().map(|(_, sink)| sink.clone()).collect()
        };
        for sink in sinks {
            sink.on_next(event);
        }
    }

    fn detach(&self, id: u64) {
        let mut state = self.lock();
        state.sinks.retain(|(sink_id, _)| *sink_id != id);
        if state.sinks.is_empty() && !state.disposed {
            self.slot().clear();
            debug!(event = self.slot().name(), "Last sink detached, handler removed");
        }
    }
}

/// Reference-counted multicast over one handler slot
pub struct EventBridge<T> {
    inner: Arc<BridgeInner<T>>,
}

impl<T> Clone for EventBridge<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> EventBridge<T> {
    pub fn new(client: Arc<dyn ManagedClient>, select: SlotSelector<T>) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                client,
                select,
                state: Mutex::new(BridgeState {
                    sinks: Vec::new(),
                    next_id: 0,
                    disposed: false,
                }),
            }),
        }
    }

    /// Name of the bridged notification
    pub fn name(&self) -> &'static str {
        self.inner.slot().name()
    }

    /// Attach a sink, installing the underlying handler if this is the first
    ///
    /// A failed handler registration is returned to the caller and leaves the
    /// bridge inactive. Fails with [`RxMqttError::Disposed`] after disposal.
    pub fn attach(&self, sink: Arc<dyn EventSink<T>>) -> RxMqttResult<BridgeGuard<T>> {
        let mut state = self.inner.lock();
        if state.disposed {
            return Err(RxMqttError::Disposed);
        }

        if state.sinks.is_empty() {
            let weak = Arc::downgrade(&self.inner);
            let slot = self.inner.slot();
            slot.set(Arc::new(move |event: T| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(&event);
                }
            }))
            .map_err(|source| RxMqttError::Registration {
                event: slot.name(),
                source,
            })?;
            debug!(event = slot.name(), "First sink attached, handler installed");
        }

        let id = state.next_id;
        state.next_id += 1;
        state.sinks.push((id, sink));

        Ok(BridgeGuard {
            bridge: Arc::downgrade(&self.inner),
            id,
        })
    }

    /// Attach a new [`EventStream`]
    pub fn stream(&self) -> RxMqttResult<EventStream<T>>
    where
        T: Clone,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink = Arc::new(ChannelSink {
            sender: Mutex::new(Some(sender)),
        });
        let guard = self.attach(sink)?;
        Ok(EventStream {
            receiver,
            _guard: guard,
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().sinks.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Complete every attached sink and refuse later attaches
    ///
    /// Sinks are completed synchronously, before this call returns.
    pub fn dispose(&self) {
        let sinks = {
            let mut state = self.inner.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            self.inner.slot().clear();
            std::mem::take(&mut state.sinks)
        };
        debug!(event = self.name(), sinks = sinks.len(), "Bridge disposed");
        for (_, sink) in sinks {
            sink.on_completed();
        }
    }
}

/// Keeps a sink attached; detaches it on drop
pub struct BridgeGuard<T: Send + 'static> {
    bridge: Weak<BridgeInner<T>>,
    id: u64,
}

impl<T: Send + 'static> Drop for BridgeGuard<T> {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.detach(self.id);
        }
    }
}

struct ChannelSink<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone + Send> EventSink<T> for ChannelSink<T> {
    fn on_next(&self, event: &T) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = sender.as_ref() {
            let _ = sender.send(event.clone());
        }
    }

    fn on_completed(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Stream of notifications for one subscriber
///
/// Buffered without bound, so a slow consumer never loses or reorders
/// notifications. Ends when the bridge is disposed; dropping it detaches.
pub struct EventStream<T: Send + 'static> {
    receiver: mpsc::UnboundedReceiver<T>,
    _guard: BridgeGuard<T>,
}

impl<T: Send + 'static> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_recv(cx)
    }
}
