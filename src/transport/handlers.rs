//! Single-slot notification handlers
//!
//! A managed client exposes one handler slot per notification kind. Setting a
//! slot replaces the previous handler; there is never more than one listener
//! per slot, which is why the stream layer multiplexes on top of it.

use crate::protocol::{
    ConnectedEvent, DisconnectedEvent, MessageProcessedEvent, MessageSkippedEvent,
    ProcessFailedEvent, ReceivedMessage,
};
use crate::transport::ClientError;
use std::sync::{Arc, RwLock};

/// Callback stored in a [`HandlerSlot`]
pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

struct SlotState<T> {
    handler: Option<Handler<T>>,
    closed: bool,
}

/// A slot holding at most one handler
pub struct HandlerSlot<T> {
    name: &'static str,
    state: RwLock<SlotState<T>>,
}

impl<T> HandlerSlot<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: RwLock::new(SlotState {
                handler: None,
                closed: false,
            }),
        }
    }

    /// Name of the notification this slot carries
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Install a handler, replacing any previous one
    pub fn set(&self, handler: Handler<T>) -> Result<(), ClientError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(ClientError::HandlerRegistration(self.name));
        }
        state.handler = Some(handler);
        Ok(())
    }

    /// Remove the current handler
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.handler = None;
    }

    /// Remove the current handler and refuse any later registration
    pub fn close(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.handler = None;
        state.closed = true;
    }

    pub fn is_set(&self) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.handler.is_some()
    }

    /// Deliver an event to the current handler, if any
    ///
    /// The handler is cloned out of the lock before it runs, so a handler may
    /// itself set or clear this slot.
    pub fn invoke(&self, event: T) -> bool {
        let handler = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state.handler.clone()
        };
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }
}

/// The notification slots of a managed client
pub struct ClientHandlers {
    pub connected: HandlerSlot<ConnectedEvent>,
    pub disconnected: HandlerSlot<DisconnectedEvent>,
    pub connecting_failed: HandlerSlot<ProcessFailedEvent>,
    pub synchronizing_subscriptions_failed: HandlerSlot<ProcessFailedEvent>,
    pub message_processed: HandlerSlot<MessageProcessedEvent>,
    pub message_skipped: HandlerSlot<MessageSkippedEvent>,
    pub message_received: HandlerSlot<ReceivedMessage>,
}

impl ClientHandlers {
    pub fn new() -> Self {
        Self {
            connected: HandlerSlot::new("connected"),
            disconnected: HandlerSlot::new("disconnected"),
            connecting_failed: HandlerSlot::new("connecting_failed"),
            synchronizing_subscriptions_failed: HandlerSlot::new(
                "synchronizing_subscriptions_failed",
            ),
            message_processed: HandlerSlot::new("message_processed"),
            message_skipped: HandlerSlot::new("message_skipped"),
            message_received: HandlerSlot::new("message_received"),
        }
    }

    /// Close every slot; used when the owning client is disposed
    pub fn close_all(&self) {
        self.connected.close();
        self.disconnected.close();
        self.connecting_failed.close();
        self.synchronizing_subscriptions_failed.close();
        self.message_processed.close();
        self.message_skipped.close();
        self.message_received.close();
    }
}

impl Default for ClientHandlers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_invoke_without_handler() {
        let slot: HandlerSlot<u32> = HandlerSlot::new("test");
        assert!(!slot.is_set());
        assert!(!slot.invoke(1));
    }

    #[test]
    fn test_set_replaces_previous_handler() {
        let slot: HandlerSlot<usize> = HandlerSlot::new("test");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        slot.set(Arc::new(move |n| {
            counter.fetch_add(n, Ordering::SeqCst);
        }))
        .unwrap();
        let counter = second.clone();
        slot.set(Arc::new(move |n| {
            counter.fetch_add(n, Ordering::SeqCst);
        }))
        .unwrap();

        assert!(slot.invoke(5));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_clear_removes_handler() {
        let slot: HandlerSlot<u32> = HandlerSlot::new("test");
        slot.set(Arc::new(|_| {})).unwrap();
        assert!(slot.is_set());
        slot.clear();
        assert!(!slot.is_set());
    }

    #[test]
    fn test_closed_slot_rejects_registration() {
        let slot: HandlerSlot<u32> = HandlerSlot::new("message_received");
        slot.set(Arc::new(|_| {})).unwrap();
        slot.close();

        assert!(!slot.is_set());
        assert_eq!(
            slot.set(Arc::new(|_| {})),
            Err(ClientError::HandlerRegistration("message_received"))
        );
    }

    #[test]
    fn test_handler_may_clear_its_own_slot() {
        let slot: Arc<HandlerSlot<u32>> = Arc::new(HandlerSlot::new("test"));
        let weak = Arc::downgrade(&slot);
        slot.set(Arc::new(move |_| {
            if let Some(slot) = weak.upgrade() {
                slot.clear();
            }
        }))
        .unwrap();

        assert!(slot.invoke(1));
        assert!(!slot.is_set());
    }

    #[test]
    fn test_close_all() {
        let handlers = ClientHandlers::new();
        handlers.message_received.set(Arc::new(|_| {})).unwrap();
        handlers.close_all();
        assert!(!handlers.message_received.is_set());
        assert!(handlers.connected.set(Arc::new(|_| {})).is_err());
    }
}
