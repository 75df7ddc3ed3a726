//! Events emitted by the connection and channel managers, and the
//! [`EventBus`] that fans them out to listeners.
//!
//! Every listener registered with [`EventBus::subscribe`] receives every
//! event emitted after registration, exactly once and in emission order.
//! Listener queues are unbounded so a slow listener never causes another
//! listener to miss events; dropping the receiver unregisters it.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::ChatMessage;

/// Connection lifecycle events emitted by
/// [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection attempt started.
    Connecting,
    /// The connection and its control channel are open.
    Connected,
    /// An established connection was lost or closed.
    Disconnected {
        /// Why the connection went away, if known.
        reason: Option<String>,
    },
    /// A connection attempt failed.
    Error {
        /// Failure detail reported by the broker layer.
        detail: String,
    },
    /// A reconnect attempt has been scheduled.
    ReconnectScheduled {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt runs.
        delay: Duration,
    },
    /// Automatic recovery gave up; only an explicit `connect()` retries.
    ReconnectExhausted {
        /// Number of attempts that were made.
        attempts: u32,
    },
}

/// Channel lifecycle and inbound message events emitted by
/// [`ChannelManager`](crate::ChannelManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A channel's stream was declared and bound.
    ChannelCreated { channel: String },
    /// A consumer was attached to a channel.
    ChannelSubscribed { channel: String },
    /// The consumer of a channel was cancelled.
    ChannelUnsubscribed { channel: String },
    /// A message arrived on a chat channel.
    MessageReceived {
        channel: String,
        message: ChatMessage,
    },
    /// A notification arrived on the user's notification channel.
    UserNotificationReceived { notification: ChatMessage },
}

/// Observer registry delivering each emitted event to every live listener.
#[derive(Debug)]
pub struct EventBus<E> {
    listeners: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone> EventBus<E> {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. It receives events emitted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `event` to every listener, pruning listeners whose receiver
    /// has been dropped.
    pub fn emit(&self, event: E) {
        let mut listeners = self.lock();
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
        if listeners.is_empty() {
            debug!("event emitted with no listeners");
        }
    }

    /// Number of registered listeners (including ones not yet pruned).
    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<E>>> {
        // A panic while holding this lock cannot leave the Vec inconsistent.
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn every_listener_sees_every_event_in_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(ConnectionEvent::Connecting);
        bus.emit(ConnectionEvent::Connected);

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::Connecting);
            assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::Connected);
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn late_listener_only_sees_later_events() {
        let bus = EventBus::new();
        bus.emit(ConnectionEvent::Connecting);
        let mut rx = bus.subscribe();
        bus.emit(ConnectionEvent::Connected);

        assert_eq!(rx.try_recv().unwrap(), ConnectionEvent::Connected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_listeners_are_pruned() {
        let bus: EventBus<ConnectionEvent> = EventBus::new();
        let rx = bus.subscribe();
        let _kept = bus.subscribe();
        assert_eq!(bus.listener_count(), 2);

        drop(rx);
        bus.emit(ConnectionEvent::Connecting);
        assert_eq!(bus.listener_count(), 1);
    }
}
