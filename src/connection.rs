//! Broker connection lifecycle with automatic recovery.
//!
//! [`ConnectionManager`] owns at most one live [`BrokerConnection`] and drives
//! the `Disconnected → Connecting → Connected` state machine. Failures never
//! surface as errors to callers; they are reported as [`ConnectionEvent`]s
//! and trigger a bounded exponential backoff (1 s, 2 s, 4 s, 8 s, 16 s by
//! default) after which automatic recovery stops until `connect()` is called
//! again.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new(connector, ConnectionConfig::default());
//! let mut events = manager.subscribe();
//! manager.connect().await;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ConnectionEvent::Connected => { /* enable chat */ }
//!         ConnectionEvent::ReconnectExhausted { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{with_timeout, BrokerChannel, BrokerConnection, BrokerConnector, BrokerEndpoint};
use crate::error::{ChatError, Result};
use crate::event::{ConnectionEvent, EventBus};

/// Default cap on consecutive automatic reconnect attempts.
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay before the first reconnect attempt.
const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Default bound on a single broker operation.
pub(crate) const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`ConnectionManager`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use wamschat_client::broker::BrokerEndpoint;
/// use wamschat_client::connection::ConnectionConfig;
///
/// let config = ConnectionConfig::new(BrokerEndpoint::default())
///     .with_max_reconnect_attempts(3)
///     .with_reconnect_base_delay(Duration::from_millis(250));
/// assert_eq!(config.reconnect_delay(3), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Where to connect.
    pub endpoint: BrokerEndpoint,
    /// Consecutive automatic reconnect attempts before giving up.
    ///
    /// Defaults to **5**.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubles per attempt.
    ///
    /// Defaults to **1 second**.
    pub reconnect_base_delay: Duration,
    /// Bound on connect, channel-open and close.
    ///
    /// Defaults to **10 seconds**.
    pub operation_timeout: Duration,
}

impl ConnectionConfig {
    /// Create a configuration for `endpoint` with default recovery settings.
    pub fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Set the reconnect attempt cap. Zero disables automatic recovery.
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the delay before the first reconnect attempt.
    #[must_use]
    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    /// Set the per-operation timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Delay before reconnect `attempt` (1-based): `base × 2^(attempt−1)`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.reconnect_base_delay.saturating_mul(1_u32 << exponent)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(BrokerEndpoint::default())
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Observable connection state.
///
/// A failed attempt is reported through [`ConnectionEvent::Error`] and lands
/// in `Disconnected`; there is no resting error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Slot {
    state: ConnectionState,
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    reconnect_attempts: u32,
    /// Bumped by every connect attempt and every explicit disconnect so that
    /// stale attempts, watchers and timers recognise they were superseded.
    generation: u64,
    reconnect_task: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

struct Shared {
    connector: Arc<dyn BrokerConnector>,
    config: ConnectionConfig,
    slot: Mutex<Slot>,
    events: EventBus<ConnectionEvent>,
}

// ── Manager handle ──────────────────────────────────────────────────

/// Owner of the single broker connection.
///
/// Cloning the handle shares the same connection; the application creates one
/// manager at startup, hands a clone to
/// [`ChannelManager::new`](crate::ChannelManager::new) and calls
/// [`disconnect`](Self::disconnect) on shutdown.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a disconnected manager. Nothing is dialled until
    /// [`connect`](Self::connect) is called.
    pub fn new(connector: impl BrokerConnector, config: ConnectionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector: Arc::new(connector),
                config,
                slot: Mutex::new(Slot {
                    state: ConnectionState::Disconnected,
                    connection: None,
                    channel: None,
                    reconnect_attempts: 0,
                    generation: 0,
                    reconnect_task: None,
                    watcher: None,
                }),
                events: EventBus::new(),
            }),
        }
    }

    /// Connect to the broker and open the connection-level channel.
    ///
    /// Does nothing while already connecting or connected. A failed attempt
    /// emits [`ConnectionEvent::Error`] and schedules a reconnect; it is not
    /// returned to the caller.
    pub async fn connect(&self) {
        self.shared.connect().await;
    }

    /// Close the connection and cancel any pending reconnect.
    ///
    /// Close errors are logged and otherwise ignored.
    pub async fn disconnect(&self) {
        self.shared.disconnect().await;
    }

    /// Treat the current connection as lost: clear it, emit
    /// [`ConnectionEvent::Disconnected`] and schedule a reconnect.
    ///
    /// No-op when already disconnected. Must be called from within a Tokio
    /// runtime.
    pub fn handle_disconnection(&self, reason: Option<String>) {
        let generation = self.shared.lock().generation;
        self.shared.handle_disconnection(generation, reason);
    }

    /// Register a listener for connection events.
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Returns `true` while a connection is established.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns `true` while a connection attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    /// Automatic reconnect attempts made since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().reconnect_attempts
    }

    /// The live connection, for opening per-stream channels.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotConnected`] unless the state is `Connected`.
    pub fn connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let slot = self.shared.lock();
        match (&slot.state, &slot.connection) {
            (ConnectionState::Connected, Some(connection)) => Ok(Arc::clone(connection)),
            _ => Err(ChatError::NotConnected),
        }
    }

    /// The channel opened alongside the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotConnected`] unless the state is `Connected`.
    pub fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let slot = self.shared.lock();
        match (&slot.state, &slot.channel) {
            (ConnectionState::Connected, Some(channel)) => Ok(Arc::clone(channel)),
            _ => Err(ChatError::NotConnected),
        }
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.shared.lock();
        f.debug_struct("ConnectionManager")
            .field("state", &slot.state)
            .field("reconnect_attempts", &slot.reconnect_attempts)
            .field("endpoint", &self.shared.config.endpoint)
            .field("listeners", &self.shared.events.listener_count())
            .finish()
    }
}

// ── State machine ───────────────────────────────────────────────────

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Boxed so the reconnect timer can call back into `connect` without a
    // recursive opaque future type.
    fn connect(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let shared = Arc::clone(self);
        Box::pin(async move {
            let generation = {
                let mut slot = shared.lock();
                if slot.state != ConnectionState::Disconnected {
                    debug!(state = ?slot.state, "connect ignored");
                    return;
                }
                slot.generation += 1;
                slot.state = ConnectionState::Connecting;
                shared.events.emit(ConnectionEvent::Connecting);
                slot.generation
            };

            info!(url = %shared.config.endpoint.url(), "connecting to broker");
            match shared.open().await {
                Ok((connection, channel)) => {
                    shared.on_connected(generation, connection, channel).await;
                }
                Err(e) => shared.on_connect_failed(generation, &e),
            }
        })
    }

    async fn open(&self) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>)> {
        let timeout = self.config.operation_timeout;
        let connection = with_timeout(
            timeout,
            "connect",
            self.connector.connect(&self.config.endpoint),
        )
        .await?;
        match with_timeout(timeout, "open channel", connection.open_channel()).await {
            Ok(channel) => Ok((connection, channel)),
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!("failed to close half-open connection: {close_err}");
                }
                Err(e)
            }
        }
    }

    async fn on_connected(
        self: &Arc<Self>,
        generation: u64,
        connection: Arc<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
    ) {
        let superseded = {
            let mut slot = self.lock();
            if slot.generation == generation {
                slot.state = ConnectionState::Connected;
                slot.reconnect_attempts = 0;
                slot.connection = Some(Arc::clone(&connection));
                slot.channel = Some(channel);
                slot.watcher = Some(self.spawn_watcher(generation, connection));
                self.events.emit(ConnectionEvent::Connected);
                None
            } else {
                Some(connection)
            }
        };

        match superseded {
            None => info!("connected to broker"),
            Some(connection) => {
                debug!("connect attempt superseded by disconnect, closing new connection");
                if let Err(e) = connection.close().await {
                    debug!("failed to close superseded connection: {e}");
                }
            }
        }
    }

    fn on_connect_failed(self: &Arc<Self>, generation: u64, error: &ChatError) {
        let mut slot = self.lock();
        if slot.generation != generation {
            debug!("connect attempt failed after disconnect: {error}");
            return;
        }
        warn!("broker connection failed: {error}");
        slot.state = ConnectionState::Disconnected;
        self.events.emit(ConnectionEvent::Error {
            detail: error.to_string(),
        });
        self.schedule_reconnect(&mut slot);
    }

    /// Watch the live connection and route its failure to
    /// [`handle_disconnection`](Self::handle_disconnection).
    fn spawn_watcher(
        self: &Arc<Self>,
        generation: u64,
        connection: Arc<dyn BrokerConnection>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = connection.closed().await;
            if let Some(shared) = weak.upgrade() {
                shared.handle_disconnection(generation, reason);
            }
        })
    }

    fn handle_disconnection(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        let mut slot = self.lock();
        if slot.state == ConnectionState::Disconnected || slot.generation != generation {
            return;
        }
        match &reason {
            Some(reason) => warn!(%reason, "broker connection lost"),
            None => warn!("broker connection closed"),
        }
        slot.state = ConnectionState::Disconnected;
        slot.connection = None;
        slot.channel = None;
        // Detach rather than abort: this may be running inside the watcher.
        slot.watcher = None;
        self.events.emit(ConnectionEvent::Disconnected { reason });
        self.schedule_reconnect(&mut slot);
    }

    fn schedule_reconnect(self: &Arc<Self>, slot: &mut Slot) {
        let max = self.config.max_reconnect_attempts;
        if slot.reconnect_attempts >= max {
            warn!(
                attempts = slot.reconnect_attempts,
                "reconnect attempts exhausted, giving up"
            );
            self.events.emit(ConnectionEvent::ReconnectExhausted {
                attempts: slot.reconnect_attempts,
            });
            return;
        }

        slot.reconnect_attempts += 1;
        let attempt = slot.reconnect_attempts;
        let delay = self.config.reconnect_delay(attempt);
        let generation = slot.generation;
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.events
            .emit(ConnectionEvent::ReconnectScheduled { attempt, delay });

        let weak: Weak<Self> = Arc::downgrade(self);
        slot.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.lock().generation != generation {
                debug!(attempt, "stale reconnect timer skipped");
                return;
            }
            shared.connect().await;
        }));
    }

    async fn disconnect(&self) {
        let connection = {
            let mut slot = self.lock();
            slot.generation += 1;
            if let Some(task) = slot.reconnect_task.take() {
                task.abort();
            }
            if let Some(watcher) = slot.watcher.take() {
                watcher.abort();
            }
            slot.channel = None;
            if slot.state != ConnectionState::Disconnected {
                slot.state = ConnectionState::Disconnected;
                self.events.emit(ConnectionEvent::Disconnected {
                    reason: Some("client shut down".into()),
                });
            }
            slot.connection.take()
        };

        if let Some(connection) = connection {
            debug!("closing broker connection");
            if let Err(e) = with_timeout(
                self.config.operation_timeout,
                "close connection",
                connection.close(),
            )
            .await
            {
                debug!("error while closing broker connection: {e}");
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.reconnect_task.take() {
            task.abort();
        }
        if let Some(watcher) = slot.watcher.take() {
            watcher.abort();
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(all(test, feature = "memory-broker"))]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::brokers::MemoryBroker;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn drain(rx: &mut UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn manager(broker: &MemoryBroker) -> ConnectionManager {
        ConnectionManager::new(broker.clone(), ConnectionConfig::default())
    }

    #[test]
    fn config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
        assert_eq!(config.operation_timeout, Duration::from_secs(10));
        assert_eq!(config.endpoint, BrokerEndpoint::default());
    }

    #[test]
    fn reconnect_delay_doubles_per_attempt() {
        let config = ConnectionConfig::default();
        let delays: Vec<u128> = (1..=5).map(|a| config.reconnect_delay(a).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn reconnect_delay_saturates() {
        let config = ConnectionConfig::default();
        assert_eq!(config.reconnect_delay(0), Duration::from_secs(1));
        assert!(config.reconnect_delay(u32::MAX) >= config.reconnect_delay(31));
    }

    #[tokio::test]
    async fn connect_emits_connecting_then_connected() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        let mut events = manager.subscribe();

        manager.connect().await;

        assert!(manager.is_connected());
        assert!(manager.connection().is_ok());
        assert!(manager.channel().is_ok());
        assert_eq!(
            drain(&mut events),
            vec![ConnectionEvent::Connecting, ConnectionEvent::Connected]
        );
    }

    #[tokio::test]
    async fn connect_while_connected_is_noop() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await;
        let mut events = manager.subscribe();

        manager.connect().await;

        assert_eq!(broker.connect_attempts(), 1);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn queries_fail_when_disconnected() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(manager.connection(), Err(ChatError::NotConnected)));
        assert!(matches!(manager.channel(), Err(ChatError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_back_off_then_give_up() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(u32::MAX);
        let manager = manager(&broker);
        let mut events = manager.subscribe();

        manager.connect().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        let events = drain(&mut events);
        let delays: Vec<Duration> = events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::ReconnectScheduled { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
        );
        assert_eq!(
            events.last(),
            Some(&ConnectionEvent::ReconnectExhausted { attempts: 5 })
        );
        let errors = events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::Error { .. }))
            .count();
        assert_eq!(errors, 6);
        assert_eq!(broker.connect_attempts(), 6);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        let manager = manager(&broker);

        manager.connect().await;
        assert_eq!(manager.reconnect_attempts(), 1);

        manager.disconnect().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure_and_resets_attempts() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let manager = manager(&broker);

        manager.connect().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(manager.is_connected());
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_triggers_reconnect() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await;
        let mut events = manager.subscribe();

        broker.drop_connections("heartbeat timeout");
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            drain(&mut events),
            vec![
                ConnectionEvent::Disconnected {
                    reason: Some("heartbeat timeout".into())
                },
                ConnectionEvent::ReconnectScheduled {
                    attempt: 1,
                    delay: Duration::from_secs(1)
                },
                ConnectionEvent::Connecting,
                ConnectionEvent::Connected,
            ]
        );
        assert!(manager.is_connected());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn handle_disconnection_is_idempotent() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(
            broker.clone(),
            ConnectionConfig::default().with_max_reconnect_attempts(0),
        );
        manager.connect().await;
        let mut events = manager.subscribe();

        manager.handle_disconnection(Some("first".into()));
        manager.handle_disconnection(Some("second".into()));

        assert_eq!(
            drain(&mut events),
            vec![
                ConnectionEvent::Disconnected {
                    reason: Some("first".into())
                },
                ConnectionEvent::ReconnectExhausted { attempts: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn explicit_disconnect_closes_connection() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await;
        assert_eq!(broker.open_connections(), 1);
        let mut events = manager.subscribe();

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(broker.open_connections(), 0);
        assert!(!manager.is_connected());
        assert_eq!(
            drain(&mut events),
            vec![ConnectionEvent::Disconnected {
                reason: Some("client shut down".into())
            }]
        );
    }

    #[tokio::test]
    async fn rejected_credentials_report_error() {
        let broker = MemoryBroker::new().with_credentials("chat", "secret");
        let manager = ConnectionManager::new(
            broker.clone(),
            ConnectionConfig::default().with_max_reconnect_attempts(0),
        );
        let mut events = manager.subscribe();

        manager.connect().await;

        let events = drain(&mut events);
        assert!(matches!(
            events.get(1),
            Some(ConnectionEvent::Error { detail }) if detail.contains("ACCESS_REFUSED")
        ));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn debug_impl_for_manager() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker);
        let _events = manager.subscribe();
        let rendered = format!("{manager:?}");
        assert!(rendered.contains("ConnectionManager"));
        assert!(rendered.contains("Disconnected"));
        assert!(rendered.contains("listeners: 1"));
    }
}
