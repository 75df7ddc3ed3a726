//! Named chat channels backed by durable broker streams.
//!
//! [`ChannelManager`] sits on top of a [`ConnectionManager`] and turns
//! channel-level requests into stream primitives. Every channel `name` maps to
//! a stream `chat-stream-{name}` bound to the topic exchange under `name`,
//! and gets its own broker channel so one subscription never blocks another.
//!
//! Guarantees:
//!
//! - Creating a channel twice declares its stream once; concurrent callers
//!   share the same [`Channel`].
//! - A channel has at most one consumer. Concurrent subscribes produce one
//!   consumer and one join notice.
//! - Inbound deliveries are decoded, emitted as [`ChannelEvent`]s and only
//!   then acknowledged.
//!
//! # Example
//!
//! ```rust,ignore
//! let channels = ChannelManager::new(connection.clone(), ChannelConfig::default());
//! let mut events = channels.subscribe();
//!
//! channels.subscribe_to_channel("general", "alice").await?;
//! channels.subscribe_to_user_notifications("alice").await?;
//! channels.send_message("general", "alice", "hello").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ChannelEvent::MessageReceived { channel, message } = event {
//!         println!("#{channel}: {message:?}");
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{
    with_timeout, BrokerChannel, BrokerConnection, ConsumeOptions, Delivery, PublishOptions,
    StreamOffset, StreamOptions,
};
use crate::connection::{ConnectionManager, DEFAULT_OPERATION_TIMEOUT};
use crate::error::{ChatError, Result};
use crate::event::{ChannelEvent, EventBus};
use crate::protocol::{notification_channel_name, ChatMessage, NOTIFICATION_CHANNEL_PREFIX};

/// Default topic exchange channel streams are bound to.
const DEFAULT_EXCHANGE: &str = "amq.topic";

/// Default prefix turning a channel name into a stream name.
const DEFAULT_STREAM_PREFIX: &str = "chat-stream-";

/// Default stream retention.
const DEFAULT_MAX_AGE: &str = "1h";

/// Default per-channel prefetch.
const DEFAULT_PREFETCH: u16 = 1000;

/// Exchange that routes straight to the queue named by the routing key.
const DIRECT_EXCHANGE: &str = "";

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`ChannelManager`].
///
/// # Example
///
/// ```
/// use wamschat_client::channel::ChannelConfig;
///
/// let config = ChannelConfig::new().with_max_age("7D").with_prefetch(50);
/// assert_eq!(config.stream_name("general"), "chat-stream-general");
/// assert_eq!(config.max_age, "7D");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Topic exchange each channel stream is bound to.
    ///
    /// Defaults to **`amq.topic`**.
    pub exchange: String,
    /// Prefix prepended to the channel name to form the stream name.
    ///
    /// Defaults to **`chat-stream-`**.
    pub stream_prefix: String,
    /// Retention bound passed as `x-max-age`.
    ///
    /// Defaults to **`1h`**.
    pub max_age: String,
    /// Unacknowledged deliveries allowed in flight per channel.
    ///
    /// Defaults to **1000**.
    pub prefetch: u16,
    /// Bound on each broker operation.
    ///
    /// Defaults to **10 seconds**.
    pub operation_timeout: Duration,
}

impl ChannelConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_owned(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_owned(),
            max_age: DEFAULT_MAX_AGE.to_owned(),
            prefetch: DEFAULT_PREFETCH,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Set the topic exchange.
    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Set the stream name prefix.
    #[must_use]
    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = prefix.into();
        self
    }

    /// Set the stream retention.
    #[must_use]
    pub fn with_max_age(mut self, max_age: impl Into<String>) -> Self {
        self.max_age = max_age.into();
        self
    }

    /// Set the per-channel prefetch.
    #[must_use]
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the broker operation timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Stream backing the channel called `channel`.
    pub fn stream_name(&self, channel: &str) -> String {
        format!("{}{channel}", self.stream_prefix)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── Channel ─────────────────────────────────────────────────────────

/// What a channel carries, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// A chat room.
    Chat,
    /// A `user-notifications-{username}` feed.
    Notification,
}

impl ChannelKind {
    /// Classify a channel name.
    pub fn of(name: &str) -> Self {
        if name.starts_with(NOTIFICATION_CHANNEL_PREFIX) {
            Self::Notification
        } else {
            Self::Chat
        }
    }
}

/// The broker channel a [`Channel`] talks through, and the connection it was
/// opened on.
struct Link {
    connection: Arc<dyn BrokerConnection>,
    broker: Arc<dyn BrokerChannel>,
}

impl Link {
    fn opened_on(&self, connection: &Arc<dyn BrokerConnection>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.connection), Arc::as_ptr(connection))
    }
}

struct ActiveConsumer {
    tag: String,
    /// Connection the consumer was opened on.
    connection: Arc<dyn BrokerConnection>,
    pump: JoinHandle<()>,
}

impl ActiveConsumer {
    /// Live while it belongs to the current connection and its pump still
    /// runs. A replaced connection takes its consumers with it even before
    /// the pump has observed the closed delivery queue.
    fn is_live_on(&self, current: Option<&Arc<dyn BrokerConnection>>) -> bool {
        current.is_some_and(|connection| {
            std::ptr::addr_eq(Arc::as_ptr(&self.connection), Arc::as_ptr(connection))
        }) && !self.pump.is_finished()
    }
}

impl Drop for ActiveConsumer {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// A registered channel: one declared stream and at most one consumer.
pub struct Channel {
    name: String,
    stream: String,
    kind: ChannelKind,
    link: Mutex<Link>,
    consumer: tokio::sync::Mutex<Option<ActiveConsumer>>,
    connection: ConnectionManager,
}

impl Channel {
    fn new(name: &str, stream: String, link: Link, connection: ConnectionManager) -> Self {
        Self {
            name: name.to_owned(),
            stream,
            kind: ChannelKind::of(name),
            link: Mutex::new(link),
            consumer: tokio::sync::Mutex::new(None),
            connection,
        }
    }

    /// Channel name, also the routing key on the topic exchange.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the backing stream.
    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Returns `true` while a consumer is attached and receiving.
    pub async fn is_subscribed(&self) -> bool {
        let consumer = self.consumer.lock().await;
        self.live(&consumer).is_some()
    }

    /// Tag of the attached consumer, if any.
    pub async fn consumer_tag(&self) -> Option<String> {
        let consumer = self.consumer.lock().await;
        self.live(&consumer).map(|consumer| consumer.tag.clone())
    }

    fn live<'a>(&self, consumer: &'a Option<ActiveConsumer>) -> Option<&'a ActiveConsumer> {
        let current = self.connection.connection().ok();
        consumer
            .as_ref()
            .filter(|consumer| consumer.is_live_on(current.as_ref()))
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("stream", &self.stream)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// ── Manager ─────────────────────────────────────────────────────────

type Registry = HashMap<String, Arc<OnceCell<Arc<Channel>>>>;

/// Registry of named channels over a shared [`ConnectionManager`].
///
/// Cloning the handle shares the same registry.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

struct Inner {
    connection: ConnectionManager,
    config: ChannelConfig,
    registry: Mutex<Registry>,
    active_channel: Mutex<Option<String>>,
    notification_channel: Mutex<Option<String>>,
    events: Arc<EventBus<ChannelEvent>>,
}

impl ChannelManager {
    /// Create a manager with an empty registry.
    pub fn new(connection: ConnectionManager, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                config,
                registry: Mutex::new(HashMap::new()),
                active_channel: Mutex::new(None),
                notification_channel: Mutex::new(None),
                events: Arc::new(EventBus::new()),
            }),
        }
    }

    /// Register a listener for channel events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Declare and bind the stream for `name`, or return the existing
    /// channel without touching the broker.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotConnected`] without a live connection, or the broker
    /// error that failed the declaration. A failed creation can be retried.
    pub async fn create_channel(&self, name: &str) -> Result<Arc<Channel>> {
        let cell = {
            let mut registry = lock(&self.inner.registry);
            Arc::clone(registry.entry(name.to_owned()).or_default())
        };
        let channel = cell.get_or_try_init(|| self.inner.declare(name)).await?;
        Ok(Arc::clone(channel))
    }

    /// Attach a consumer to `name` (creating the channel if needed), replaying
    /// its stream from the beginning, then announce `username` with a join
    /// notice.
    ///
    /// No-op when a consumer is already attached.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotConnected`] without a live connection, or the broker
    /// error that failed the subscription.
    pub async fn subscribe_to_channel(&self, name: &str, username: &str) -> Result<()> {
        let channel = self.create_channel(name).await?;
        self.inner.attach(&channel, Some(username)).await
    }

    /// Announce that `username` left, then cancel the consumer on `name`.
    ///
    /// No-op for unknown channels and channels without a consumer. When the
    /// cancel fails the local consumer is still dropped and the
    /// unsubscribed event still fires.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotConnected`] without a live connection, or the error
    /// the broker returned for the cancel.
    pub async fn unsubscribe_from_channel(&self, name: &str, username: &str) -> Result<()> {
        let Some(channel) = self.channel(name) else {
            debug!(channel = %name, "unsubscribe from unknown channel ignored");
            return Ok(());
        };
        self.inner.detach(&channel, username).await
    }

    /// Publish a chat message from `username`. Surrounding whitespace is
    /// trimmed from `content`.
    ///
    /// # Errors
    ///
    /// [`ChatError::ChannelNotFound`] if `name` has not been created, or the
    /// publish failure.
    pub async fn send_message(
        &self,
        name: &str,
        username: &str,
        content: &str,
    ) -> Result<ChatMessage> {
        let channel = self
            .channel(name)
            .ok_or_else(|| ChatError::ChannelNotFound(name.to_owned()))?;
        let message = ChatMessage::user(name, username, content);
        self.inner.publish(&channel, &message).await?;
        Ok(message)
    }

    /// Publish a system notice. Silently does nothing if `name` has not been
    /// created.
    ///
    /// # Errors
    ///
    /// The publish failure for a registered channel.
    pub async fn send_system_message(&self, name: &str, content: &str) -> Result<()> {
        let Some(channel) = self.channel(name) else {
            debug!(channel = %name, "system message for unknown channel dropped");
            return Ok(());
        };
        self.inner
            .publish(&channel, &ChatMessage::system(name, content))
            .await
    }

    /// Subscribe to `user-notifications-{username}`. Unlike chat channels no
    /// join notice is published.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe_to_channel`](Self::subscribe_to_channel).
    pub async fn subscribe_to_user_notifications(&self, username: &str) -> Result<()> {
        let channel = self
            .create_channel(&notification_channel_name(username))
            .await?;
        self.inner.attach(&channel, None).await
    }

    /// Tell `to` that `from` opened the direct-message channel `dm_channel`.
    ///
    /// The recipient's notification channel is created if needed, so the
    /// notice is waiting even if `to` has never subscribed. Failures are
    /// logged and never returned.
    pub async fn send_dm_initiation_notification(&self, from: &str, to: &str, dm_channel: &str) {
        let name = notification_channel_name(to);
        let sent = async {
            let channel = self.create_channel(&name).await?;
            let message = ChatMessage::dm_initiation(from, to, dm_channel);
            self.inner.publish(&channel, &message).await
        }
        .await;
        match sent {
            Ok(()) => info!(%from, %to, %dm_channel, "dm initiation sent"),
            Err(err) => error!(%from, %to, %dm_channel, error = %err, "failed to send dm initiation"),
        }
    }

    /// Unsubscribe `username` from every subscribed channel, continuing past
    /// failures. Returns the channels that failed.
    pub async fn leave_all(&self, username: &str) -> Vec<String> {
        let mut failed = Vec::new();
        for name in self.channels() {
            let Some(channel) = self.channel(&name) else {
                continue;
            };
            if !channel.is_subscribed().await {
                continue;
            }
            if let Err(err) = self.inner.detach(&channel, username).await {
                warn!(channel = %name, error = %err, "failed to leave channel");
                failed.push(name);
            }
        }
        failed
    }

    /// Names of all created channels, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.registry)
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Look up a created channel.
    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        lock(&self.inner.registry)
            .get(name)
            .and_then(|cell| cell.get().cloned())
    }

    /// The chat channel most recently subscribed to.
    pub fn active_channel(&self) -> Option<String> {
        lock(&self.inner.active_channel).clone()
    }

    /// The current user's notification channel, once subscribed.
    pub fn notification_channel(&self) -> Option<String> {
        lock(&self.inner.notification_channel).clone()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// The connection manager this registry runs on.
    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.channels())
            .field("active_channel", &self.active_channel())
            .field("notification_channel", &self.notification_channel())
            .field("listeners", &self.inner.events.listener_count())
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        with_timeout(self.config.operation_timeout, operation, fut).await
    }

    async fn open_link(&self, connection: Arc<dyn BrokerConnection>) -> Result<Link> {
        let broker = self.timed("open channel", connection.open_channel()).await?;
        if let Err(err) = self
            .timed("set prefetch", broker.set_prefetch(self.config.prefetch))
            .await
        {
            close_quietly(&broker).await;
            return Err(err);
        }
        Ok(Link { connection, broker })
    }

    async fn declare(&self, name: &str) -> Result<Arc<Channel>> {
        let link = self.open_link(self.connection.connection()?).await?;
        let stream = self.config.stream_name(name);
        let options = StreamOptions::durable(self.config.max_age.clone());

        let declared = async {
            self.timed("declare stream", link.broker.declare_stream(&stream, &options))
                .await?;
            self.timed(
                "bind stream",
                link.broker.bind(&stream, &self.config.exchange, name),
            )
            .await
        }
        .await;
        if let Err(err) = declared {
            warn!(channel = %name, %stream, error = %err, "channel creation failed");
            close_quietly(&link.broker).await;
            return Err(err);
        }

        info!(channel = %name, %stream, "channel created");
        let channel = Arc::new(Channel::new(name, stream, link, self.connection.clone()));
        self.events.emit(ChannelEvent::ChannelCreated {
            channel: name.to_owned(),
        });
        Ok(channel)
    }

    /// The broker channel for `channel` on the current connection, reopening
    /// it when the connection has been replaced since it was opened.
    async fn broker_for(&self, channel: &Channel) -> Result<Arc<dyn BrokerChannel>> {
        let connection = self.connection.connection()?;
        {
            let link = channel.lock_link();
            if link.opened_on(&connection) {
                return Ok(Arc::clone(&link.broker));
            }
        }
        debug!(channel = %channel.name, "reopening broker channel on new connection");
        let link = self.open_link(connection).await?;
        let broker = Arc::clone(&link.broker);
        *channel.lock_link() = link;
        Ok(broker)
    }

    async fn publish(&self, channel: &Channel, message: &ChatMessage) -> Result<()> {
        let broker = self.broker_for(channel).await?;
        let body = message.encode()?;
        self.timed(
            "publish",
            broker.publish(
                DIRECT_EXCHANGE,
                &channel.stream,
                body,
                &PublishOptions::persistent(),
            ),
        )
        .await?;
        debug!(channel = %channel.name, kind = message.kind(), id = message.id(), "message published");
        Ok(())
    }

    /// Attach a consumer unless one is live. `join` names the user to
    /// announce once attached.
    async fn attach(&self, channel: &Channel, join: Option<&str>) -> Result<()> {
        // Held until the join notice is out so concurrent subscribers see
        // the consumer and back off.
        let mut consumer = channel.consumer.lock().await;
        if channel.live(&consumer).is_some() {
            debug!(channel = %channel.name, "already subscribed");
            return Ok(());
        }
        if consumer.take().is_some() {
            debug!(channel = %channel.name, "discarding consumer lost with its connection");
        }

        let broker = self.broker_for(channel).await?;
        let connection = Arc::clone(&channel.lock_link().connection);
        let subscription = self
            .timed(
                "subscribe",
                broker.subscribe(
                    &channel.stream,
                    &ConsumeOptions::from_offset(StreamOffset::First),
                ),
            )
            .await?;
        let pump = tokio::spawn(pump(
            channel.name.clone(),
            channel.kind,
            broker,
            subscription.deliveries,
            Arc::clone(&self.events),
            self.config.operation_timeout,
        ));
        *consumer = Some(ActiveConsumer {
            tag: subscription.consumer_tag,
            connection,
            pump,
        });

        let slot = match channel.kind {
            ChannelKind::Chat => &self.active_channel,
            ChannelKind::Notification => &self.notification_channel,
        };
        *lock(slot) = Some(channel.name.clone());
        info!(channel = %channel.name, "subscribed");

        if let Some(username) = join {
            let notice = ChatMessage::system(&channel.name, format!("{username} joined the channel"));
            if let Err(err) = self.publish(channel, &notice).await {
                warn!(channel = %channel.name, error = %err, "failed to publish join notice");
            }
        }

        self.events.emit(ChannelEvent::ChannelSubscribed {
            channel: channel.name.clone(),
        });
        Ok(())
    }

    async fn detach(&self, channel: &Channel, username: &str) -> Result<()> {
        let mut consumer = channel.consumer.lock().await;
        if channel.live(&consumer).is_none() {
            // A consumer whose queue closed with the connection is already gone.
            *consumer = None;
            return Ok(());
        }

        let broker = self.broker_for(channel).await?;
        if channel.kind == ChannelKind::Chat {
            let notice = ChatMessage::system(&channel.name, format!("{username} left the channel"));
            if let Err(err) = self.publish(channel, &notice).await {
                warn!(channel = %channel.name, error = %err, "failed to publish leave notice");
            }
        }

        let Some(active) = consumer.take() else {
            return Ok(());
        };
        let cancelled = self.timed("cancel consumer", broker.cancel(&active.tag)).await;
        drop(active);

        for slot in [&self.active_channel, &self.notification_channel] {
            let mut current = lock(slot);
            if current.as_deref() == Some(channel.name.as_str()) {
                *current = None;
            }
        }
        self.events.emit(ChannelEvent::ChannelUnsubscribed {
            channel: channel.name.clone(),
        });

        match cancelled {
            Ok(()) => {
                info!(channel = %channel.name, "unsubscribed");
                Ok(())
            }
            Err(err) => {
                warn!(channel = %channel.name, error = %err, "consumer cancel failed");
                Err(err)
            }
        }
    }
}

/// Deliver each message of one subscription to listeners, acknowledging it
/// afterwards. Undecodable entries are acknowledged too so they are not
/// delivered again.
async fn pump(
    channel: String,
    kind: ChannelKind,
    broker: Arc<dyn BrokerChannel>,
    mut deliveries: mpsc::Receiver<Delivery>,
    events: Arc<EventBus<ChannelEvent>>,
    ack_timeout: Duration,
) {
    while let Some(delivery) = deliveries.recv().await {
        match ChatMessage::decode(&delivery.body) {
            Ok(message) => events.emit(match kind {
                ChannelKind::Chat => ChannelEvent::MessageReceived {
                    channel: channel.clone(),
                    message,
                },
                ChannelKind::Notification => {
                    ChannelEvent::UserNotificationReceived { notification: message }
                }
            }),
            Err(err) => warn!(
                %channel,
                delivery_tag = delivery.delivery_tag,
                error = %err,
                body = %delivery.body_text(),
                "dropping undecodable message"
            ),
        }

        if let Err(err) = with_timeout(ack_timeout, "ack", broker.ack(delivery.delivery_tag)).await {
            warn!(%channel, delivery_tag = delivery.delivery_tag, error = %err, "ack failed");
        }
    }
    debug!(%channel, "delivery queue closed");
}

async fn close_quietly(broker: &Arc<dyn BrokerChannel>) {
    if let Err(err) = broker.close().await {
        debug!(error = %err, "ignoring channel close failure");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.exchange, "amq.topic");
        assert_eq!(config.stream_prefix, "chat-stream-");
        assert_eq!(config.max_age, "1h");
        assert_eq!(config.prefetch, 1000);
        assert_eq!(config.operation_timeout, Duration::from_secs(10));
    }

    #[test]
    fn stream_names_use_prefix_for_every_kind() {
        let config = ChannelConfig::new();
        assert_eq!(config.stream_name("general"), "chat-stream-general");
        assert_eq!(
            config.stream_name("user-notifications-bob"),
            "chat-stream-user-notifications-bob"
        );
        let custom = config.with_stream_prefix("room-");
        assert_eq!(custom.stream_name("general"), "room-general");
    }

    #[test]
    fn kind_follows_naming_convention() {
        assert_eq!(ChannelKind::of("general"), ChannelKind::Chat);
        assert_eq!(ChannelKind::of("dm-alice-bob"), ChannelKind::Chat);
        assert_eq!(
            ChannelKind::of("user-notifications-bob"),
            ChannelKind::Notification
        );
    }

    #[cfg(feature = "memory-broker")]
    mod with_memory_broker {
        use super::*;
        use crate::brokers::MemoryBroker;
        use crate::connection::ConnectionConfig;

        async fn connected(broker: &MemoryBroker) -> ChannelManager {
            let connection = ConnectionManager::new(broker.clone(), ConnectionConfig::default());
            connection.connect().await;
            assert!(connection.is_connected());
            ChannelManager::new(connection, ChannelConfig::default())
        }

        #[tokio::test]
        async fn create_requires_connection() {
            let connection =
                ConnectionManager::new(MemoryBroker::new(), ConnectionConfig::default());
            let channels = ChannelManager::new(connection, ChannelConfig::default());

            let err = channels.create_channel("general").await.unwrap_err();
            assert!(matches!(err, ChatError::NotConnected));
            assert!(channels.channels().is_empty());
            assert!(channels.channel("general").is_none());
        }

        #[tokio::test]
        async fn channel_exposes_names_and_kind() {
            let broker = MemoryBroker::new();
            let channels = connected(&broker).await;

            let channel = channels.create_channel("general").await.unwrap();
            assert_eq!(channel.name(), "general");
            assert_eq!(channel.stream_name(), "chat-stream-general");
            assert_eq!(channel.kind(), ChannelKind::Chat);
            assert!(!channel.is_subscribed().await);
            assert!(channel.consumer_tag().await.is_none());
        }

        #[tokio::test]
        async fn failed_declaration_leaves_no_entry() {
            let broker = MemoryBroker::new();
            let channels = connected(&broker).await;

            // Pre-declare with different retention so the manager's
            // declaration is refused.
            let raw = channels.connection().channel().unwrap();
            raw.declare_stream("chat-stream-general", &StreamOptions::durable("7D"))
                .await
                .unwrap();

            assert!(channels.create_channel("general").await.is_err());
            assert!(channels.channels().is_empty());

            let relaxed = ChannelManager::new(
                channels.connection().clone(),
                ChannelConfig::new().with_max_age("7D"),
            );
            assert!(relaxed.create_channel("general").await.is_ok());
            assert_eq!(relaxed.channels(), vec!["general".to_owned()]);
        }

        #[tokio::test]
        async fn debug_lists_channels() {
            let broker = MemoryBroker::new();
            let channels = connected(&broker).await;
            channels.create_channel("general").await.unwrap();

            let _events = channels.subscribe();

            let rendered = format!("{channels:?}");
            assert!(rendered.contains("ChannelManager"));
            assert!(rendered.contains("general"));
            assert!(rendered.contains("listeners: 1"));
        }
    }
}
