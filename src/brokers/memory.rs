//! In-process loopback broker.
//!
//! [`MemoryBroker`] implements the [`broker`](crate::broker) traits entirely
//! in memory. It keeps an append-only log per stream, replays it from the
//! requested offset to every consumer, routes exchange publishes through
//! topic bindings (`*` matches one word, `#` zero or more) and tracks
//! acknowledgments per channel, the way a stream-capable AMQP broker would.
//!
//! It also exposes knobs for exercising failure paths: scripted connect
//! failures, login checks and forced connection loss.
//!
//! # Example
//!
//! ```rust
//! # async fn example() -> Result<(), wamschat_client::ChatError> {
//! use wamschat_client::broker::{BrokerConnector, BrokerEndpoint, PublishOptions, StreamOptions};
//! use wamschat_client::MemoryBroker;
//!
//! let broker = MemoryBroker::new();
//! let connection = broker.connect(&BrokerEndpoint::default()).await?;
//! let channel = connection.open_channel().await?;
//! channel.declare_stream("chat-stream-general", &StreamOptions::durable("1h")).await?;
//! channel
//!     .publish("", "chat-stream-general", b"{}".to_vec(), &PublishOptions::persistent())
//!     .await?;
//! assert_eq!(broker.stream_bodies("chat-stream-general").len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::broker::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerEndpoint, ConsumeOptions, Delivery,
    PublishOptions, StreamOffset, StreamOptions, Subscription,
};
use crate::error::{ChatError, Result};
use crate::protocol::ChatMessage;

/// Delivery queue capacity for consumers on channels without a prefetch.
const DEFAULT_DELIVERY_BUFFER: usize = 64;

/// Name of the exchange that routes by queue name.
const DEFAULT_EXCHANGE: &str = "";

/// `None` while open, `Some(reason)` once closed (`Some(None)` = clean close).
type CloseSignal = watch::Sender<Option<Option<String>>>;

// ── Broker ──────────────────────────────────────────────────────────

/// Loopback broker shared by every connection it hands out.
///
/// Cloning is cheap and yields a handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    credentials: Option<(String, String)>,
    fail_next_connects: u32,
    connect_attempts: u32,
    next_id: u64,
    connections: HashMap<u64, Arc<CloseSignal>>,
    streams: HashMap<String, StreamLog>,
    bindings: Vec<Binding>,
}

struct StreamLog {
    options: StreamOptions,
    declarations: u32,
    entries: Vec<Vec<u8>>,
    length: watch::Sender<usize>,
    consumers: HashMap<String, Feeder>,
    acked: u32,
}

struct Feeder {
    connection_id: u64,
    channel_id: u64,
    task: JoinHandle<()>,
}

struct Binding {
    exchange: String,
    routing_key: String,
    stream: String,
}

impl MemoryBroker {
    /// Create an empty broker that accepts any login.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept logins with these credentials.
    #[must_use]
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.lock().credentials = Some((username.into(), password.into()));
        self
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().fail_next_connects = count;
    }

    /// Connection attempts seen so far, including refused ones.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Sever every open connection as if the network failed.
    pub fn drop_connections(&self, reason: &str) {
        let mut state = self.lock();
        let dropped: Vec<u64> = state.connections.keys().copied().collect();
        for (_, signal) in state.connections.drain() {
            mark_closed(&signal, Some(reason.to_owned()));
        }
        debug!(count = dropped.len(), %reason, "dropping connections");
        state.abort_feeders(|feeder| dropped.contains(&feeder.connection_id));
    }

    /// Times `stream` has been declared.
    pub fn stream_declarations(&self, stream: &str) -> u32 {
        self.lock()
            .streams
            .get(stream)
            .map_or(0, |log| log.declarations)
    }

    /// Every body appended to `stream`, oldest first.
    pub fn stream_bodies(&self, stream: &str) -> Vec<Vec<u8>> {
        self.lock()
            .streams
            .get(stream)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    /// Every well-formed envelope appended to `stream`, oldest first.
    pub fn stream_messages(&self, stream: &str) -> Vec<ChatMessage> {
        self.stream_bodies(stream)
            .iter()
            .filter_map(|body| ChatMessage::decode(body).ok())
            .collect()
    }

    /// Active consumers on `stream`.
    pub fn consumer_count(&self, stream: &str) -> usize {
        self.lock()
            .streams
            .get(stream)
            .map_or(0, |log| log.consumers.len())
    }

    /// Deliveries from `stream` that were acknowledged.
    pub fn acked_count(&self, stream: &str) -> u32 {
        self.lock().streams.get(stream).map_or(0, |log| log.acked)
    }

    /// `(routing_key, stream)` pairs bound to `exchange`.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .bindings
            .iter()
            .filter(|binding| binding.exchange == exchange)
            .map(|binding| (binding.routing_key.clone(), binding.stream.clone()))
            .collect()
    }

    /// Append a raw body to `stream`, bypassing any channel. Returns `false`
    /// if the stream has not been declared.
    pub fn publish_raw(&self, stream: &str, body: impl Into<Vec<u8>>) -> bool {
        self.lock().append(stream, body.into())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, stream: &str, index: usize) -> Option<Vec<u8>> {
        self.lock()
            .streams
            .get(stream)
            .and_then(|log| log.entries.get(index).cloned())
    }

    fn close_connection(&self, id: u64) {
        let mut state = self.lock();
        if let Some(signal) = state.connections.remove(&id) {
            mark_closed(&signal, None);
        }
        state.abort_feeders(|feeder| feeder.connection_id == id);
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn append(&mut self, stream: &str, body: Vec<u8>) -> bool {
        let Some(log) = self.streams.get_mut(stream) else {
            return false;
        };
        log.entries.push(body);
        log.length.send_replace(log.entries.len());
        true
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange == DEFAULT_EXCHANGE {
            return if self.streams.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                Vec::new()
            };
        }
        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.routing_key, routing_key))
            .map(|b| b.stream.clone())
            .collect();
        targets.dedup();
        targets
    }

    fn abort_feeders(&mut self, mut predicate: impl FnMut(&Feeder) -> bool) {
        for log in self.streams.values_mut() {
            log.consumers.retain(|_, feeder| {
                if predicate(feeder) {
                    feeder.task.abort();
                    false
                } else {
                    true
                }
            });
        }
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBroker")
            .field("connections", &state.connections.len())
            .field("streams", &state.streams.len())
            .field("bindings", &state.bindings.len())
            .finish()
    }
}

fn mark_closed(signal: &CloseSignal, reason: Option<String>) {
    signal.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    });
}

/// AMQP topic matching: words are `.`-separated, `*` matches exactly one
/// word and `#` matches zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = key.split('.').collect();
    words_match(&pattern, &words)
}

fn words_match(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.split_first(), words.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            words_match(rest, words)
                || words
                    .split_first()
                    .is_some_and(|(_, tail)| words_match(pattern, tail))
        }
        (Some((expected, rest)), Some((word, tail))) => {
            (*expected == "*" || expected == word) && words_match(rest, tail)
        }
        _ => false,
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(ChatError::Broker(format!(
                "connection refused: {}",
                endpoint.url()
            )));
        }
        if let Some((username, password)) = &state.credentials {
            if *username != endpoint.username || *password != endpoint.password {
                return Err(ChatError::Broker(format!(
                    "ACCESS_REFUSED - login refused for user '{}'",
                    endpoint.username
                )));
            }
        }

        let id = state.next_id();
        let signal = Arc::new(watch::channel(None).0);
        state.connections.insert(id, Arc::clone(&signal));
        debug!(id, vhost = %endpoint.vhost, "memory connection opened");
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            signal,
        }))
    }
}

// ── Connection ──────────────────────────────────────────────────────

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    signal: Arc<CloseSignal>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.signal.borrow().is_some() {
            return Err(ChatError::ConnectionClosed);
        }
        let id = self.broker.lock().next_id();
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
            id,
            signal: Arc::clone(&self.signal),
            closed: AtomicBool::new(false),
            prefetch: AtomicU16::new(0),
            ledger: Arc::new(DeliveryLedger::default()),
        }))
    }

    async fn closed(&self) -> Option<String> {
        let mut rx = self.signal.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|state| (*state).clone().flatten())
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_connection(self.id);
        Ok(())
    }
}

// ── Channel ─────────────────────────────────────────────────────────

#[derive(Default)]
struct DeliveryLedger {
    next_tag: AtomicU64,
    unacked: Mutex<HashMap<u64, String>>,
}

impl DeliveryLedger {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, String>> {
        self.unacked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    connection_id: u64,
    id: u64,
    signal: Arc<CloseSignal>,
    closed: AtomicBool,
    prefetch: AtomicU16,
    ledger: Arc<DeliveryLedger>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.signal.borrow().is_some() {
            return Err(ChatError::ConnectionClosed);
        }
        Ok(())
    }

    fn settle(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        let Some(stream) = self.ledger.lock().remove(&delivery_tag) else {
            return Err(ChatError::Broker(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        };
        if let Some(log) = self.broker.lock().streams.get_mut(&stream) {
            log.acked += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::Release);
        Ok(())
    }

    async fn declare_stream(&self, name: &str, options: &StreamOptions) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.streams.get_mut(name) {
            Some(log) if log.options != *options => Err(ChatError::Broker(format!(
                "PRECONDITION_FAILED - inequivalent arg 'x-max-age' for queue '{name}'"
            ))),
            Some(log) => {
                log.declarations += 1;
                Ok(())
            }
            None => {
                state.streams.insert(
                    name.to_owned(),
                    StreamLog {
                        options: options.clone(),
                        declarations: 1,
                        entries: Vec::new(),
                        length: watch::channel(0).0,
                        consumers: HashMap::new(),
                        acked: 0,
                    },
                );
                debug!(stream = %name, "stream declared");
                Ok(())
            }
        }
    }

    async fn bind(&self, stream: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.streams.contains_key(stream) {
            return Err(ChatError::Broker(format!("NOT_FOUND - no queue '{stream}'")));
        }
        let exists = state.bindings.iter().any(|b| {
            b.exchange == exchange && b.routing_key == routing_key && b.stream == stream
        });
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                stream: stream.to_owned(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        _options: &PublishOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let targets = state.route(exchange, routing_key);
        if targets.is_empty() {
            debug!(%exchange, %routing_key, "unroutable message dropped");
        }
        for stream in targets {
            state.append(&stream, body.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, stream: &str, options: &ConsumeOptions) -> Result<Subscription> {
        self.ensure_open()?;
        let capacity = match self.prefetch.load(Ordering::Acquire) {
            0 => DEFAULT_DELIVERY_BUFFER,
            prefetch => usize::from(prefetch),
        };

        let mut state = self.broker.lock();
        let consumer_tag = format!("amq.ctag-{}", state.next_id());
        let Some(log) = state.streams.get_mut(stream) else {
            return Err(ChatError::Broker(format!("NOT_FOUND - no queue '{stream}'")));
        };
        let len = log.entries.len();
        let cursor = match options.offset {
            StreamOffset::First => 0,
            StreamOffset::Last => len.saturating_sub(1),
            StreamOffset::Next => len,
            StreamOffset::Absolute(offset) => usize::try_from(offset).unwrap_or(usize::MAX).min(len),
        };

        let (tx, rx) = mpsc::channel(capacity);
        let feeder = Feed {
            broker: self.broker.clone(),
            ledger: Arc::clone(&self.ledger),
            stream: stream.to_owned(),
            consumer_tag: consumer_tag.clone(),
            track: !options.no_ack,
        };
        let task = tokio::spawn(feeder.run(cursor, tx, log.length.subscribe()));
        log.consumers.insert(
            consumer_tag.clone(),
            Feeder {
                connection_id: self.connection_id,
                channel_id: self.id,
                task,
            },
        );
        debug!(%stream, %consumer_tag, cursor, "consumer attached");

        Ok(Subscription {
            consumer_tag,
            deliveries: rx,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        for log in state.streams.values_mut() {
            let owned = log
                .consumers
                .get(consumer_tag)
                .is_some_and(|feeder| feeder.channel_id == self.id);
            if owned {
                if let Some(feeder) = log.consumers.remove(consumer_tag) {
                    feeder.task.abort();
                }
                return Ok(());
            }
        }
        debug!(%consumer_tag, "cancel for unknown consumer ignored");
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.settle(delivery_tag)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let channel_id = self.id;
        self.broker
            .lock()
            .abort_feeders(|feeder| feeder.channel_id == channel_id);
        Ok(())
    }
}

/// Copies log entries to one consumer, in order, starting at a cursor.
struct Feed {
    broker: MemoryBroker,
    ledger: Arc<DeliveryLedger>,
    stream: String,
    consumer_tag: String,
    track: bool,
}

impl Feed {
    async fn run(
        self,
        mut cursor: usize,
        tx: mpsc::Sender<Delivery>,
        mut length: watch::Receiver<usize>,
    ) {
        loop {
            let ready = length.wait_for(|len| *len > cursor).await.is_ok();
            if !ready {
                return;
            }
            let Some(body) = self.broker.entry(&self.stream, cursor) else {
                return;
            };
            let delivery_tag = self.ledger.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
            if self.track {
                self.ledger.lock().insert(delivery_tag, self.stream.clone());
            }
            let delivery = Delivery {
                delivery_tag,
                consumer_tag: self.consumer_tag.clone(),
                stream: self.stream.clone(),
                body,
            };
            if tx.send(delivery).await.is_err() {
                debug!(consumer_tag = %self.consumer_tag, "consumer queue closed");
                return;
            }
            cursor += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    async fn open(broker: &MemoryBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let connection = broker.connect(&BrokerEndpoint::default()).await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        (connection, channel)
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("general", "general"));
        assert!(!topic_matches("general", "random"));
        assert!(topic_matches("user-notifications-*", "user-notifications-*"));
        assert!(topic_matches("chat.*", "chat.general"));
        assert!(!topic_matches("chat.*", "chat.general.extra"));
        assert!(topic_matches("chat.#", "chat"));
        assert!(topic_matches("chat.#", "chat.general.extra"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("*", "two.words"));
    }

    #[tokio::test]
    async fn replays_from_first_offset() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .declare_stream("s", &StreamOptions::durable("1h"))
            .await
            .unwrap();
        broker.publish_raw("s", b"one".to_vec());
        broker.publish_raw("s", b"two".to_vec());

        let mut sub = channel
            .subscribe("s", &ConsumeOptions::from_offset(StreamOffset::First))
            .await
            .unwrap();
        assert_eq!(sub.deliveries.recv().await.unwrap().body, b"one");
        assert_eq!(sub.deliveries.recv().await.unwrap().body, b"two");

        broker.publish_raw("s", b"three".to_vec());
        let third = sub.deliveries.recv().await.unwrap();
        assert_eq!(third.body, b"three");
        assert_eq!(third.delivery_tag, 3);
    }

    #[tokio::test]
    async fn next_offset_skips_history() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .declare_stream("s", &StreamOptions::durable("1h"))
            .await
            .unwrap();
        broker.publish_raw("s", b"old".to_vec());

        let mut sub = channel
            .subscribe("s", &ConsumeOptions::from_offset(StreamOffset::Next))
            .await
            .unwrap();
        broker.publish_raw("s", b"new".to_vec());
        assert_eq!(sub.deliveries.recv().await.unwrap().body, b"new");
    }

    #[tokio::test]
    async fn topic_exchange_routes_through_bindings() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        let options = StreamOptions::durable("1h");
        channel.declare_stream("chat-stream-a", &options).await.unwrap();
        channel.declare_stream("chat-stream-b", &options).await.unwrap();
        channel.bind("chat-stream-a", "amq.topic", "a").await.unwrap();
        channel.bind("chat-stream-b", "amq.topic", "b").await.unwrap();

        let publish = PublishOptions::persistent();
        channel.publish("amq.topic", "a", b"x".to_vec(), &publish).await.unwrap();
        channel.publish("amq.topic", "nobody", b"y".to_vec(), &publish).await.unwrap();

        assert_eq!(broker.stream_bodies("chat-stream-a"), vec![b"x".to_vec()]);
        assert!(broker.stream_bodies("chat-stream-b").is_empty());
        assert_eq!(
            broker.bindings("amq.topic"),
            vec![
                ("a".to_owned(), "chat-stream-a".to_owned()),
                ("b".to_owned(), "chat-stream-b".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn redeclare_with_other_arguments_fails() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .declare_stream("s", &StreamOptions::durable("1h"))
            .await
            .unwrap();
        channel
            .declare_stream("s", &StreamOptions::durable("1h"))
            .await
            .unwrap();
        let err = channel
            .declare_stream("s", &StreamOptions::durable("7D"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("PRECONDITION_FAILED"));
        assert_eq!(broker.stream_declarations("s"), 2);
    }

    #[tokio::test]
    async fn ack_bookkeeping() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .declare_stream("s", &StreamOptions::durable("1h"))
            .await
            .unwrap();
        broker.publish_raw("s", b"a".to_vec());
        broker.publish_raw("s", b"b".to_vec());
        let mut sub = channel
            .subscribe("s", &ConsumeOptions::default())
            .await
            .unwrap();

        let first = sub.deliveries.recv().await.unwrap();
        let second = sub.deliveries.recv().await.unwrap();
        channel.ack(first.delivery_tag).await.unwrap();
        assert_eq!(broker.acked_count("s"), 1);

        // Each tag settles once; unknown tags are refused.
        assert!(channel.ack(first.delivery_tag).await.is_err());
        assert!(channel.ack(second.delivery_tag + 100).await.is_err());
        channel.ack(second.delivery_tag).await.unwrap();
        assert_eq!(broker.acked_count("s"), 2);
    }

    #[tokio::test]
    async fn cancel_detaches_consumer() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .declare_stream("s", &StreamOptions::durable("1h"))
            .await
            .unwrap();
        let sub = channel
            .subscribe("s", &ConsumeOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.consumer_count("s"), 1);

        channel.cancel(&sub.consumer_tag).await.unwrap();
        assert_eq!(broker.consumer_count("s"), 0);
    }

    #[tokio::test]
    async fn subscribe_to_missing_stream_fails() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        let err = channel
            .subscribe("missing", &ConsumeOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NOT_FOUND"));
    }

    #[tokio::test]
    async fn dropped_connection_reports_reason_and_closes_channels() {
        let broker = MemoryBroker::new();
        let (connection, channel) = open(&broker).await;
        assert_eq!(broker.open_connections(), 1);

        broker.drop_connections("network unreachable");

        assert_eq!(
            connection.closed().await.as_deref(),
            Some("network unreachable")
        );
        assert_eq!(broker.open_connections(), 0);
        assert!(matches!(
            channel.set_prefetch(10).await,
            Err(ChatError::ConnectionClosed)
        ));
        assert!(matches!(
            connection.open_channel().await,
            Err(ChatError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn clean_close_has_no_reason() {
        let broker = MemoryBroker::new();
        let (connection, _channel) = open(&broker).await;
        connection.close().await.unwrap();
        assert_eq!(connection.closed().await, None);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn scripted_failures_and_credentials() {
        let broker = MemoryBroker::new().with_credentials("alice", "secret");
        broker.fail_next_connects(1);

        let endpoint = BrokerEndpoint::default().with_credentials("alice", "secret");
        assert!(broker.connect(&endpoint).await.is_err());
        assert!(broker.connect(&endpoint).await.is_ok());

        let wrong = BrokerEndpoint::default().with_credentials("alice", "nope");
        let err = broker.connect(&wrong).await.err().unwrap();
        assert!(err.to_string().contains("ACCESS_REFUSED"));
        assert_eq!(broker.connect_attempts(), 3);
    }
}
