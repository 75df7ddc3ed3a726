#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for wamschat-client integration tests.
//!
//! Builds connected sessions on the in-process [`MemoryBroker`] and provides
//! helpers for waiting on events and broker state without sleeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use wamschat_client::broker::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerEndpoint, ConsumeOptions,
    PublishOptions, StreamOptions, Subscription,
};
use wamschat_client::{
    Channel, ChannelConfig, ChannelManager, ChatError, ConnectionConfig, ConnectionManager, MemoryBroker,
};

/// How long any single wait may take before the test fails.
pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Install a test-writer subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Sessions ────────────────────────────────────────────────────────

/// A connection and channel manager wired to a loopback broker.
pub struct Session {
    pub broker: MemoryBroker,
    pub connection: ConnectionManager,
    pub channels: ChannelManager,
}

/// Connect a new session to `broker`.
pub async fn connect(broker: &MemoryBroker) -> Session {
    connect_with(broker, ConnectionConfig::default(), ChannelConfig::default()).await
}

/// Connect a new session to `broker` with explicit configuration.
pub async fn connect_with(
    broker: &MemoryBroker,
    connection_config: ConnectionConfig,
    channel_config: ChannelConfig,
) -> Session {
    init_tracing();
    let connection = ConnectionManager::new(broker.clone(), connection_config);
    connection.connect().await;
    assert!(connection.is_connected(), "session failed to connect");
    let channels = ChannelManager::new(connection.clone(), channel_config);
    Session {
        broker: broker.clone(),
        connection,
        channels,
    }
}

// ── Waiting ─────────────────────────────────────────────────────────

/// Receive events until one matches `predicate`, returning it.
pub async fn wait_for_event<E: std::fmt::Debug>(
    rx: &mut UnboundedReceiver<E>,
    mut predicate: impl FnMut(&E) -> bool,
) -> E {
    let found = tokio::time::timeout(WAIT_LIMIT, async {
        while let Some(event) = rx.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event stream closed before a matching event arrived"),
        Err(_) => panic!("no matching event within {WAIT_LIMIT:?}"),
    }
}

/// Drain every event already queued on `rx`.
pub fn drain<E>(rx: &mut UnboundedReceiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Poll `condition` until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached within {WAIT_LIMIT:?}");
}

/// Wait until `channel` no longer has a live consumer.
pub async fn wait_unsubscribed(channel: &Channel) {
    let reached = tokio::time::timeout(WAIT_LIMIT, async {
        while channel.is_subscribed().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "{} still subscribed after {WAIT_LIMIT:?}",
        channel.name()
    );
}

// ── StallingBroker ──────────────────────────────────────────────────

/// Connector whose connections open channels that never answer stream
/// operations. Used to exercise operation timeouts.
pub struct StallingBroker;

struct StallingConnection;

struct StallingChannel;

#[async_trait]
impl BrokerConnector for StallingBroker {
    async fn connect(
        &self,
        _endpoint: &BrokerEndpoint,
    ) -> Result<Arc<dyn BrokerConnection>, ChatError> {
        Ok(Arc::new(StallingConnection))
    }
}

#[async_trait]
impl BrokerConnection for StallingConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, ChatError> {
        Ok(Arc::new(StallingChannel))
    }

    async fn closed(&self) -> Option<String> {
        std::future::pending().await
    }

    async fn close(&self) -> Result<(), ChatError> {
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for StallingChannel {
    async fn set_prefetch(&self, _count: u16) -> Result<(), ChatError> {
        Ok(())
    }

    async fn declare_stream(&self, _name: &str, _options: &StreamOptions) -> Result<(), ChatError> {
        std::future::pending().await
    }

    async fn bind(&self, _stream: &str, _exchange: &str, _key: &str) -> Result<(), ChatError> {
        std::future::pending().await
    }

    async fn publish(
        &self,
        _exchange: &str,
        _routing_key: &str,
        _body: Vec<u8>,
        _options: &PublishOptions,
    ) -> Result<(), ChatError> {
        std::future::pending().await
    }

    async fn subscribe(
        &self,
        _stream: &str,
        _options: &ConsumeOptions,
    ) -> Result<Subscription, ChatError> {
        std::future::pending().await
    }

    async fn cancel(&self, _consumer_tag: &str) -> Result<(), ChatError> {
        std::future::pending().await
    }

    async fn ack(&self, _delivery_tag: u64) -> Result<(), ChatError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ChatError> {
        Ok(())
    }
}
