//! Broker capability abstraction.
//!
//! The session layer never speaks the broker wire protocol itself. It drives
//! an AMQP-style broker through three object-safe traits:
//!
//! - [`BrokerConnector`] opens a [`BrokerConnection`] to a [`BrokerEndpoint`].
//! - [`BrokerConnection`] opens channels and reports when the link dies.
//! - [`BrokerChannel`] carries the stream primitives: declare, bind, publish,
//!   subscribe, cancel and acknowledge.
//!
//! # Implementing a broker adapter
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use wamschat_client::broker::{BrokerConnection, BrokerConnector, BrokerEndpoint};
//! use wamschat_client::ChatError;
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl BrokerConnector for MyConnector {
//!     async fn connect(
//!         &self,
//!         endpoint: &BrokerEndpoint,
//!     ) -> Result<Arc<dyn BrokerConnection>, ChatError> {
//!         // Dial `endpoint.url()`, run the protocol handshake and wrap the
//!         // resulting connection.
//!         Err(ChatError::Broker(format!("cannot reach {}", endpoint.url())))
//!     }
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ChatError, Result};

/// Stream queue type argument value.
pub const STREAM_QUEUE_TYPE: &str = "stream";

// ── Endpoint ────────────────────────────────────────────────────────

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 15672;
const DEFAULT_VHOST: &str = "/";
const DEFAULT_USERNAME: &str = "guest";
const DEFAULT_PASSWORD: &str = "guest";

/// Address and credentials of the broker's WebSocket listener.
///
/// # Example
///
/// ```
/// use wamschat_client::broker::BrokerEndpoint;
///
/// let endpoint = BrokerEndpoint::default().with_host("broker.internal");
/// assert_eq!(endpoint.url(), "ws://broker.internal:15672");
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub hostname: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
}

impl BrokerEndpoint {
    /// Read the endpoint from `AMQP_HOST`, `AMQP_WS_PORT`, `AMQP_VHOST`,
    /// `AMQP_USERNAME` and `AMQP_PASSWORD`, falling back to the defaults for
    /// unset variables and for a port that does not parse.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the endpoint from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            hostname: lookup("AMQP_HOST").unwrap_or(defaults.hostname),
            port: lookup("AMQP_WS_PORT")
                .and_then(|port| port.trim().parse().ok())
                .unwrap_or(defaults.port),
            vhost: lookup("AMQP_VHOST").unwrap_or(defaults.vhost),
            username: lookup("AMQP_USERNAME").unwrap_or(defaults.username),
            password: lookup("AMQP_PASSWORD").unwrap_or(defaults.password),
        }
    }

    /// Set the broker host name.
    #[must_use]
    pub fn with_host(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the WebSocket port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the virtual host.
    #[must_use]
    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    /// Set the login credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// WebSocket URL of the broker listener.
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.hostname, self.port)
    }
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            vhost: DEFAULT_VHOST.to_owned(),
            username: DEFAULT_USERNAME.to_owned(),
            password: DEFAULT_PASSWORD.to_owned(),
        }
    }
}

impl std::fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ── Operation options ───────────────────────────────────────────────

/// Declaration options for a durable stream queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Retention bound, in the broker's duration syntax (e.g. `"1h"`).
    pub max_age: String,
}

impl StreamOptions {
    /// Durable stream retaining entries for `max_age`.
    pub fn durable(max_age: impl Into<String>) -> Self {
        Self {
            durable: true,
            max_age: max_age.into(),
        }
    }

    /// Queue arguments sent with the declaration.
    pub fn arguments(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-queue-type", STREAM_QUEUE_TYPE.to_owned()),
            ("x-max-age", self.max_age.clone()),
        ]
    }
}

/// Where a new stream consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamOffset {
    /// Earliest retained entry (full replay).
    #[default]
    First,
    /// The last chunk written to the stream.
    Last,
    /// Only entries published after the consumer attaches.
    Next,
    /// A specific absolute offset.
    Absolute(u64),
}

impl StreamOffset {
    /// Value of the `x-stream-offset` consumer argument.
    pub fn argument(&self) -> serde_json::Value {
        match self {
            Self::First => serde_json::Value::from(0_u64),
            Self::Last => serde_json::Value::from("last"),
            Self::Next => serde_json::Value::from("next"),
            Self::Absolute(offset) => serde_json::Value::from(*offset),
        }
    }
}

/// Consumer options for [`BrokerChannel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeOptions {
    pub offset: StreamOffset,
    /// When `false`, every delivery must be acknowledged explicitly.
    pub no_ack: bool,
}

impl ConsumeOptions {
    /// Explicit-ack consumer starting at `offset`.
    pub fn from_offset(offset: StreamOffset) -> Self {
        Self {
            offset,
            no_ack: false,
        }
    }
}

/// Publish options for [`BrokerChannel::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Request persistent delivery (delivery mode 2).
    pub persistent: bool,
}

impl PublishOptions {
    /// Persistent delivery.
    pub fn persistent() -> Self {
        Self { persistent: true }
    }
}

// ── Deliveries ──────────────────────────────────────────────────────

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    pub consumer_tag: String,
    /// Stream the message was read from.
    pub stream: String,
    pub body: Vec<u8>,
}

impl Delivery {
    /// Body as UTF-8 text, replacing invalid sequences.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// An active consumer: its tag and the bounded queue deliveries arrive on.
///
/// The queue closes when the consumer is cancelled or the channel dies.
#[derive(Debug)]
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: mpsc::Receiver<Delivery>,
}

// ── Traits ──────────────────────────────────────────────────────────

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Connect and authenticate against `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Broker`](crate::ChatError::Broker) when the broker
    /// is unreachable or rejects the login.
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerConnection>>;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Resolve once the connection errors or closes.
    ///
    /// Returns the failure reason, or `None` for a clean close. Must be safe
    /// to call from several tasks.
    async fn closed(&self) -> Option<String>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}

/// A channel carrying the stream primitives.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limit unacknowledged deliveries in flight on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Declare a stream queue. Redeclaring with identical options is a no-op
    /// on the broker.
    async fn declare_stream(&self, name: &str, options: &StreamOptions) -> Result<()>;

    /// Bind `stream` to `exchange` under `routing_key`.
    async fn bind(&self, stream: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish `body`. The default exchange (`""`) routes straight to the
    /// queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        options: &PublishOptions,
    ) -> Result<()>;

    /// Attach a consumer to `stream`.
    async fn subscribe(&self, stream: &str, options: &ConsumeOptions) -> Result<Subscription>;

    /// Cancel the consumer identified by `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}

/// Run a broker operation, failing with [`ChatError::Timeout`] if it does not
/// finish within `timeout`.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ChatError::Timeout { operation })?
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test(start_paused = true)]
    async fn with_timeout_reports_operation() {
        let err = with_timeout(Duration::from_millis(50), "declare stream", async {
            std::future::pending::<Result<()>>().await
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ChatError::Timeout {
                operation: "declare stream"
            }
        ));
    }

    #[test]
    fn endpoint_defaults() {
        let endpoint = BrokerEndpoint::default();
        assert_eq!(endpoint.url(), "ws://localhost:15672");
        assert_eq!(endpoint.vhost, "/");
        assert_eq!(endpoint.username, "guest");
    }

    #[test]
    fn endpoint_from_lookup_overrides_and_falls_back() {
        let vars: HashMap<&str, &str> = [
            ("AMQP_HOST", "mq.example"),
            ("AMQP_WS_PORT", "not-a-port"),
            ("AMQP_USERNAME", "chat"),
        ]
        .into_iter()
        .collect();
        let endpoint = BrokerEndpoint::from_lookup(|k| vars.get(k).map(|v| (*v).to_owned()));

        assert_eq!(endpoint.hostname, "mq.example");
        assert_eq!(endpoint.port, 15672);
        assert_eq!(endpoint.username, "chat");
        assert_eq!(endpoint.password, "guest");
    }

    #[test]
    fn endpoint_debug_redacts_password() {
        let endpoint = BrokerEndpoint::default().with_credentials("u", "s3cret");
        let rendered = format!("{endpoint:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn stream_arguments() {
        let args = StreamOptions::durable("1h").arguments();
        assert_eq!(
            args,
            vec![
                ("x-queue-type", "stream".to_owned()),
                ("x-max-age", "1h".to_owned())
            ]
        );
    }

    #[test]
    fn stream_offset_arguments() {
        assert_eq!(StreamOffset::First.argument(), serde_json::json!(0));
        assert_eq!(StreamOffset::Last.argument(), serde_json::json!("last"));
        assert_eq!(StreamOffset::Absolute(42).argument(), serde_json::json!(42));
    }

    #[test]
    fn default_consumer_requires_explicit_ack() {
        let options = ConsumeOptions::default();
        assert_eq!(options.offset, StreamOffset::First);
        assert!(!options.no_ack);
    }

    #[test]
    fn broker_traits_are_object_safe() {
        fn assert_object_safe(
            _: Option<Arc<dyn BrokerConnector>>,
            _: Option<Arc<dyn BrokerConnection>>,
            _: Option<Arc<dyn BrokerChannel>>,
        ) {
        }
        assert_object_safe(None, None, None);
    }
}
