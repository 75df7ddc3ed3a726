//! # wamschat client
//!
//! Client session layer for a chat application running over a stream-capable
//! AMQP broker.
//!
//! The crate keeps one broker connection alive and turns chat operations into
//! stream primitives:
//!
//! - [`ConnectionManager`] drives the connect/reconnect state machine with
//!   bounded exponential backoff.
//! - [`ChannelManager`] declares one durable stream per chat channel, keeps at
//!   most one consumer per channel, publishes chat and system messages and
//!   fans out direct-message invitations to per-user notification streams.
//! - [`EventBus`] delivers [`ConnectionEvent`]s and [`ChannelEvent`]s to every
//!   registered listener, in order.
//!
//! The broker itself is reached through the traits in [`broker`]. The
//! opt-in `memory-broker` feature provides [`MemoryBroker`], an in-process
//! implementation used by tests and demos.
//!
//! ## Quick Start
//!
//! ```rust
//! # #[cfg(feature = "memory-broker")]
//! # async fn example() -> wamschat_client::Result<()> {
//! use wamschat_client::{ChannelConfig, ChannelManager, ConnectionConfig, ConnectionManager, MemoryBroker};
//!
//! let connection = ConnectionManager::new(MemoryBroker::new(), ConnectionConfig::default());
//! connection.connect().await;
//!
//! let channels = ChannelManager::new(connection.clone(), ChannelConfig::default());
//! channels.subscribe_to_channel("general", "alice").await?;
//! channels.send_message("general", "alice", "  hello  ").await?;
//!
//! channels.leave_all("alice").await;
//! connection.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod brokers;
pub mod channel;
pub mod connection;
pub mod error;
pub mod event;
pub mod protocol;

// Re-export primary types for ergonomic imports.
pub use channel::{Channel, ChannelConfig, ChannelKind, ChannelManager};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use error::{ChatError, Result};
pub use event::{ChannelEvent, ConnectionEvent, EventBus};
pub use protocol::ChatMessage;

#[cfg(feature = "memory-broker")]
pub use brokers::MemoryBroker;
