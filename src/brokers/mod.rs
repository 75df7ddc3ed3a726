//! Broker implementations bundled with the crate.
//!
//! Enable the corresponding Cargo feature to pull one in:
//!
//! | Feature         | Broker            |
//! |-----------------|-------------------|
//! | `memory-broker` | [`MemoryBroker`]  |
//!
//! Production deployments plug their AMQP client in through the
//! [`broker`](crate::broker) traits instead.
//!
//! # Example
//!
//! ```rust,ignore
//! use wamschat_client::{ChannelManager, ConnectionConfig, ConnectionManager, MemoryBroker};
//!
//! let broker = MemoryBroker::new();
//! let connection = ConnectionManager::new(broker.clone(), ConnectionConfig::default());
//! connection.connect().await;
//! let channels = ChannelManager::new(connection.clone(), Default::default());
//! ```

#[cfg(feature = "memory-broker")]
pub mod memory;

#[cfg(feature = "memory-broker")]
pub use memory::MemoryBroker;
