//! # Loopback Chat Demo
//!
//! Runs two chat sessions against the in-process loopback broker:
//!
//! 1. Alice and Bob connect and subscribe to their notification channels
//! 2. Both join `general` and exchange a message
//! 3. Alice invites Bob to a direct-message channel
//! 4. Bob accepts by joining it
//! 5. The broker drops every connection; both sessions reconnect on their own
//! 6. Both leave all channels and disconnect
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_chat --features memory-broker
//!
//! # With library logs:
//! RUST_LOG=wamschat_client=debug cargo run --example loopback_chat --features memory-broker
//! ```

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use wamschat_client::broker::BrokerEndpoint;
use wamschat_client::{
    ChannelConfig, ChannelEvent, ChannelManager, ChatMessage, ConnectionConfig, ConnectionEvent,
    ConnectionManager, MemoryBroker,
};

/// How long to wait for an expected event before giving up.
const EVENT_WAIT: Duration = Duration::from_secs(5);

struct Session {
    username: &'static str,
    connection: ConnectionManager,
    channels: ChannelManager,
    events: UnboundedReceiver<ChannelEvent>,
}

async fn start_session(
    broker: &MemoryBroker,
    endpoint: &BrokerEndpoint,
    username: &'static str,
) -> Result<Session, Box<dyn std::error::Error>> {
    let config = ConnectionConfig::new(endpoint.clone())
        .with_reconnect_base_delay(Duration::from_millis(200));
    let connection = ConnectionManager::new(broker.clone(), config);

    let mut status = connection.subscribe();
    let who = username;
    tokio::spawn(async move {
        while let Some(event) = status.recv().await {
            match event {
                ConnectionEvent::Connected => tracing::info!(user = who, "connected"),
                ConnectionEvent::Disconnected { reason } => {
                    tracing::warn!(user = who, ?reason, "disconnected");
                }
                ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                    tracing::info!(user = who, attempt, ?delay, "reconnecting");
                }
                ConnectionEvent::ReconnectExhausted { attempts } => {
                    tracing::error!(user = who, attempts, "giving up");
                }
                _ => {}
            }
        }
    });

    connection.connect().await;
    if !connection.is_connected() {
        return Err(format!("{username} could not connect").into());
    }

    let channels = ChannelManager::new(connection.clone(), ChannelConfig::default());
    let events = channels.subscribe();
    channels.subscribe_to_user_notifications(username).await?;

    Ok(Session {
        username,
        connection,
        channels,
        events,
    })
}

/// Print events until one matches `done`.
async fn watch(session: &mut Session, mut done: impl FnMut(&ChannelEvent) -> bool) {
    let waited = tokio::time::timeout(EVENT_WAIT, async {
        while let Some(event) = session.events.recv().await {
            print_event(session.username, &event);
            if done(&event) {
                return;
            }
        }
    })
    .await;
    if waited.is_err() {
        tracing::warn!(user = session.username, "timed out waiting for event");
    }
}

fn print_event(username: &str, event: &ChannelEvent) {
    match event {
        ChannelEvent::MessageReceived {
            channel,
            message: ChatMessage::Message {
                username: from,
                content,
                ..
            },
        } => println!(
            "[{username}] #{channel} <{}> {content}",
            from.as_deref().unwrap_or("anonymous")
        ),
        ChannelEvent::MessageReceived {
            channel,
            message: ChatMessage::System { content, .. },
        } => println!("[{username}] #{channel} * {content}"),
        ChannelEvent::UserNotificationReceived {
            notification: ChatMessage::DmInitiation {
                from, dm_channel, ..
            },
        } => println!("[{username}] {from} wants to chat in {dm_channel}"),
        other => tracing::debug!(user = username, ?other, "event"),
    }
}

fn is_content(event: &ChannelEvent, expected: &str) -> bool {
    matches!(
        event,
        ChannelEvent::MessageReceived { message: ChatMessage::Message { content, .. }, .. }
            if content == expected
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Broker ──────────────────────────────────────────────────────
    // Same variables a real deployment reads; defaults are guest/guest.
    let endpoint = BrokerEndpoint::from_env();
    let broker = MemoryBroker::new().with_credentials(&endpoint.username, &endpoint.password);

    let mut alice = start_session(&broker, &endpoint, "alice").await?;
    let mut bob = start_session(&broker, &endpoint, "bob").await?;

    // ── Public channel ──────────────────────────────────────────────
    alice.channels.subscribe_to_channel("general", "alice").await?;
    bob.channels.subscribe_to_channel("general", "bob").await?;
    alice
        .channels
        .send_message("general", "alice", "  hi bob!  ")
        .await?;
    watch(&mut bob, |e| is_content(e, "hi bob!")).await;

    // ── Direct message ──────────────────────────────────────────────
    let dm = "dm-alice-bob";
    alice
        .channels
        .send_dm_initiation_notification("alice", "bob", dm)
        .await;
    watch(&mut bob, |e| {
        matches!(e, ChannelEvent::UserNotificationReceived { .. })
    })
    .await;
    alice.channels.subscribe_to_channel(dm, "alice").await?;
    bob.channels.subscribe_to_channel(dm, "bob").await?;
    bob.channels.send_message(dm, "bob", "just us now").await?;
    watch(&mut alice, |e| is_content(e, "just us now")).await;

    // ── Outage ──────────────────────────────────────────────────────
    let mut status = alice.connection.subscribe();
    broker.drop_connections("simulated outage");
    let recovered = tokio::time::timeout(EVENT_WAIT, async {
        while let Some(event) = status.recv().await {
            if event == ConnectionEvent::Connected {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    println!("alice recovered: {recovered}");

    if recovered {
        alice.channels.subscribe_to_channel("general", "alice").await?;
        alice
            .channels
            .send_message("general", "alice", "back online")
            .await?;
    }

    // ── Shutdown ────────────────────────────────────────────────────
    for session in [&alice, &bob] {
        let failed = session.channels.leave_all(session.username).await;
        if !failed.is_empty() {
            tracing::warn!(user = session.username, ?failed, "could not leave every channel");
        }
        session.connection.disconnect().await;
    }

    println!(
        "general history: {} entries",
        broker.stream_messages("chat-stream-general").len()
    );
    Ok(())
}
