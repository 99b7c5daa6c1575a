//! Fan-out Relay: the per-room broadcast medium between processes.
//!
//! Events are published on `chat:<roomName>` as JSON `{type, payload}`.
//! Each process holds exactly one long-lived subscription covering all
//! rooms (`chat:*`) and forwards decoded events to the gateway's dispatch
//! loop. Delivery is best-effort: a dropped or corrupt event is lost, no
//! retry or acknowledgment exists.

use async_trait::async_trait;
use futures_util::StreamExt;
use log::warn;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc, watch, Mutex};

use crate::error::Error;
use crate::messages::RelayEvent;

pub const CHANNEL_PREFIX: &str = "chat:";

fn channel(room: &str) -> String {
    format!("{CHANNEL_PREFIX}{room}")
}

/// A decoded event together with the room it was published to.
pub type Inbound = (String, RelayEvent);

/// Cross-process broadcast seam. Backed by redis pub/sub for
/// multi-instance deployments, or by an in-process channel for
/// single-instance mode and tests.
#[async_trait]
pub trait RelayBus: Send + Sync {
    /// Publishes one event on the room's channel. Events published by the
    /// same process to the same room keep their publish order.
    async fn publish(&self, room: &str, event: &RelayEvent) -> Result<(), Error>;

    /// The single per-process subscription loop. Forwards every decoded
    /// event into `tx`; runs until `stop` flips or the medium closes.
    /// Corrupt events are dropped with a warning and the loop continues.
    async fn run(&self, tx: mpsc::UnboundedSender<Inbound>, stop: watch::Receiver<bool>)
        -> Result<(), Error>;
}

/// Decodes one raw channel payload, dropping corrupt events.
fn forward(room: &str, payload: &str, tx: &mpsc::UnboundedSender<Inbound>) {
    match serde_json::from_str::<RelayEvent>(payload) {
        Ok(event) => {
            // receiver gone means we are shutting down
            let _ = tx.send((room.to_string(), event));
        }
        Err(err) => warn!("dropping undecodable relay event on {CHANNEL_PREFIX}{room}: {err}"),
    }
}

/// Redis-backed bus. The pattern subscription is established at
/// construction so a broken pub/sub setup fails the process at startup
/// instead of surfacing later inside the background task.
pub struct RedisBus {
    conn: redis::aio::MultiplexedConnection,
    pubsub: Mutex<Option<redis::aio::PubSub>>,
}

impl RedisBus {
    pub async fn connect(client: &redis::Client) -> Result<Self, Error> {
        let conn = client.get_multiplexed_tokio_connection().await?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{CHANNEL_PREFIX}*")).await?;
        Ok(RedisBus {
            conn,
            pubsub: Mutex::new(Some(pubsub)),
        })
    }
}

#[async_trait]
impl RelayBus for RedisBus {
    async fn publish(&self, room: &str, event: &RelayEvent) -> Result<(), Error> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel(room), payload).await?;
        Ok(())
    }

    async fn run(
        &self,
        tx: mpsc::UnboundedSender<Inbound>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let Some(mut pubsub) = self.pubsub.lock().await.take() else {
            // already running
            return Ok(());
        };
        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                received = stream.next() => {
                    let Some(msg) = received else {
                        warn!("relay subscription closed by the store");
                        return Ok(());
                    };
                    let room = msg
                        .get_channel_name()
                        .strip_prefix(CHANNEL_PREFIX)
                        .unwrap_or_default()
                        .to_string();
                    match msg.get_payload::<String>() {
                        Ok(payload) => forward(&room, &payload, &tx),
                        Err(err) => {
                            warn!("dropping unreadable relay payload on {}: {err}", msg.get_channel_name());
                        }
                    }
                }
                _ = stop.changed() => return Ok(()),
            }
        }
    }
}

const MEMORY_BUS_CAPACITY: usize = 1024;

/// In-process bus over a single broadcast channel carrying
/// `(room, payload)` pairs; the wildcard subscription holds by
/// construction. Single-process only.
pub struct MemoryBus {
    tx: broadcast::Sender<(String, String)>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        MemoryBus { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        MemoryBus::new()
    }
}

#[async_trait]
impl RelayBus for MemoryBus {
    async fn publish(&self, room: &str, event: &RelayEvent) -> Result<(), Error> {
        let payload = serde_json::to_string(event)?;
        // no receivers yet is fine, fire and forget
        let _ = self.tx.send((room.to_string(), payload));
        Ok(())
    }

    async fn run(
        &self,
        tx: mpsc::UnboundedSender<Inbound>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let mut rx = self.tx.subscribe();
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok((room, payload)) => forward(&room, &payload, &tx),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("relay subscription lagged, lost {n} event(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                _ = stop.changed() => return Ok(()),
            }
        }
    }
}
