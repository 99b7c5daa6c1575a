//! Connection Gateway: binds live WebSocket connections to sessions and
//! orchestrates the store, formatter and relay.
//!
//! Per-connection state machine: Connected (transport open, no session)
//! -> Joined (session bound to a room) -> Closed. Each connection's events
//! are handled strictly in the order they arrive; the disconnect
//! transition runs exactly once, after the read loop ends.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::messages::{
    format_message, system_message, ClientEvent, Content, Envelope, RelayEvent,
};
use crate::relay::{Inbound, RelayBus};
use crate::store::SessionStore;

const WELCOME_TEXT: &str = "Welcome to Gossip";

/// A locally-connected client: its outbound channel plus the room binding,
/// kept here so fan-out delivery never round-trips to the shared store.
struct LocalConn {
    tx: mpsc::UnboundedSender<Message>,
    room: Option<String>,
}

type Locals = Arc<RwLock<HashMap<String, LocalConn>>>;

#[derive(Clone)]
pub struct Server {
    store: Arc<SessionStore>,
    bus: Arc<dyn RelayBus>,
    locals: Locals,
}

impl Server {
    pub fn new(store: Arc<SessionStore>, bus: Arc<dyn RelayBus>) -> Self {
        Server {
            store,
            bus,
            locals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// One task per connection: reader loop here, writer loop spawned.
    /// When the reader ends (close or transport error) the disconnect
    /// transition runs to completion before the task finishes.
    pub async fn handle_connection(&self, ws: WebSocket) {
        let conn_id = Uuid::new_v4().to_string();
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        self.register(&conn_id, tx).await;
        debug!("connection {conn_id} opened");

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(err) = ws_tx.send(message).await {
                    debug!("outbound send failed: {err}");
                    break;
                }
            }
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) => {
                    let Ok(text) = msg.to_str() else { continue };
                    match serde_json::from_str::<ClientEvent>(text) {
                        Ok(event) => self.handle_client_event(&conn_id, event).await,
                        Err(err) => warn!("dropping malformed client event from {conn_id}: {err}"),
                    }
                }
                Err(err) => {
                    debug!("websocket error on {conn_id}: {err}");
                    break;
                }
            }
        }

        self.handle_disconnect(&conn_id).await;
    }

    async fn register(&self, conn_id: &str, tx: mpsc::UnboundedSender<Message>) {
        let mut locals = self.locals.write().await;
        locals.insert(conn_id.to_string(), LocalConn { tx, room: None });
    }

    async fn handle_client_event(&self, conn_id: &str, event: ClientEvent) {
        match event {
            ClientEvent::Join { username, roomname } => {
                self.handle_join(conn_id, username, roomname).await;
            }
            ClientEvent::ChatMessage { content } => {
                self.handle_chat(conn_id, content).await;
            }
        }
    }

    /// Connected -> Joined. A second join from the same connection
    /// overwrites the previous session; no duplicate-join guard exists.
    async fn handle_join(&self, conn_id: &str, username: String, roomname: String) {
        let joined = self.store.join(conn_id, &username, &roomname).await;
        let count = self.store.count(&roomname).await.value;
        info!(
            "{username} joined room {roomname}, now {count} member(s) ({:?})",
            joined.source
        );

        {
            let mut locals = self.locals.write().await;
            if let Some(conn) = locals.get_mut(conn_id) {
                conn.room = Some(roomname.clone());
            }
        }

        // private welcome, never broadcast
        self.send_to_connection(conn_id, &system_message(WELCOME_TEXT)).await;

        let event = RelayEvent::UserJoined {
            username,
            id: Some(conn_id.to_string()),
        };
        if let Err(err) = self.bus.publish(&roomname, &event).await {
            warn!("failed to publish userJoined to {roomname}: {err}");
        }
    }

    /// Joined -> Joined. Anything that is neither a string nor a tagged
    /// object is dropped with a warning; the connection stays open.
    async fn handle_chat(&self, conn_id: &str, content: serde_json::Value) {
        let session = match self.store.get(conn_id).await.value {
            Some(session) => session,
            None => {
                debug!("chat from {conn_id} with no session, dropped");
                return;
            }
        };

        let Some(content) = Content::from_value(content) else {
            warn!("invalid chat payload from {conn_id}, dropped");
            return;
        };

        // structured payloads may carry their own display name
        let username = content
            .username_override()
            .unwrap_or(&session.name)
            .to_string();
        let envelope = format_message(&username, &session.id, content);

        if let Err(err) = self
            .bus
            .publish(&session.room, &RelayEvent::Message(envelope))
            .await
        {
            warn!("failed to publish message to {}: {err}", session.room);
        }
    }

    /// Joined/Connected -> Closed. Runs once per connection.
    async fn handle_disconnect(&self, conn_id: &str) {
        let left = self.store.leave(conn_id).await;
        if let Some(session) = left.value {
            info!("{} left room {} ({:?})", session.name, session.room, left.source);
            let event = RelayEvent::UserLeft { username: session.name };
            if let Err(err) = self.bus.publish(&session.room, &event).await {
                warn!("failed to publish userLeft to {}: {err}", session.room);
            }
        }

        let mut locals = self.locals.write().await;
        locals.remove(conn_id);
    }

    /// Consumes decoded relay events and re-emits them to this process's
    /// connections. Runs as the single dispatch loop per process, fed by
    /// `RelayBus::run`.
    pub async fn relay_loop(&self, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        while let Some((room, event)) = rx.recv().await {
            match event {
                RelayEvent::Message(envelope) => {
                    self.deliver_local(&room, &envelope, None).await;
                }
                RelayEvent::UserJoined { username, id } => {
                    let notice = system_message(format!("{username} has joined the room"));
                    self.deliver_local(&room, &notice, id.as_deref()).await;
                }
                RelayEvent::UserLeft { username } => {
                    let notice = system_message(format!("{username} has left the room"));
                    self.deliver_local(&room, &notice, None).await;
                }
            }
        }
    }

    /// Delivers an envelope to every local connection bound to `room`,
    /// optionally excluding one connection (the join-notice originator).
    async fn deliver_local(&self, room: &str, envelope: &Envelope, except: Option<&str>) {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to encode envelope for {room}: {err}");
                return;
            }
        };

        let locals = self.locals.read().await;
        for (conn_id, conn) in locals.iter() {
            if conn.room.as_deref() != Some(room) || Some(conn_id.as_str()) == except {
                continue;
            }
            // a closed receiver just means that connection is going away
            let _ = conn.tx.send(Message::text(text.clone()));
        }
    }

    async fn send_to_connection(&self, conn_id: &str, envelope: &Envelope) {
        let Ok(text) = serde_json::to_string(envelope) else {
            return;
        };
        let locals = self.locals.read().await;
        if let Some(conn) = locals.get(conn_id) {
            let _ = conn.tx.send(Message::text(text));
        }
    }
}
