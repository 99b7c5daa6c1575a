use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved sender id for server-generated notices. Clients render
/// messages carrying this id distinctly from user messages.
pub const SYSTEM_ID: &str = "1357";
/// Display name attached to system notices.
pub const SYSTEM_NAME: &str = "GossiBot";

/// Message body: plain text, or a tagged structured payload
/// (e.g. `{type, url, caption}`) whose fields are merged into the
/// envelope verbatim.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text { text: String },
    Structured(Map<String, Value>),
}

/// Decode resolution must be discriminator-aware: a structured payload
/// may itself carry a `text` field, and matching the text shape first
/// would drop every other field on the relay inbound path.
impl<'de> serde::Deserialize<'de> for Content {
    fn deserialize<D>(deserializer: D) -> Result<Content, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let mut map = Map::deserialize(deserializer)?;
        if map.contains_key("type") {
            return Ok(Content::Structured(map));
        }
        match map.remove("text") {
            Some(Value::String(text)) if map.is_empty() => Ok(Content::Text { text }),
            Some(other) => {
                map.insert("text".to_string(), other);
                Ok(Content::Structured(map))
            }
            None => Ok(Content::Structured(map)),
        }
    }
}

impl Content {
    /// Accepts a raw client payload: a string, or an object carrying a
    /// `type` discriminator. Anything else is rejected.
    pub fn from_value(value: Value) -> Option<Content> {
        match value {
            Value::String(text) => Some(Content::Text { text }),
            Value::Object(map) if map.contains_key("type") => Some(Content::Structured(map)),
            _ => None,
        }
    }

    /// Display-name override carried by structured payloads (relayed
    /// "as" identities). Plain text never overrides.
    pub fn username_override(&self) -> Option<&str> {
        match self {
            Content::Text { .. } => None,
            Content::Structured(map) => map.get("username").and_then(Value::as_str),
        }
    }
}

/// Canonical timestamped shape of a chat event as delivered to clients.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Envelope {
    pub username: String,
    pub id: String,
    #[serde(flatten)]
    pub content: Content,
    pub time: String,
}

/// Builds an envelope with a locally-generated wall-clock timestamp.
/// The client never supplies the time.
pub fn format_message(username: &str, id: &str, content: Content) -> Envelope {
    Envelope {
        username: username.to_string(),
        id: id.to_string(),
        content,
        time: chrono::Local::now().format("%H:%M").to_string(),
    }
}

/// System notice (welcome, joined, left) under the reserved identity.
pub fn system_message(text: impl Into<String>) -> Envelope {
    format_message(SYSTEM_NAME, SYSTEM_ID, Content::Text { text: text.into() })
}

/// Events a client sends over its connection.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "join")]
    Join { username: String, roomname: String },
    #[serde(rename = "chatMessage")]
    ChatMessage { content: Value },
}

/// Wire-level event published on a room's relay channel as
/// `{type, payload}`. Consumed by every process subscribed to the room,
/// including the originator, and discarded after delivery.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", content = "payload")]
pub enum RelayEvent {
    #[serde(rename = "message")]
    Message(Envelope),
    #[serde(rename = "userJoined")]
    UserJoined {
        username: String,
        /// Originating connection, so the joiner is not echoed its own
        /// join notice (it already got the private welcome).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename = "userLeft")]
    UserLeft { username: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_content_serializes_under_text_field() {
        let envelope = format_message("Bob", "abc", Content::Text { text: "hello".into() });
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["username"], "Bob");
        assert_eq!(value["id"], "abc");
        assert_eq!(value["text"], "hello");
        assert!(!value["time"].as_str().unwrap().is_empty());
    }

    #[test]
    fn structured_content_merges_fields_into_envelope() {
        let content = Content::from_value(json!({
            "type": "image",
            "url": "https://example.com/cat.png",
            "caption": "a cat"
        }))
        .unwrap();
        let envelope = format_message("Alice", "xyz", content);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["username"], "Alice");
        assert_eq!(value["type"], "image");
        assert_eq!(value["url"], "https://example.com/cat.png");
        assert_eq!(value["caption"], "a cat");
        assert!(value.get("text").is_none());
    }

    #[test]
    fn structured_content_with_text_field_survives_relay_decode() {
        let content = Content::from_value(json!({
            "type": "image",
            "url": "https://example.com/cat.png",
            "text": "a cat"
        }))
        .unwrap();
        let envelope = format_message("Alice", "xyz", content.clone());

        let encoded = serde_json::to_string(&RelayEvent::Message(envelope)).unwrap();
        let decoded: RelayEvent = serde_json::from_str(&encoded).unwrap();
        match decoded {
            RelayEvent::Message(received) => {
                assert_eq!(received.content, content);
                assert_eq!(received.username, "Alice");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn plain_text_envelope_still_decodes_as_text() {
        let encoded = r#"{"username": "Bob", "id": "abc", "text": "hello", "time": "12:34"}"#;
        let envelope: Envelope = serde_json::from_str(encoded).unwrap();
        assert_eq!(envelope.content, Content::Text { text: "hello".into() });
    }

    #[test]
    fn formatter_is_structurally_idempotent() {
        let a = format_message("Bob", "abc", Content::Text { text: "hi".into() });
        let b = format_message("Bob", "abc", Content::Text { text: "hi".into() });
        assert_eq!(a.username, b.username);
        assert_eq!(a.id, b.id);
        assert_eq!(a.content, b.content);
    }

    #[test]
    fn rejects_untagged_objects_and_non_text() {
        assert!(Content::from_value(json!({"url": "no-discriminator"})).is_none());
        assert!(Content::from_value(json!(42)).is_none());
        assert!(Content::from_value(json!(["a", "b"])).is_none());
        assert!(Content::from_value(json!("plain")).is_some());
    }

    #[test]
    fn structured_payload_can_override_display_name() {
        let content = Content::from_value(json!({"type": "relay", "username": "Carol"})).unwrap();
        assert_eq!(content.username_override(), Some("Carol"));
        let text = Content::Text { text: "hi".into() };
        assert_eq!(text.username_override(), None);
    }

    #[test]
    fn relay_event_wire_format_is_type_payload() {
        let event = RelayEvent::UserJoined { username: "Alice".into(), id: None };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "userJoined");
        assert_eq!(value["payload"]["username"], "Alice");
        assert!(value["payload"].get("id").is_none());

        let parsed: RelayEvent =
            serde_json::from_value(json!({"type": "userLeft", "payload": {"username": "Bob"}}))
                .unwrap();
        assert!(matches!(parsed, RelayEvent::UserLeft { username } if username == "Bob"));
    }

    #[test]
    fn client_join_event_parses() {
        let parsed: ClientEvent = serde_json::from_str(
            r#"{"type": "join", "username": "Alice", "roomname": "general"}"#,
        )
        .unwrap();
        match parsed {
            ClientEvent::Join { username, roomname } => {
                assert_eq!(username, "Alice");
                assert_eq!(roomname, "general");
            }
            ClientEvent::ChatMessage { .. } => panic!("expected join"),
        }
    }
}
