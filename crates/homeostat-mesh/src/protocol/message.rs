//! Mesh messages and acknowledgements

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Type tag of the discovery handshake
pub const PEER_DISCOVERY: &str = "peer_discovery";

/// A peer message: a type tag, an optional sender id and an opaque payload.
///
/// Payload fields are flattened into the top-level JSON object, so
/// `{"type":"genome_update","sender_id":"n1","anoms":3}` carries `anoms` in
/// [`Message::payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Type tag used for dispatch
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Node that produced the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Remaining fields
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Message {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            sender_id: None,
            payload: Map::new(),
        }
    }

    /// Discovery handshake announcing `node_id` with `data`
    pub fn discovery(node_id: impl Into<String>, data: Value) -> Self {
        Self::new(PEER_DISCOVERY)
            .with_field("node_id", Value::String(node_id.into()))
            .with_field("data", data)
    }

    /// Add one payload field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Set the sender id
    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn is_discovery(&self) -> bool {
        self.msg_type == PEER_DISCOVERY
    }

    /// Originating node: `sender_id`, or `node_id` for discovery messages
    pub fn origin(&self) -> Option<&str> {
        self.sender_id
            .as_deref()
            .or_else(|| self.payload.get("node_id").and_then(Value::as_str))
    }
}

/// Reply to every inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Ack {
    Ok { node_id: String },
    Error { node_id: String, reason: String },
}

impl Ack {
    pub fn node_id(&self) -> &str {
        match self {
            Ack::Ok { node_id } | Ack::Error { node_id, .. } => node_id,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Ack::Ok { .. })
    }
}
