//! Wire envelope shared by both directions of a client connection.
//!
//! Every frame is `{"event": <kind>, "data": <payload>}`. Browsers send the
//! payload as a JSON string holding encoded JSON; inline JSON values are
//! accepted as well.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A serialized message queued for one session.
pub type Outbound = Arc<str>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Chat,
    Offer,
    Answer,
    Candidate,
    Info,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireMessage {
    #[serde(default)]
    pub event: EventKind,
    #[serde(default)]
    pub data: Value,
}

impl WireMessage {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Envelope whose payload is carried as a string of encoded JSON.
    pub fn encoded<T: Serialize>(event: EventKind, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event,
            data: Value::String(serde_json::to_string(payload)?),
        })
    }

    /// Envelope whose payload is an inline JSON value.
    pub fn inline<T: Serialize>(event: EventKind, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event,
            data: serde_json::to_value(payload)?,
        })
    }

    pub fn info(no_connections: usize) -> Result<Self, serde_json::Error> {
        Self::inline(EventKind::Info, &Info { no_connections })
    }

    pub fn chat(chat: &ChatMessage) -> Result<Self, serde_json::Error> {
        Self::encoded(EventKind::Chat, chat)
    }

    /// Decodes the payload, unwrapping string-encoded JSON first.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.data {
            Value::String(encoded) => serde_json::from_str(encoded),
            other => T::deserialize(other),
        }
    }

    pub fn to_outbound(&self) -> Result<Outbound, serde_json::Error> {
        Ok(serde_json::to_string(self)?.into())
    }
}

/// One line on the chat board.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub message: String,
    /// Empty when the sender left it absent or `null`.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub nick: String,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Hub statistics pushed to every client when the connection count changes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Info {
    pub no_connections: usize,
}
