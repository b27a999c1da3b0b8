//! Session messages — the envelope exchanged between peers.
//!
//! A [`SessionMessage`] carries routing fields (`tag`, `source`,
//! `destination`) plus an opaque JSON payload. The driver never looks inside
//! the payload and never mutates a message once it has been handed over for
//! sending.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved destination meaning "every registered peer".
pub const WILDCARD: &str = "*";

/// Whether the sender expects the session to continue past this message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Part of a request/reply exchange; replies reuse the `session_id`.
    Task,
    /// Fire-and-forget.
    #[default]
    Notification,
}

/// The unit of communication between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Message purpose, chosen by the caller.
    pub tag: String,
    /// Logical name of the sending peer.
    pub source: String,
    /// Logical name of the receiving peer, or [`WILDCARD`].
    pub destination: String,
    /// Opaque payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Correlation ID shared by every message of a session.
    pub session_id: Uuid,
    /// Unique ID of this message.
    pub message_id: Uuid,
    /// Session kind.
    #[serde(default)]
    pub session_type: SessionType,
    /// When the message was constructed.
    pub timestamp: DateTime<Utc>,
}

impl SessionMessage {
    /// Create a fire-and-forget message with a fresh session.
    pub fn new(
        tag: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        payload: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            tag: tag.into(),
            source: source.into(),
            destination: destination.into(),
            payload: payload.into(),
            session_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            session_type: SessionType::default(),
            timestamp: Utc::now(),
        }
    }

    /// Create a message addressed to every registered peer.
    pub fn to_all(
        tag: impl Into<String>,
        source: impl Into<String>,
        payload: impl Into<serde_json::Value>,
    ) -> Self {
        Self::new(tag, source, WILDCARD, payload)
    }

    /// Create a message whose payload is any serializable value.
    pub fn with_payload<T: Serialize>(
        tag: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self::new(tag, source, destination, payload))
    }

    /// Attach the message to an existing session (e.g. a reply).
    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }

    /// Set the session type.
    pub fn with_session_type(mut self, session_type: SessionType) -> Self {
        self.session_type = session_type;
        self
    }

    /// Decode the payload into a caller type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Whether the destination is the wildcard.
    pub fn is_broadcast(&self) -> bool {
        self.destination == WILDCARD
    }

    /// Build a reply in the same session, addressed back to the sender.
    pub fn reply(&self, tag: impl Into<String>, payload: impl Into<serde_json::Value>) -> Self {
        Self::new(tag, self.destination.clone(), self.source.clone(), payload)
            .with_session_id(self.session_id)
            .with_session_type(self.session_type)
    }
}

impl std::fmt::Display for SessionMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} -> {} (session {})",
            self.tag, self.source, self.destination, self.session_id
        )
    }
}
