//! Wire protocol for party events.
//!
//! Every event on a party topic is one JSON object (camelCase keys, the
//! shape the room backend speaks):
//!
//! ```text
//! { "partyId": "p1", "userId": 7, "userName": "Ada",
//!   "eventType": "SEEK", "payload": { "time": 120.0 },
//!   "timestamp": "2026-08-24T19:03:11Z" }
//! ```
//!
//! Clients publish control events on `/app/party/{id}/control` and chat on
//! `/app/party/{id}/chat`; the broker fans everything back out on
//! `/topic/party/{id}` to every subscriber, the publisher included. Echo
//! handling is the dispatcher's job, not the protocol's.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Event types carried on a party topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartyEventType {
    Play,
    Pause,
    Seek,
    SyncRequest,
    Chat,
    UserJoined,
    UserLeft,
    PartyDeleted,
}

impl PartyEventType {
    /// Whether this type travels on the control destination (chat has its
    /// own sub-destination).
    pub fn is_control(&self) -> bool {
        !matches!(self, PartyEventType::Chat)
    }
}

/// Variant payloads, untagged on the wire.
///
/// `SEEK` carries `{time}`, `CHAT` carries `{message}`, and the
/// membership/teardown events carry a free-form notice string produced by
/// the room backend ("Ada joined the party").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Seek { time: f64 },
    Chat { message: String },
    Notice(String),
}

/// Originator timestamps: ISO-8601 string or epoch number, depending on
/// which producer stamped the event. Never interpreted locally, only
/// carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventTimestamp {
    Iso(String),
    Epoch(f64),
}

impl EventTimestamp {
    /// Local wall-clock time, RFC 3339.
    pub fn now() -> Self {
        EventTimestamp::Iso(Utc::now().to_rfc3339())
    }
}

/// Identity injected into locally originated events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: u64,
    pub user_name: String,
}

impl UserIdentity {
    pub fn new(user_id: u64, user_name: impl Into<String>) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
        }
    }
}

/// A single event on a party topic, immutable once sent.
///
/// `user_id`/`user_name` are absent for system-originated events
/// (membership notifications, party teardown).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyEvent {
    pub party_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub event_type: PartyEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<EventPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<EventTimestamp>,
}

/// A decoded event, matched exhaustively by the dispatcher.
///
/// This is the typed replacement for duck-typing `payload.time` /
/// `payload.message` off the raw wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum PartyAction {
    Play,
    Pause,
    Seek { time: f64 },
    SyncRequest,
    Chat { message: String },
    UserJoined { notice: Option<String> },
    UserLeft { notice: Option<String> },
    PartyDeleted { notice: Option<String> },
}

impl PartyAction {
    pub fn event_type(&self) -> PartyEventType {
        match self {
            PartyAction::Play => PartyEventType::Play,
            PartyAction::Pause => PartyEventType::Pause,
            PartyAction::Seek { .. } => PartyEventType::Seek,
            PartyAction::SyncRequest => PartyEventType::SyncRequest,
            PartyAction::Chat { .. } => PartyEventType::Chat,
            PartyAction::UserJoined { .. } => PartyEventType::UserJoined,
            PartyAction::UserLeft { .. } => PartyEventType::UserLeft,
            PartyAction::PartyDeleted { .. } => PartyEventType::PartyDeleted,
        }
    }

    fn payload(&self) -> Option<EventPayload> {
        match self {
            PartyAction::Seek { time } => Some(EventPayload::Seek { time: *time }),
            PartyAction::Chat { message } => Some(EventPayload::Chat {
                message: message.clone(),
            }),
            PartyAction::UserJoined { notice }
            | PartyAction::UserLeft { notice }
            | PartyAction::PartyDeleted { notice } => {
                notice.clone().map(EventPayload::Notice)
            }
            _ => None,
        }
    }
}

impl PartyEvent {
    /// Build an outbound event from a local action, stamping identity and
    /// the current time.
    pub fn from_action(
        party_id: impl Into<String>,
        identity: &UserIdentity,
        action: &PartyAction,
    ) -> Self {
        Self {
            party_id: party_id.into(),
            user_id: Some(identity.user_id),
            user_name: Some(identity.user_name.clone()),
            event_type: action.event_type(),
            payload: action.payload(),
            timestamp: Some(EventTimestamp::now()),
        }
    }

    /// Decode the typed action, matching payload against event type.
    ///
    /// A `SEEK` without a time or a `CHAT` without a message is malformed;
    /// stray payloads on payload-less types are ignored.
    pub fn action(&self) -> Result<PartyAction, ProtocolError> {
        match self.event_type {
            PartyEventType::Play => Ok(PartyAction::Play),
            PartyEventType::Pause => Ok(PartyAction::Pause),
            PartyEventType::SyncRequest => Ok(PartyAction::SyncRequest),
            PartyEventType::Seek => match &self.payload {
                Some(EventPayload::Seek { time }) => Ok(PartyAction::Seek { time: *time }),
                _ => Err(ProtocolError::MissingField("time")),
            },
            PartyEventType::Chat => match &self.payload {
                Some(EventPayload::Chat { message }) => Ok(PartyAction::Chat {
                    message: message.clone(),
                }),
                _ => Err(ProtocolError::MissingField("message")),
            },
            PartyEventType::UserJoined => Ok(PartyAction::UserJoined {
                notice: self.notice(),
            }),
            PartyEventType::UserLeft => Ok(PartyAction::UserLeft {
                notice: self.notice(),
            }),
            PartyEventType::PartyDeleted => Ok(PartyAction::PartyDeleted {
                notice: self.notice(),
            }),
        }
    }

    fn notice(&self) -> Option<String> {
        match &self.payload {
            Some(EventPayload::Notice(text)) => Some(text.clone()),
            _ => None,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the JSON wire form.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Outbound destination for control events.
pub fn control_destination(party_id: &str) -> String {
    format!("/app/party/{party_id}/control")
}

/// Outbound destination for chat events.
pub fn chat_destination(party_id: &str) -> String {
    format!("/app/party/{party_id}/chat")
}

/// Subscription topic carrying the fan-out for one party.
pub fn party_topic(party_id: &str) -> String {
    format!("/topic/party/{party_id}")
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    MissingField(&'static str),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::MissingField(field) => write!(f, "Payload missing field `{field}`"),
        }
    }
}

impl std::error::Error for ProtocolError {}
