use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};

pub type Uid = String;
pub type ConnectionId = String;
pub type EventId = i64;

/// Current wall clock in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a server-side identifier (user ids, channel ids, connection ids).
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub uid: Uid,
    pub username: String,
    #[serde(default)]
    pub public_key: Option<String>,
    pub creation_date: i64,
}

impl User {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            uid: self.uid.clone(),
            username: self.username.clone(),
            public_key: self.public_key.clone(),
        }
    }
}

/// Public view of a user as sent to other clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    #[serde(rename = "UID")]
    pub uid: Uid,
    pub username: String,
    #[serde(rename = "publicKey", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactRequest {
    pub request_id: String,
    pub origin_uid: Uid,
    pub recipient_uid: Uid,
    pub request_date: i64,
}

impl ContactRequest {
    /// The other party of the request as seen by `uid`.
    pub fn counterpart(&self, uid: &str) -> Option<&str> {
        if self.origin_uid == uid {
            Some(&self.recipient_uid)
        } else if self.recipient_uid == uid {
            Some(&self.origin_uid)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuChannel {
    pub channel_id: String,
    pub member_a: Uid,
    pub member_b: Uid,
    pub creation_date: i64,
}

impl RuChannel {
    pub fn counterpart(&self, uid: &str) -> Option<&str> {
        if self.member_a == uid {
            Some(&self.member_b)
        } else if self.member_b == uid {
            Some(&self.member_a)
        } else {
            None
        }
    }

    pub fn has_member(&self, uid: &str) -> bool {
        self.counterpart(uid).is_some()
    }

    /// Push shape shared by reconciliation and contact-request results.
    pub fn payload_for(&self, counterpart: &UserProfile) -> Value {
        json!({
            "channelID": self.channel_id,
            "creationDate": self.creation_date,
            "user": counterpart,
        })
    }
}

/// An undelivered event waiting in a recipient's outbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub event_name: String,
    pub timestamp: i64,
    pub origin_uid: Uid,
    pub recipient_uid: Uid,
    #[serde(with = "blob")]
    pub payload: Vec<u8>,
}

impl StoredEvent {
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.event_name)
    }

    pub fn payload_json(&self) -> CoreResult<Value> {
        if self.payload.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.payload).map_err(|err| {
            CoreError::Storage(format!(
                "event {} payload is not valid JSON: {err}",
                self.event_id
            ))
        })
    }

    /// Encoding used inside a `receivedPendingEvents` batch.
    pub fn to_wire(&self) -> Value {
        let payload = serde_json::from_slice::<Value>(&self.payload)
            .unwrap_or_else(|_| Value::String(STANDARD.encode(&self.payload)));
        json!({
            "eventName": self.event_name,
            "timestamp": self.timestamp,
            "originUID": self.origin_uid,
            "payload": payload,
        })
    }
}

/// A stored event before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_name: String,
    pub timestamp: i64,
    pub origin_uid: Uid,
    pub recipient_uid: Uid,
    pub payload: Vec<u8>,
}

impl NewEvent {
    pub fn with_id(self, event_id: EventId) -> StoredEvent {
        StoredEvent {
            event_id,
            event_name: self.event_name,
            timestamp: self.timestamp,
            origin_uid: self.origin_uid,
            recipient_uid: self.recipient_uid,
            payload: self.payload,
        }
    }
}

/// Server → client event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ReceivedCr,
    ReceivedCrResult,
    ReceivedRuChannel,
    ReceivedCd,
    ReceivedMessage,
    DeliveredMessage,
    DeletedMessage,
    UserConnect,
    UserDisconnect,
    ReceivedPendingEvents,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::ReceivedCr => "receivedCR",
            EventKind::ReceivedCrResult => "receivedCRResult",
            EventKind::ReceivedRuChannel => "receivedRUChannel",
            EventKind::ReceivedCd => "receivedCD",
            EventKind::ReceivedMessage => "receivedMessage",
            EventKind::DeliveredMessage => "deliveredMessage",
            EventKind::DeletedMessage => "deletedMessage",
            EventKind::UserConnect => "userConnect",
            EventKind::UserDisconnect => "userDisconnect",
            EventKind::ReceivedPendingEvents => "receivedPendingEvents",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        const ALL: [EventKind; 10] = [
            EventKind::ReceivedCr,
            EventKind::ReceivedCrResult,
            EventKind::ReceivedRuChannel,
            EventKind::ReceivedCd,
            EventKind::ReceivedMessage,
            EventKind::DeliveredMessage,
            EventKind::DeletedMessage,
            EventKind::UserConnect,
            EventKind::UserDisconnect,
            EventKind::ReceivedPendingEvents,
        ];
        ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

mod blob {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
