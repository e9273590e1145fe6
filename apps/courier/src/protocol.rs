use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Frames sent from a client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Invoke a named operation; `ack_id` asks for a reply.
    Request {
        event: String,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        ack_id: Option<u64>,
    },
    /// Answer to a server event that asked for an acknowledgement.
    Ack {
        ack_id: u64,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        result: Option<Value>,
    },
}

/// Frames sent from the server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<u64>,
    },
    Ack {
        ack_id: u64,
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsernamePayload {
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateUserPayload {
    pub username: Option<String>,
    #[serde(rename = "publicKey")]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UidPayload {
    #[serde(alias = "UID")]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactRequestPayload {
    #[serde(rename = "recipientUID")]
    pub recipient_uid: Option<String>,
    #[serde(rename = "requestID")]
    pub request_id: Option<String>,
    pub date: Option<i64>,
    #[serde(rename = "isOrigin")]
    pub is_origin: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolveContactRequestPayload {
    #[serde(rename = "requestID")]
    pub request_id: Option<String>,
    pub accepted: Option<bool>,
    #[serde(rename = "channelID")]
    pub channel_id: Option<String>,
    pub date: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KnownRequestsPayload {
    #[serde(rename = "requestIDs")]
    pub request_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KnownChannelsPayload {
    #[serde(rename = "channelIDs")]
    pub channel_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelDeletionPayload {
    #[serde(rename = "channelID")]
    pub channel_id: Option<String>,
    pub date: Option<i64>,
}

/// A chat message; anything beyond the routing fields is opaque content.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "channelID")]
    pub channel_id: Option<String>,
    #[serde(rename = "messageID")]
    pub message_id: Option<String>,
    pub date: Option<i64>,
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageReceiptPayload {
    #[serde(rename = "channelID")]
    pub channel_id: Option<String>,
    #[serde(rename = "messageID")]
    pub message_id: Option<String>,
    /// Original sender of the message being acknowledged.
    #[serde(rename = "originUID")]
    pub origin_uid: Option<String>,
    pub date: Option<i64>,
}

/// Decodes an operation payload; `null` decodes as the all-absent default so
/// that missing fields surface as validation errors rather than parse errors.
pub fn decode<T: for<'de> Deserialize<'de> + Default>(payload: Value) -> Result<T, String> {
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload).map_err(|err| format!("malformed payload: {err}"))
}
