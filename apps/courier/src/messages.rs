//! Forwarding of opaque chat messages, delivery receipts and deletions.
//!
//! Messages are never persisted except as outbox events for an offline or
//! unresponsive counterpart.

use serde_json::{json, Value};

use crate::delivery::Envelope;
use crate::error::{require, require_text, CoreError, CoreResult};
use crate::model::{now_millis, EventKind};
use crate::protocol::{MessagePayload, MessageReceiptPayload};
use crate::state::Courier;

impl Courier {
    /// Builds the `receivedMessage` envelope for the sender's counterpart.
    pub async fn send_message(&self, uid: &str, payload: MessagePayload) -> CoreResult<Envelope> {
        let channel_id = require_text(payload.channel_id, "channelID")?;
        let message_id = require_text(payload.message_id, "messageID")?;
        let date = require(payload.date, "date")?;
        let channel = self.member_channel(uid, &channel_id).await?;
        let recipient = channel
            .counterpart(uid)
            .ok_or_else(|| CoreError::Validation("channel has no counterpart".into()))?;

        let mut body = payload.content;
        body.insert("channelID".into(), Value::from(channel_id));
        body.insert("messageID".into(), Value::from(message_id));
        body.insert("date".into(), Value::from(date));
        body.insert("originUID".into(), Value::from(uid));
        Ok(Envelope::new(
            EventKind::ReceivedMessage,
            uid,
            recipient,
            Value::Object(body),
        ))
    }

    /// Builds the `deliveredMessage` receipt for the message's original sender.
    pub async fn delivered_message(
        &self,
        uid: &str,
        payload: MessageReceiptPayload,
    ) -> CoreResult<Envelope> {
        let channel_id = require_text(payload.channel_id, "channelID")?;
        let message_id = require_text(payload.message_id, "messageID")?;
        let origin_uid = require_text(payload.origin_uid, "originUID")?;
        let channel = self.member_channel(uid, &channel_id).await?;
        if channel.counterpart(uid) != Some(origin_uid.as_str()) {
            return Err(CoreError::Validation(
                "receipts go to the other member of the channel".into(),
            ));
        }
        Ok(Envelope::new(
            EventKind::DeliveredMessage,
            uid,
            &origin_uid,
            json!({
                "channelID": channel_id,
                "messageID": message_id,
                "recipientUID": uid,
                "date": payload.date.unwrap_or_else(now_millis),
            }),
        ))
    }

    /// Builds the `deletedMessage` notice for the sender's counterpart.
    pub async fn delete_message(
        &self,
        uid: &str,
        payload: MessageReceiptPayload,
    ) -> CoreResult<Envelope> {
        let channel_id = require_text(payload.channel_id, "channelID")?;
        let message_id = require_text(payload.message_id, "messageID")?;
        let channel = self.member_channel(uid, &channel_id).await?;
        let recipient = channel
            .counterpart(uid)
            .ok_or_else(|| CoreError::Validation("channel has no counterpart".into()))?;
        Ok(Envelope::new(
            EventKind::DeletedMessage,
            uid,
            recipient,
            json!({
                "channelID": channel_id,
                "messageID": message_id,
                "originUID": uid,
                "date": payload.date.unwrap_or_else(now_millis),
            }),
        ))
    }
}
