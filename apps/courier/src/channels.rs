use std::collections::BTreeSet;

use serde_json::json;
use tracing::{info, warn};

use crate::delivery::{DeliveryOutcome, Envelope, Route};
use crate::error::{require_text, CoreError, CoreResult};
use crate::model::{now_millis, EventKind, RuChannel, Uid};
use crate::protocol::ChannelDeletionPayload;
use crate::state::Courier;
use crate::store::{Predicate, StoreError, Table};

impl Courier {
    /// The channel `channel_id`, provided `uid` is one of its members.
    pub async fn member_channel(&self, uid: &str, channel_id: &str) -> CoreResult<RuChannel> {
        let channel = self.store().fetch_channel(channel_id).await?;
        if !channel.has_member(uid) {
            return Err(CoreError::Validation(format!(
                "user is not a member of channel `{channel_id}`"
            )));
        }
        Ok(channel)
    }

    /// Everyone `uid` shares a channel with.
    pub async fn channel_counterparts(&self, uid: &str) -> CoreResult<BTreeSet<Uid>> {
        let channels = self.store().channels_for(uid).await?;
        Ok(channels
            .iter()
            .filter_map(|channel| channel.counterpart(uid))
            .filter(|counterpart| *counterpart != uid)
            .map(str::to_string)
            .collect())
    }

    /// Whether `uid` shares a channel or a pending request with `other`.
    pub async fn is_related(&self, uid: &str, other: &str) -> CoreResult<bool> {
        if self.channel_counterparts(uid).await?.contains(other) {
            return Ok(true);
        }
        let requests = self.store().contact_requests_for(uid).await?;
        Ok(requests
            .iter()
            .any(|request| request.counterpart(uid) == Some(other)))
    }

    /// Pushes channel `channel_id` to `viewer_uid` with the counterpart's profile.
    ///
    /// A channel whose counterpart no longer exists is dangling: it is deleted
    /// and the lookup error returned, so it is never pushed.
    pub async fn received_ru_channel(
        &self,
        route: &Route,
        viewer_uid: &str,
        channel_id: &str,
    ) -> CoreResult<DeliveryOutcome> {
        let channel = match self.store().fetch_channel(channel_id).await {
            Ok(channel) => channel,
            Err(StoreError::EmptyResult { .. }) => return Ok(DeliveryOutcome::Skipped),
            Err(err) => return Err(err.into()),
        };
        let Some(counterpart_uid) = channel.counterpart(viewer_uid) else {
            return Err(CoreError::Validation(format!(
                "user is not a member of channel `{channel_id}`"
            )));
        };

        let counterpart = match self.store().fetch_user(counterpart_uid).await {
            Ok(user) => user,
            Err(err @ StoreError::EmptyResult { .. }) => {
                self.prune_channel(&channel).await;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        let envelope = Envelope::new(
            EventKind::ReceivedRuChannel,
            counterpart_uid,
            viewer_uid,
            channel.payload_for(&counterpart.profile()),
        );
        self.deliver(route, &envelope, self.settings().ack_timeout)
            .await
    }

    async fn prune_channel(&self, channel: &RuChannel) {
        match self.delete_channel(&channel.channel_id).await {
            Ok(_) => info!(channel_id = %channel.channel_id, "pruned channel with a deleted member"),
            Err(err) => warn!(channel_id = %channel.channel_id, error = %err, "failed to prune dangling channel"),
        }
    }

    async fn delete_channel(&self, channel_id: &str) -> CoreResult<usize> {
        Ok(self
            .store()
            .delete_records(Table::Channels, &Predicate::eq("channel_id", channel_id))
            .await?)
    }

    /// Deletes a channel on behalf of one of its members.
    ///
    /// The deletion is durable immediately; the counterpart learns about it
    /// through [`Courier::received_cd`].
    pub async fn create_channel_deletion(
        &self,
        uid: &str,
        payload: ChannelDeletionPayload,
    ) -> CoreResult<(RuChannel, i64)> {
        let channel_id = require_text(payload.channel_id, "channelID")?;
        let channel = self.member_channel(uid, &channel_id).await?;
        self.delete_channel(&channel_id).await?;
        info!(channel_id = %channel_id, uid = %uid, "channel deleted");
        Ok((channel, payload.date.unwrap_or_else(now_millis)))
    }

    /// Notifies the other member that `deleted_by` removed `channel`.
    pub async fn received_cd(&self, channel: &RuChannel, deleted_by: &str, date: i64) {
        let Some(counterpart) = channel.counterpart(deleted_by) else {
            return;
        };
        let envelope = Envelope::new(
            EventKind::ReceivedCd,
            deleted_by,
            counterpart,
            json!({
                "channelID": channel.channel_id,
                "originUID": deleted_by,
                "date": date,
            }),
        );
        self.notify(envelope).await;
    }

    /// Deletes every channel `uid` belongs to and returns the ones actually
    /// removed. A channel that fails to delete is logged and skipped.
    pub async fn reset_channels(&self, uid: &str) -> CoreResult<Vec<RuChannel>> {
        let channels = self.store().channels_for(uid).await?;
        let mut removed = Vec::with_capacity(channels.len());
        for channel in channels {
            match self.delete_channel(&channel.channel_id).await {
                Ok(0) => {}
                Ok(_) => removed.push(channel),
                Err(err) => {
                    warn!(uid = %uid, channel_id = %channel.channel_id, error = %err, "channel not reset");
                }
            }
        }
        info!(uid = %uid, count = removed.len(), "channels reset");
        Ok(removed)
    }
}
