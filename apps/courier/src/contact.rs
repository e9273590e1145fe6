//! Contact-request handshake: create, push to recipient, resolve or roll back.

use metrics::counter;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::delivery::{DeliveryOutcome, Envelope, Route};
use crate::error::{require, require_text, CoreError, CoreResult};
use crate::model::{generate_id, now_millis, ContactRequest, EventKind, RuChannel, User};
use crate::protocol::{ContactRequestPayload, ResolveContactRequestPayload};
use crate::state::Courier;
use crate::store::{Predicate, StoreError, Table};

/// Result of `resolveContactRequest` as seen by the resolving user.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub request: ContactRequest,
    pub accepted: bool,
    pub channel: Option<RuChannel>,
    /// The origin's profile, embedded in the resolver's copy of the channel.
    pub origin: User,
}

impl Resolution {
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "requestID": self.request.request_id,
            "accepted": self.accepted,
        });
        if let Some(channel) = &self.channel {
            body["channel"] = channel.payload_for(&self.origin.profile());
        }
        body
    }
}

impl ContactRequest {
    pub fn to_json(&self) -> Value {
        json!({
            "requestID": self.request_id,
            "originUID": self.origin_uid,
            "recipientUID": self.recipient_uid,
            "date": self.request_date,
        })
    }
}

impl Courier {
    /// Validates and records a pending request from `origin_uid`.
    ///
    /// The caller acknowledges the origin with the returned record and then
    /// pushes it to the recipient with [`Courier::received_cr`].
    pub async fn send_cr(
        &self,
        origin_uid: &str,
        payload: ContactRequestPayload,
    ) -> CoreResult<ContactRequest> {
        let request_id = require_text(payload.request_id, "requestID")?;
        let date = require(payload.date, "date")?;
        let is_origin = require(payload.is_origin, "isOrigin")?;
        let recipient_uid = require_text(payload.recipient_uid, "recipientUID")?;
        if !is_origin {
            return Err(CoreError::Validation(
                "contact requests can only be sent by their origin".into(),
            ));
        }
        if recipient_uid == origin_uid {
            return Err(CoreError::Validation(
                "cannot send a contact request to yourself".into(),
            ));
        }
        self.store().fetch_user(&recipient_uid).await?;

        let request = ContactRequest {
            request_id,
            origin_uid: origin_uid.to_string(),
            recipient_uid,
            request_date: date,
        };
        self.store().create_cr(&request).await?;
        info!(
            request_id = %request.request_id,
            origin = %request.origin_uid,
            recipient = %request.recipient_uid,
            "contact request pending"
        );
        Ok(request)
    }

    /// Pushes the pending request `request_id` to `viewer_uid` with the other
    /// party's profile attached.
    ///
    /// A request that no longer exists is [`DeliveryOutcome::Skipped`]. Any
    /// failure after that point rolls the request back.
    pub async fn received_cr(
        &self,
        route: &Route,
        viewer_uid: &str,
        request_id: &str,
    ) -> CoreResult<DeliveryOutcome> {
        let request = match self.store().fetch_cr(request_id).await {
            Ok(request) => request,
            Err(StoreError::EmptyResult { .. }) => return Ok(DeliveryOutcome::Skipped),
            Err(err) => return Err(err.into()),
        };
        let Some(counterpart_uid) = request.counterpart(viewer_uid).map(str::to_string) else {
            return Err(CoreError::Validation(format!(
                "user is not a party to contact request `{request_id}`"
            )));
        };

        let result = self
            .push_cr(route, &request, viewer_uid, &counterpart_uid)
            .await;
        if let Err(err) = &result {
            warn!(
                request_id = %request_id,
                viewer = %viewer_uid,
                reason = err.kind(),
                error = %err,
                "contact request delivery failed"
            );
            self.received_cr_failure(Some(request_id)).await;
        }
        result
    }

    async fn push_cr(
        &self,
        route: &Route,
        request: &ContactRequest,
        viewer_uid: &str,
        counterpart_uid: &str,
    ) -> CoreResult<DeliveryOutcome> {
        let counterpart = self.store().fetch_user(counterpart_uid).await?;
        let payload = json!({
            "requestID": request.request_id,
            "date": request.request_date,
            "isOrigin": request.origin_uid == viewer_uid,
            "originUID": request.origin_uid,
            "recipientUID": request.recipient_uid,
            "user": counterpart.profile(),
        });
        let envelope = Envelope::new(EventKind::ReceivedCr, counterpart_uid, viewer_uid, payload);
        self.deliver(route, &envelope, self.settings().ack_timeout)
            .await
    }

    /// Rolls back a pending request whose delivery failed. Never raises.
    pub async fn received_cr_failure(&self, request_id: Option<&str>) {
        let Some(request_id) = request_id.filter(|id| !id.is_empty()) else {
            warn!("contact request rollback without a requestID");
            return;
        };
        match self
            .store()
            .delete_records(
                Table::ContactRequests,
                &Predicate::eq("request_id", request_id),
            )
            .await
        {
            Ok(removed) => {
                counter!("courier_contact_request_rollbacks_total").increment(1);
                info!(request_id = %request_id, removed, "contact request rolled back");
            }
            Err(err) => warn!(request_id = %request_id, error = %err, "contact request rollback failed"),
        }
    }

    /// Accepts or denies a pending request addressed to `resolver_uid`.
    ///
    /// The request is deleted either way; on accept a channel is created for
    /// both members. If channel creation fails the request is restored.
    /// Of several concurrent resolutions only the one that deletes the
    /// request proceeds; the rest fail with [`CoreError::EmptyResult`].
    pub async fn send_cr_result(
        &self,
        resolver_uid: &str,
        payload: ResolveContactRequestPayload,
    ) -> CoreResult<Resolution> {
        let request_id = require_text(payload.request_id, "requestID")?;
        let accepted = require(payload.accepted, "accepted")?;
        let request = self.store().fetch_cr(&request_id).await?;
        if request.recipient_uid != resolver_uid {
            return Err(CoreError::Validation(
                "only the recipient can resolve a contact request".into(),
            ));
        }

        let origin = match self.store().fetch_user(&request.origin_uid).await {
            Ok(origin) => origin,
            Err(err @ StoreError::EmptyResult { .. }) => {
                // The origin is gone; the request is dangling.
                self.received_cr_failure(Some(&request_id)).await;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        // Whoever removes the request owns the resolution.
        let removed = self
            .store()
            .delete_records(
                Table::ContactRequests,
                &Predicate::eq("request_id", request_id.as_str()),
            )
            .await?;
        if removed == 0 {
            return Err(CoreError::EmptyResult {
                table: Table::ContactRequests,
            });
        }

        let mut channel = None;
        if accepted {
            let created = RuChannel {
                channel_id: payload
                    .channel_id
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(generate_id),
                member_a: request.origin_uid.clone(),
                member_b: request.recipient_uid.clone(),
                creation_date: payload.date.unwrap_or_else(now_millis),
            };
            if let Err(err) = self.store().create_ru_channel(&created).await {
                if let Err(restore) = self.store().create_cr(&request).await {
                    warn!(request_id = %request_id, error = %restore, "failed to restore contact request");
                }
                return Err(err.into());
            }
            channel = Some(created);
        }

        info!(request_id = %request_id, accepted, "contact request resolved");
        Ok(Resolution {
            request,
            accepted,
            channel,
            origin,
        })
    }

    /// Tells the origin how their request was resolved. Stored if they are
    /// offline; never rolls back the resolution.
    pub async fn received_cr_result(&self, resolution: &Resolution) {
        let resolver_uid = resolution.request.recipient_uid.as_str();
        let mut payload = json!({
            "requestID": resolution.request.request_id,
            "accepted": resolution.accepted,
        });
        if let Some(channel) = &resolution.channel {
            match self.store().fetch_user(resolver_uid).await {
                Ok(resolver) => payload["channel"] = channel.payload_for(&resolver.profile()),
                Err(err) => {
                    warn!(uid = %resolver_uid, error = %err, "resolver vanished before notifying origin");
                    return;
                }
            }
        }
        let envelope = Envelope::new(
            EventKind::ReceivedCrResult,
            resolver_uid,
            &resolution.request.origin_uid,
            payload,
        );
        self.notify(envelope).await;
    }
}
