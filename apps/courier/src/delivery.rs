//! Delivery primitives and their presence-gated compositions.
//!
//! `emit*_or_store` treat "we don't know whether the client got it" as a
//! reason to persist the event, and "the client got it and said no" as an
//! error the caller must handle. Nothing here retries in place.

use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::model::{now_millis, ConnectionId, EventId, EventKind, NewEvent, Uid};
use crate::state::Courier;

/// One event addressed to one recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: String,
    pub origin_uid: Uid,
    pub recipient_uid: Uid,
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn new(kind: EventKind, origin_uid: &str, recipient_uid: &str, payload: Value) -> Self {
        Self {
            event: kind.as_str().to_string(),
            origin_uid: origin_uid.to_string(),
            recipient_uid: recipient_uid.to_string(),
            payload: Some(payload),
        }
    }

    fn to_new_event(&self) -> CoreResult<NewEvent> {
        let payload = match &self.payload {
            Some(value) => serde_json::to_vec(value)
                .map_err(|err| CoreError::Storage(format!("encoding `{}`: {err}", self.event)))?,
            None => Vec::new(),
        };
        Ok(NewEvent {
            event_name: self.event.clone(),
            timestamp: now_millis(),
            origin_uid: self.origin_uid.clone(),
            recipient_uid: self.recipient_uid.clone(),
            payload,
        })
    }
}

/// How a per-kind delivery reaches its recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Look the recipient up in the presence registry; store if offline.
    Presence,
    /// A known connection; store on anything but a client rejection.
    Live(ConnectionId),
    /// Replaying an event already in the outbox. Nothing new is stored;
    /// an unanswered attempt leaves the existing record in place.
    Replay {
        connection: ConnectionId,
        event_id: EventId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The client acknowledged, with its response payload if any.
    Delivered(Option<Value>),
    /// Persisted to the recipient's outbox under this id.
    Stored(EventId),
    /// A replay went unanswered; the stored event is kept.
    Retained,
    /// The event no longer describes anything that exists.
    Skipped,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered(_))
    }
}

/// Errors that mean the client never processed the event, so it must be kept.
fn should_store(err: &CoreError) -> bool {
    !matches!(
        err,
        CoreError::ClientRejected { .. } | CoreError::Validation(_)
    )
}

impl Courier {
    pub fn emit(&self, connection: &str, event: &str, payload: Option<Value>) -> CoreResult<()> {
        if connection.is_empty() {
            return Err(CoreError::missing("connection"));
        }
        self.transport().emit(connection, event, payload)
    }

    pub async fn emit_with_ack(
        &self,
        connection: &str,
        event: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> CoreResult<Option<Value>> {
        if connection.is_empty() {
            return Err(CoreError::missing("connection"));
        }
        self.transport()
            .emit_with_ack(connection, event, payload, timeout)
            .await
    }

    /// Persists `envelope` in its recipient's outbox.
    pub async fn store_event(&self, envelope: &Envelope) -> CoreResult<EventId> {
        if envelope.recipient_uid.is_empty() {
            return Err(CoreError::missing("recipientUID"));
        }
        if envelope.event.is_empty() {
            return Err(CoreError::missing("event"));
        }
        let stored = self.store().create_event(envelope.to_new_event()?).await?;
        counter!("courier_events_stored_total", "event" => envelope.event.clone()).increment(1);
        debug!(
            event_id = stored.event_id,
            event = %envelope.event,
            recipient = %envelope.recipient_uid,
            "event stored for later delivery"
        );
        Ok(stored.event_id)
    }

    async fn store_after(&self, envelope: &Envelope, err: CoreError) -> CoreResult<DeliveryOutcome> {
        if !should_store(&err) {
            return Err(err);
        }
        warn!(
            event = %envelope.event,
            recipient = %envelope.recipient_uid,
            reason = err.kind(),
            error = %err,
            "live delivery failed; storing event"
        );
        let event_id = self.store_event(envelope).await?;
        Ok(DeliveryOutcome::Stored(event_id))
    }

    pub async fn emit_or_store(
        &self,
        connection: &str,
        envelope: &Envelope,
    ) -> CoreResult<DeliveryOutcome> {
        match self.emit(connection, &envelope.event, envelope.payload.clone()) {
            Ok(()) => Ok(DeliveryOutcome::Delivered(None)),
            Err(err) => self.store_after(envelope, err).await,
        }
    }

    pub async fn emit_with_ack_or_store(
        &self,
        connection: &str,
        envelope: &Envelope,
        timeout: Duration,
    ) -> CoreResult<DeliveryOutcome> {
        let result = self
            .emit_with_ack(connection, &envelope.event, envelope.payload.clone(), timeout)
            .await;
        match result {
            Ok(response) => Ok(DeliveryOutcome::Delivered(response)),
            Err(err) => self.store_after(envelope, err).await,
        }
    }

    /// Emits only if `recipient_uid` is online. Returns whether an emit was attempted.
    pub fn check_online_emit(
        &self,
        recipient_uid: &str,
        event: &str,
        payload: Option<Value>,
    ) -> CoreResult<bool> {
        match self.presence().connection_of(recipient_uid) {
            Some(connection) => {
                self.emit(&connection, event, payload)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn check_online_emit_with_ack_or_store(
        &self,
        envelope: &Envelope,
        timeout: Duration,
    ) -> CoreResult<DeliveryOutcome> {
        match self.presence().connection_of(&envelope.recipient_uid) {
            Some(connection) => {
                self.emit_with_ack_or_store(&connection, envelope, timeout)
                    .await
            }
            None => {
                let event_id = self.store_event(envelope).await?;
                Ok(DeliveryOutcome::Stored(event_id))
            }
        }
    }

    /// Best-effort presence-gated delivery for follow-up notifications.
    /// Failures are logged, never returned.
    pub async fn notify(&self, envelope: Envelope) {
        let timeout = self.settings().ack_timeout;
        match self
            .check_online_emit_with_ack_or_store(&envelope, timeout)
            .await
        {
            Ok(outcome) => debug!(
                event = %envelope.event,
                recipient = %envelope.recipient_uid,
                ?outcome,
                "notification handled"
            ),
            Err(err) => warn!(
                event = %envelope.event,
                recipient = %envelope.recipient_uid,
                error = %err,
                "notification failed"
            ),
        }
    }

    /// Sends `envelope` along `route` with an acknowledgement round trip.
    pub async fn deliver(
        &self,
        route: &Route,
        envelope: &Envelope,
        timeout: Duration,
    ) -> CoreResult<DeliveryOutcome> {
        match route {
            Route::Presence => {
                self.check_online_emit_with_ack_or_store(envelope, timeout)
                    .await
            }
            Route::Live(connection) => {
                self.emit_with_ack_or_store(connection, envelope, timeout)
                    .await
            }
            Route::Replay {
                connection,
                event_id,
            } => {
                let result = self
                    .emit_with_ack(connection, &envelope.event, envelope.payload.clone(), timeout)
                    .await;
                match result {
                    Ok(response) => Ok(DeliveryOutcome::Delivered(response)),
                    Err(err) if should_store(&err) => {
                        debug!(event_id, error = %err, "replay unanswered; keeping stored event");
                        Ok(DeliveryOutcome::Retained)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }
}
