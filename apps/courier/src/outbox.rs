//! Draining a user's outbox when they reconnect.

use std::collections::HashMap;

use futures::future::join_all;
use metrics::counter;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryOutcome, Envelope, Route};
use crate::error::{CoreError, CoreResult};
use crate::model::{EventId, EventKind, StoredEvent};
use crate::state::Courier;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches: usize,
    /// Events the client confirmed (or that were obsolete) and were deleted.
    pub delivered: usize,
    /// Events the client processed and declined; deleted after compensation.
    pub rejected: usize,
    /// Events left in the outbox for the next reconnect.
    pub retained: usize,
    /// The connection went away before every batch was attempted.
    pub aborted: bool,
}

/// Reads a batch acknowledgement of the form `{"<eventID>": bool, ...}`.
fn parse_ack_map(response: Option<Value>) -> HashMap<EventId, bool> {
    let Some(Value::Object(entries)) = response else {
        return HashMap::new();
    };
    entries
        .into_iter()
        .filter_map(|(id, ok)| Some((id.parse().ok()?, ok.as_bool()?)))
        .collect()
}

fn batch_payload(batch: &[StoredEvent]) -> Value {
    let entries: Map<String, Value> = batch
        .iter()
        .map(|event| (event.event_id.to_string(), event.to_wire()))
        .collect();
    Value::Object(entries)
}

fn request_id_of(event: &StoredEvent) -> CoreResult<String> {
    event
        .payload_json()?
        .get("requestID")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CoreError::missing("requestID"))
}

fn channel_id_of(event: &StoredEvent) -> CoreResult<String> {
    event
        .payload_json()?
        .get("channelID")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CoreError::missing("channelID"))
}

impl Courier {
    /// Delivers everything stored for `uid` over `connection`, oldest first,
    /// then emits a terminal `receivedPendingEvents` with no payload.
    ///
    /// Only missing parameters and a failure to read the outbox are returned
    /// as errors; delivery problems leave events stored and end up in the report.
    pub async fn flush_outbox(&self, uid: &str, connection: &str) -> CoreResult<FlushReport> {
        if uid.is_empty() {
            return Err(CoreError::missing("uid"));
        }
        if connection.is_empty() {
            return Err(CoreError::missing("connection"));
        }

        let mut report = FlushReport::default();
        let drained = self.drain_outbox(uid, connection, &mut report).await;

        if let Err(err) = self.emit(connection, EventKind::ReceivedPendingEvents.as_str(), None) {
            debug!(uid = %uid, connection_id = %connection, error = %err, "could not signal end of flush");
        }
        info!(
            uid = %uid,
            batches = report.batches,
            delivered = report.delivered,
            rejected = report.rejected,
            retained = report.retained,
            aborted = report.aborted,
            "outbox flush finished"
        );
        drained.map(|()| report)
    }

    async fn drain_outbox(
        &self,
        uid: &str,
        connection: &str,
        report: &mut FlushReport,
    ) -> CoreResult<()> {
        let events = self.store().pending_events(uid).await?;
        let batch_size = self.settings().flush_batch_size.max(1);
        let mut batches = events.chunks(batch_size);

        while let Some(batch) = batches.next() {
            if !self.transport().is_live(connection) {
                warn!(uid = %uid, connection_id = %connection, "connection lost mid-flush; remaining events stay stored");
                report.aborted = true;
                report.retained += batch.len() + batches.map(<[StoredEvent]>::len).sum::<usize>();
                return Ok(());
            }
            report.batches += 1;

            let result = self
                .emit_with_ack(
                    connection,
                    EventKind::ReceivedPendingEvents.as_str(),
                    Some(batch_payload(batch)),
                    self.settings().flush_ack_timeout,
                )
                .await;

            match result {
                Ok(response) => {
                    counter!("courier_flush_batches_total", "outcome" => "acknowledged").increment(1);
                    self.settle_batch(batch, parse_ack_map(response), report)
                        .await;
                }
                Err(err) if err.is_client_rejected() => {
                    counter!("courier_flush_batches_total", "outcome" => "fallback").increment(1);
                    warn!(uid = %uid, error = %err, "batch rejected; replaying events individually");
                    if !self.replay_individually(connection, batch, report).await {
                        report.aborted = true;
                        report.retained += batches.map(<[StoredEvent]>::len).sum::<usize>();
                        return Ok(());
                    }
                }
                Err(err) => {
                    counter!("courier_flush_batches_total", "outcome" => "failed").increment(1);
                    warn!(uid = %uid, error = %err, "batch delivery failed; stopping flush");
                    report.aborted = true;
                    report.retained += batch.len() + batches.map(<[StoredEvent]>::len).sum::<usize>();
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Applies a client's per-event verdicts to one batch.
    async fn settle_batch(
        &self,
        batch: &[StoredEvent],
        verdicts: HashMap<EventId, bool>,
        report: &mut FlushReport,
    ) {
        let mut finished = Vec::new();
        for event in batch {
            match verdicts.get(&event.event_id) {
                Some(true) => {
                    report.delivered += 1;
                    finished.push(event.event_id);
                }
                Some(false) => {
                    self.handle_rejected_event(event).await;
                    report.rejected += 1;
                    finished.push(event.event_id);
                }
                None => report.retained += 1,
            }
        }
        self.delete_events(&finished).await;
    }

    /// Replays each event through its canonical per-kind delivery.
    /// Returns `false` if the connection went away part way through.
    async fn replay_individually(
        &self,
        connection: &str,
        batch: &[StoredEvent],
        report: &mut FlushReport,
    ) -> bool {
        for (index, event) in batch.iter().enumerate() {
            if !self.transport().is_live(connection) {
                report.retained += batch.len() - index;
                return false;
            }
            match self.replay_event(connection, event).await {
                Ok(DeliveryOutcome::Delivered(_) | DeliveryOutcome::Skipped) => {
                    report.delivered += 1;
                    self.delete_events(&[event.event_id]).await;
                }
                Ok(DeliveryOutcome::Retained | DeliveryOutcome::Stored(_)) => {
                    report.retained += 1;
                }
                Err(err @ (CoreError::ClientRejected { .. } | CoreError::Validation(_))) => {
                    // receivedCR compensates inside its own delivery path.
                    if event.kind() != Some(EventKind::ReceivedCr) {
                        self.handle_rejected_event(event).await;
                    }
                    warn!(event_id = event.event_id, event = %event.event_name, error = %err, "stored event declined on replay");
                    report.rejected += 1;
                    self.delete_events(&[event.event_id]).await;
                }
                Err(err) if err.is_empty_result() => {
                    // A record the event depends on is gone; it can never apply.
                    debug!(event_id = event.event_id, event = %event.event_name, error = %err, "stored event is obsolete");
                    report.delivered += 1;
                    self.delete_events(&[event.event_id]).await;
                }
                Err(err) => {
                    warn!(event_id = event.event_id, event = %event.event_name, error = %err, "replay failed; keeping stored event");
                    report.retained += 1;
                }
            }
        }
        true
    }

    /// Delivers a stored event exactly as it would be delivered live.
    pub async fn replay_event(
        &self,
        connection: &str,
        event: &StoredEvent,
    ) -> CoreResult<DeliveryOutcome> {
        let route = Route::Replay {
            connection: connection.to_string(),
            event_id: event.event_id,
        };
        match event.kind() {
            Some(EventKind::ReceivedCr) => {
                let request_id = request_id_of(event)?;
                self.received_cr(&route, &event.recipient_uid, &request_id)
                    .await
            }
            Some(EventKind::ReceivedRuChannel) => {
                let channel_id = channel_id_of(event)?;
                self.received_ru_channel(&route, &event.recipient_uid, &channel_id)
                    .await
            }
            _ => {
                let payload = match event.payload_json() {
                    Ok(Value::Null) => None,
                    Ok(payload) => Some(payload),
                    Err(_) => event.to_wire().get("payload").cloned(),
                };
                let envelope = Envelope {
                    event: event.event_name.clone(),
                    origin_uid: event.origin_uid.clone(),
                    recipient_uid: event.recipient_uid.clone(),
                    payload,
                };
                self.deliver(&route, &envelope, self.settings().ack_timeout)
                    .await
            }
        }
    }

    /// Server-side compensation for an event the client explicitly declined.
    async fn handle_rejected_event(&self, event: &StoredEvent) {
        if event.kind() == Some(EventKind::ReceivedCr) {
            let request_id = request_id_of(event).ok();
            self.received_cr_failure(request_id.as_deref()).await;
        }
    }

    async fn delete_events(&self, event_ids: &[EventId]) {
        let deletions = event_ids.iter().map(|id| async move {
            (*id, self.store().delete_event(*id).await)
        });
        for (event_id, result) in join_all(deletions).await {
            if let Err(err) = result {
                warn!(event_id, error = %err, "failed to delete delivered event");
            }
        }
    }
}
