//! Repairing divergence between what a client holds and what the server holds.
//!
//! Contact requests and channels use the same two-step protocol. The client's
//! known ids are diffed against the server's: ids only the client has are
//! answered `false` in the acknowledgement, and ids only the server has are
//! pushed afterwards through the same delivery used for live creation.

use std::collections::BTreeSet;

use metrics::counter;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryOutcome, Route};
use crate::error::CoreResult;
use crate::state::Courier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    ContactRequest,
    Channel,
}

impl EntityKind {
    fn label(self) -> &'static str {
        match self {
            EntityKind::ContactRequest => "contact_request",
            EntityKind::Channel => "channel",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Divergence {
    /// Known to the client, absent on the server.
    pub client_only: BTreeSet<String>,
    /// Held by the server, unknown to the client.
    pub server_only: BTreeSet<String>,
}

impl Divergence {
    pub fn between(client_ids: &BTreeSet<String>, server_ids: &BTreeSet<String>) -> Self {
        Self {
            client_only: client_ids.difference(server_ids).cloned().collect(),
            server_only: server_ids.difference(client_ids).cloned().collect(),
        }
    }

    /// `{id: false}` for every id the client should discard.
    pub fn ack_map(&self) -> Value {
        let entries: Map<String, Value> = self
            .client_only
            .iter()
            .map(|id| (id.clone(), Value::Bool(false)))
            .collect();
        Value::Object(entries)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub pushed: usize,
    pub pruned: usize,
    pub failed: usize,
}

impl Courier {
    async fn server_ids(&self, uid: &str, kind: EntityKind) -> CoreResult<BTreeSet<String>> {
        Ok(match kind {
            EntityKind::ContactRequest => self
                .store()
                .contact_requests_for(uid)
                .await?
                .into_iter()
                .map(|request| request.request_id)
                .collect(),
            EntityKind::Channel => self
                .store()
                .channels_for(uid)
                .await?
                .into_iter()
                .map(|channel| channel.channel_id)
                .collect(),
        })
    }

    pub async fn check(
        &self,
        uid: &str,
        kind: EntityKind,
        client_ids: Vec<String>,
    ) -> CoreResult<Divergence> {
        let client_ids: BTreeSet<String> = client_ids.into_iter().collect();
        let server_ids = self.server_ids(uid, kind).await?;
        let divergence = Divergence::between(&client_ids, &server_ids);
        debug!(
            uid = %uid,
            entity = kind.label(),
            client_only = divergence.client_only.len(),
            server_only = divergence.server_only.len(),
            "reconciliation diff"
        );
        Ok(divergence)
    }

    /// Pushes each server-only id to `uid`. Failures are per id and never abort the rest.
    pub async fn send_missing(
        &self,
        uid: &str,
        kind: EntityKind,
        route: &Route,
        ids: &BTreeSet<String>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for id in ids {
            let result = match kind {
                EntityKind::ContactRequest => self.received_cr(route, uid, id).await,
                EntityKind::Channel => self.received_ru_channel(route, uid, id).await,
            };
            match result {
                Ok(DeliveryOutcome::Skipped) => {}
                Ok(_) => report.pushed += 1,
                Err(err) if err.is_empty_result() => {
                    // The record referenced a user that no longer exists and was pruned.
                    counter!("courier_reconcile_pruned_total", "entity" => kind.label()).increment(1);
                    report.pruned += 1;
                }
                Err(err) => {
                    warn!(uid = %uid, entity = kind.label(), id = %id, error = %err, "failed to push missing record");
                    report.failed += 1;
                }
            }
        }
        info!(
            uid = %uid,
            entity = kind.label(),
            pushed = report.pushed,
            pruned = report.pruned,
            failed = report.failed,
            "reconciliation push finished"
        );
        report
    }

    pub async fn check_contact_requests(
        &self,
        uid: &str,
        request_ids: Vec<String>,
    ) -> CoreResult<Divergence> {
        self.check(uid, EntityKind::ContactRequest, request_ids).await
    }

    pub async fn check_channels(&self, uid: &str, channel_ids: Vec<String>) -> CoreResult<Divergence> {
        self.check(uid, EntityKind::Channel, channel_ids).await
    }

    pub async fn send_missing_contact_requests(
        &self,
        uid: &str,
        connection: &str,
        request_ids: &BTreeSet<String>,
    ) -> ReconcileReport {
        let route = Route::Live(connection.to_string());
        self.send_missing(uid, EntityKind::ContactRequest, &route, request_ids)
            .await
    }

    pub async fn send_missing_ru_channels(
        &self,
        uid: &str,
        connection: &str,
        channel_ids: &BTreeSet<String>,
    ) -> ReconcileReport {
        let route = Route::Live(connection.to_string());
        self.send_missing(uid, EntityKind::Channel, &route, channel_ids)
            .await
    }
}
