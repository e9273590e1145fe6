//! Client-invoked operations and connection lifecycle callbacks.

use std::collections::BTreeMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use futures::future::BoxFuture;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::delivery::{Envelope, Route};
use crate::error::{require, require_text, CoreError, CoreResult};
use crate::model::{generate_id, now_millis, ConnectionId, EventKind, Uid, User};
use crate::protocol::{
    decode, ChannelDeletionPayload, ContactRequestPayload, CreateUserPayload,
    KnownChannelsPayload, KnownRequestsPayload, MessagePayload, MessageReceiptPayload,
    ResolveContactRequestPayload, UidPayload, UsernamePayload,
};
use crate::state::Courier;
use crate::store::{Predicate, StoreError, Table};
use crate::websocket::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CheckUsernameAvailable,
    CreateUser,
    ConnectUser,
    DeleteUser,
    FetchRelatedUser,
    FetchRelatedUsers,
    CheckRelatedUsersOnline,
    CheckContactRequests,
    CheckChannels,
    SendContactRequest,
    ResolveContactRequest,
    CreateChannelDeletion,
    ResetChannels,
    SendMessage,
    DeliveredMessage,
    DeleteMessage,
}

impl Operation {
    const ALL: [Operation; 16] = [
        Operation::CheckUsernameAvailable,
        Operation::CreateUser,
        Operation::ConnectUser,
        Operation::DeleteUser,
        Operation::FetchRelatedUser,
        Operation::FetchRelatedUsers,
        Operation::CheckRelatedUsersOnline,
        Operation::CheckContactRequests,
        Operation::CheckChannels,
        Operation::SendContactRequest,
        Operation::ResolveContactRequest,
        Operation::CreateChannelDeletion,
        Operation::ResetChannels,
        Operation::SendMessage,
        Operation::DeliveredMessage,
        Operation::DeleteMessage,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::CheckUsernameAvailable => "checkUsernameAvailable",
            Operation::CreateUser => "createUser",
            Operation::ConnectUser => "connectUser",
            Operation::DeleteUser => "deleteUser",
            Operation::FetchRelatedUser => "fetchRelatedUser",
            Operation::FetchRelatedUsers => "fetchRelatedUsers",
            Operation::CheckRelatedUsersOnline => "checkRelatedUsersOnline",
            Operation::CheckContactRequests => "checkContactRequests",
            Operation::CheckChannels => "checkChannels",
            Operation::SendContactRequest => "sendContactRequest",
            Operation::ResolveContactRequest => "resolveContactRequest",
            Operation::CreateChannelDeletion => "createChannelDeletion",
            Operation::ResetChannels => "resetChannels",
            Operation::SendMessage => "sendMessage",
            Operation::DeliveredMessage => "deliveredMessage",
            Operation::DeleteMessage => "deleteMessage",
        }
    }
}

impl FromStr for Operation {
    type Err = CoreError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|operation| operation.as_str() == name)
            .ok_or_else(|| CoreError::Validation(format!("unknown operation `{name}`")))
    }
}

/// The connection an operation arrived on, and the user bound to it by `connectUser`.
#[derive(Debug, Clone)]
pub struct Caller {
    pub connection_id: ConnectionId,
    uid: Arc<RwLock<Option<Uid>>>,
}

impl Caller {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            uid: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn uid(&self) -> Option<Uid> {
        self.uid.read().await.clone()
    }

    pub async fn require_uid(&self) -> CoreResult<Uid> {
        self.uid()
            .await
            .ok_or_else(|| CoreError::Validation("connection is not bound to a user; call connectUser first".into()))
    }

    async fn bind(&self, uid: &str) -> Option<Uid> {
        self.uid.write().await.replace(uid.to_string())
    }

    async fn unbind(&self) {
        self.uid.write().await.take();
    }
}

/// Answer to a client request plus work to run once the answer is sent.
pub struct Reply {
    pub result: CoreResult<Value>,
    pub follow_up: Option<BoxFuture<'static, ()>>,
}

impl Reply {
    pub fn value(value: Value) -> Self {
        Self {
            result: Ok(value),
            follow_up: None,
        }
    }

    pub fn error(err: CoreError) -> Self {
        Self {
            result: Err(err),
            follow_up: None,
        }
    }

    pub fn then<F>(mut self, follow_up: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.follow_up = Some(Box::pin(follow_up));
        self
    }
}

fn payload_of<T: DeserializeOwned + Default>(payload: Value) -> CoreResult<T> {
    decode(payload).map_err(CoreError::Validation)
}

impl Courier {
    /// Runs the operation named `event` for `caller`.
    pub async fn dispatch(&self, caller: &Caller, event: &str, payload: Value) -> Reply {
        let operation = match event.parse::<Operation>() {
            Ok(operation) => operation,
            Err(err) => return Reply::error(err),
        };
        let reply = self
            .run(operation, caller, payload)
            .await
            .unwrap_or_else(Reply::error);
        if let Err(err) = &reply.result {
            counter!(
                "courier_operation_errors_total",
                "operation" => operation.as_str(),
                "kind" => err.kind()
            )
            .increment(1);
            debug!(
                connection_id = %caller.connection_id,
                operation = operation.as_str(),
                error = %err,
                "operation failed"
            );
        }
        reply
    }

    async fn run(&self, operation: Operation, caller: &Caller, payload: Value) -> CoreResult<Reply> {
        match operation {
            Operation::CheckUsernameAvailable => {
                let payload: UsernamePayload = payload_of(payload)?;
                let username = require_text(payload.username, "username")?;
                let taken = self.store().username_taken(&username).await?;
                Ok(Reply::value(Value::Bool(!taken)))
            }
            Operation::CreateUser => self.create_user(payload_of(payload)?).await,
            Operation::ConnectUser => self.connect_user(caller, payload_of(payload)?).await,
            Operation::DeleteUser => self.delete_user(caller).await,
            Operation::FetchRelatedUser => {
                let uid = caller.require_uid().await?;
                let payload: UidPayload = payload_of(payload)?;
                let other = require_text(payload.uid, "uid")?;
                if !self.is_related(&uid, &other).await? {
                    return Err(CoreError::Validation(format!(
                        "user `{other}` is not related to the caller"
                    )));
                }
                let user = self.store().fetch_user(&other).await?;
                Ok(Reply::value(json!(user.profile())))
            }
            Operation::FetchRelatedUsers => {
                let uid = caller.require_uid().await?;
                let mut profiles = Vec::new();
                for other in self.channel_counterparts(&uid).await? {
                    match self.store().fetch_user(&other).await {
                        Ok(user) => profiles.push(user.profile()),
                        Err(StoreError::EmptyResult { .. }) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(Reply::value(json!(profiles)))
            }
            Operation::CheckRelatedUsersOnline => {
                let uid = caller.require_uid().await?;
                let online: BTreeMap<Uid, bool> = self
                    .channel_counterparts(&uid)
                    .await?
                    .into_iter()
                    .map(|other| {
                        let live = self.presence().is_online(&other);
                        (other, live)
                    })
                    .collect();
                Ok(Reply::value(json!(online)))
            }
            Operation::CheckContactRequests => {
                let uid = caller.require_uid().await?;
                let payload: KnownRequestsPayload = payload_of(payload)?;
                let known = require(payload.request_ids, "requestIDs")?;
                let divergence = self.check_contact_requests(&uid, known).await?;
                let reply = Reply::value(divergence.ack_map());
                if divergence.server_only.is_empty() {
                    return Ok(reply);
                }
                let courier = self.clone();
                let connection = caller.connection_id.clone();
                Ok(reply.then(async move {
                    courier
                        .send_missing_contact_requests(&uid, &connection, &divergence.server_only)
                        .await;
                }))
            }
            Operation::CheckChannels => {
                let uid = caller.require_uid().await?;
                let payload: KnownChannelsPayload = payload_of(payload)?;
                let known = require(payload.channel_ids, "channelIDs")?;
                let divergence = self.check_channels(&uid, known).await?;
                let reply = Reply::value(divergence.ack_map());
                if divergence.server_only.is_empty() {
                    return Ok(reply);
                }
                let courier = self.clone();
                let connection = caller.connection_id.clone();
                Ok(reply.then(async move {
                    courier
                        .send_missing_ru_channels(&uid, &connection, &divergence.server_only)
                        .await;
                }))
            }
            Operation::SendContactRequest => {
                let uid = caller.require_uid().await?;
                let payload: ContactRequestPayload = payload_of(payload)?;
                let request = self.send_cr(&uid, payload).await?;
                let courier = self.clone();
                let reply = Reply::value(request.to_json());
                Ok(reply.then(async move {
                    // Failures roll the request back inside received_cr.
                    if let Err(err) = courier
                        .received_cr(&Route::Presence, &request.recipient_uid, &request.request_id)
                        .await
                    {
                        debug!(request_id = %request.request_id, error = %err, "contact request not delivered");
                    }
                }))
            }
            Operation::ResolveContactRequest => {
                let uid = caller.require_uid().await?;
                let payload: ResolveContactRequestPayload = payload_of(payload)?;
                let resolution = self.send_cr_result(&uid, payload).await?;
                let courier = self.clone();
                let reply = Reply::value(resolution.to_json());
                Ok(reply.then(async move {
                    courier.received_cr_result(&resolution).await;
                }))
            }
            Operation::CreateChannelDeletion => {
                let uid = caller.require_uid().await?;
                let payload: ChannelDeletionPayload = payload_of(payload)?;
                let (channel, date) = self.create_channel_deletion(&uid, payload).await?;
                let courier = self.clone();
                let reply = Reply::value(json!({ "channelID": channel.channel_id }));
                Ok(reply.then(async move {
                    courier.received_cd(&channel, &uid, date).await;
                }))
            }
            Operation::ResetChannels => {
                let uid = caller.require_uid().await?;
                let channels = self.reset_channels(&uid).await?;
                let ids: Vec<&str> = channels.iter().map(|c| c.channel_id.as_str()).collect();
                let reply = Reply::value(json!({ "channelIDs": ids }));
                let courier = self.clone();
                Ok(reply.then(async move {
                    let date = now_millis();
                    for channel in &channels {
                        courier.received_cd(channel, &uid, date).await;
                    }
                }))
            }
            Operation::SendMessage => {
                let uid = caller.require_uid().await?;
                let payload: MessagePayload = payload_of(payload)?;
                let envelope = self.send_message(&uid, payload).await?;
                Ok(self.forward(envelope))
            }
            Operation::DeliveredMessage => {
                let uid = caller.require_uid().await?;
                let payload: MessageReceiptPayload = payload_of(payload)?;
                let envelope = self.delivered_message(&uid, payload).await?;
                Ok(self.forward(envelope))
            }
            Operation::DeleteMessage => {
                let uid = caller.require_uid().await?;
                let payload: MessageReceiptPayload = payload_of(payload)?;
                let envelope = self.delete_message(&uid, payload).await?;
                Ok(self.forward(envelope))
            }
        }
    }

    fn forward(&self, envelope: Envelope) -> Reply {
        let courier = self.clone();
        Reply::value(Value::Bool(true)).then(async move {
            courier.notify(envelope).await;
        })
    }

    async fn create_user(&self, payload: CreateUserPayload) -> CoreResult<Reply> {
        let username = require_text(payload.username, "username")?;
        if self.store().username_taken(&username).await? {
            return Err(CoreError::Validation(format!(
                "username `{username}` is taken"
            )));
        }
        let user = User {
            uid: generate_id(),
            username,
            public_key: payload.public_key,
            creation_date: now_millis(),
        };
        self.store().create_user(&user).await?;
        info!(uid = %user.uid, "user created");
        Ok(Reply::value(json!(user.profile())))
    }

    async fn connect_user(&self, caller: &Caller, payload: UidPayload) -> CoreResult<Reply> {
        let uid = require_text(payload.uid, "uid")?;
        let user = self.store().fetch_user(&uid).await?;

        if let Some(previous) = caller.bind(&uid).await {
            if previous != uid {
                self.presence().release(&previous, &caller.connection_id);
            }
        }
        if let Some(replaced) = self.presence().set_online(&uid, &caller.connection_id) {
            info!(uid = %uid, replaced = %replaced, "newer connection replaced existing session");
        }
        counter!("courier_users_connected_total").increment(1);
        info!(uid = %uid, connection_id = %caller.connection_id, "user connected");

        let courier = self.clone();
        let connection = caller.connection_id.clone();
        Ok(Reply::value(json!(user.profile())).then(async move {
            courier.broadcast_presence(&uid, EventKind::UserConnect).await;
            if let Err(err) = courier.flush_outbox(&uid, &connection).await {
                warn!(uid = %uid, error = %err, "outbox flush failed");
            }
        }))
    }

    async fn delete_user(&self, caller: &Caller) -> CoreResult<Reply> {
        let uid = caller.require_uid().await?;
        self.store()
            .delete_records(Table::Users, &Predicate::eq("uid", uid.as_str()))
            .await?;
        let dropped = self
            .store()
            .delete_records(Table::Events, &Predicate::eq("recipient_uid", uid.as_str()))
            .await?;
        self.presence().release(&uid, &caller.connection_id);
        caller.unbind().await;
        info!(uid = %uid, dropped_events = dropped, "user deleted");

        let courier = self.clone();
        Ok(Reply::value(Value::Bool(true)).then(async move {
            courier.broadcast_presence(&uid, EventKind::UserDisconnect).await;
        }))
    }

    /// Transport callback for a closed connection.
    pub async fn on_disconnect(&self, caller: &Caller) {
        let Some(uid) = caller.uid().await else {
            return;
        };
        if self.presence().release(&uid, &caller.connection_id) {
            counter!("courier_users_disconnected_total").increment(1);
            info!(uid = %uid, connection_id = %caller.connection_id, "user disconnected");
            self.broadcast_presence(&uid, EventKind::UserDisconnect)
                .await;
        } else {
            debug!(uid = %uid, connection_id = %caller.connection_id, "stale connection closed");
        }
    }

    /// Tells every online channel counterpart of `uid` about a presence change.
    async fn broadcast_presence(&self, uid: &str, kind: EventKind) {
        let counterparts = match self.channel_counterparts(uid).await {
            Ok(counterparts) => counterparts,
            Err(err) => {
                warn!(uid = %uid, error = %err, "could not load related users");
                return;
            }
        };
        for other in counterparts {
            if let Err(err) = self.check_online_emit(&other, kind.as_str(), Some(json!({ "UID": uid }))) {
                warn!(uid = %uid, to = %other, event = kind.as_str(), error = %err, "presence broadcast failed");
            }
        }
    }
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "online_users": state.courier.presence().online_count(),
        "connections": state.hub.connection_count(),
    }))
}

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::test_support::{fixture, Fixture, Script};

    async fn connect(fx: &Fixture, uid: &str, connection: &str) -> Caller {
        let caller = Caller::new(connection.to_string());
        let reply = fx
            .courier
            .dispatch(&caller, "connectUser", json!({ "uid": uid }))
            .await;
        assert!(reply.result.is_ok(), "connectUser failed: {:?}", reply.result);
        if let Some(follow_up) = reply.follow_up {
            follow_up.await;
        }
        caller
    }

    async fn call(fx: &Fixture, caller: &Caller, event: &str, payload: Value) -> CoreResult<Value> {
        let reply = fx.courier.dispatch(caller, event, payload).await;
        if let Some(follow_up) = reply.follow_up {
            follow_up.await;
        }
        reply.result
    }

    #[test_timeout::timeout]
    fn operation_names_parse() {
        for operation in Operation::ALL {
            assert_eq!(operation.as_str().parse::<Operation>().unwrap(), operation);
        }
        assert!("sendCD".parse::<Operation>().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn bound_user_is_required_for_user_operations() {
        let fx = fixture();
        let caller = Caller::new("conn-1".into());
        let err = call(&fx, &caller, "resetChannels", Value::Null).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        let err = call(&fx, &caller, "sendCD", Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("unknown operation"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn usernames_are_unique() {
        let fx = fixture();
        let caller = Caller::new("conn-1".into());
        let created = call(&fx, &caller, "createUser", json!({"username": "ada", "publicKey": "pk"}))
            .await
            .unwrap();
        assert_eq!(created["username"], "ada");
        assert_eq!(created["publicKey"], "pk");
        assert!(!created["UID"].as_str().unwrap().is_empty());

        assert_eq!(
            call(&fx, &caller, "checkUsernameAvailable", json!({"username": "ada"})).await.unwrap(),
            json!(false)
        );
        assert!(call(&fx, &caller, "createUser", json!({"username": "ada"})).await.is_err());
        assert!(call(&fx, &caller, "checkUsernameAvailable", json!({})).await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn connect_broadcasts_presence_and_flushes_outbox() {
        let fx = fixture();
        fx.user("alice").await;
        fx.user("bob").await;
        fx.channel("c1", "alice", "bob").await;
        connect(&fx, "alice", "conn-alice").await;

        connect(&fx, "bob", "conn-bob").await;
        let alice_saw = fx.transport.payloads_of("userConnect");
        assert_eq!(alice_saw, vec![Some(json!({"UID": "bob"}))]);
        assert_eq!(fx.transport.events_to("conn-alice").last().unwrap(), "userConnect");
        assert_eq!(fx.transport.events_to("conn-bob"), vec!["receivedPendingEvents"]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stale_disconnect_keeps_the_newer_session() {
        let fx = fixture();
        fx.user("alice").await;
        fx.user("bob").await;
        fx.channel("c1", "alice", "bob").await;
        let bob = connect(&fx, "bob", "conn-bob").await;
        let old = connect(&fx, "alice", "conn-old").await;
        let new = connect(&fx, "alice", "conn-new").await;

        fx.courier.on_disconnect(&old).await;
        assert_eq!(
            fx.courier.presence().connection_of("alice").as_deref(),
            Some("conn-new")
        );
        assert!(fx.transport.payloads_of("userDisconnect").is_empty());

        fx.courier.on_disconnect(&new).await;
        assert!(!fx.courier.presence().is_online("alice"));
        assert_eq!(fx.transport.events_to("conn-bob").last().unwrap(), "userDisconnect");
        let online = call(&fx, &bob, "checkRelatedUsersOnline", Value::Null).await.unwrap();
        assert_eq!(online, json!({"alice": false}));
    }

    #[test_timeout::tokio_timeout_test]
    async fn contact_request_round_trip_creates_a_channel() {
        let fx = fixture();
        fx.user("alice").await;
        fx.user("bob").await;
        let alice = connect(&fx, "alice", "conn-alice").await;
        let bob = connect(&fx, "bob", "conn-bob").await;

        let pending = call(
            &fx,
            &alice,
            "sendContactRequest",
            json!({"recipientUID": "bob", "requestID": "cr-1", "date": 3, "isOrigin": true}),
        )
        .await
        .unwrap();
        assert_eq!(pending["requestID"], "cr-1");
        assert!(fx.transport.events_to("conn-bob").contains(&"receivedCR".to_string()));

        let resolved = call(
            &fx,
            &bob,
            "resolveContactRequest",
            json!({"requestID": "cr-1", "accepted": true, "channelID": "chan-1"}),
        )
        .await
        .unwrap();
        assert_eq!(resolved["channel"]["user"]["UID"], "alice");
        assert_eq!(fx.transport.events_to("conn-alice").last().unwrap(), "receivedCRResult");

        let related = call(&fx, &alice, "fetchRelatedUsers", Value::Null).await.unwrap();
        assert_eq!(related[0]["UID"], "bob");
        let profile = call(&fx, &alice, "fetchRelatedUser", json!({"uid": "bob"})).await.unwrap();
        assert_eq!(profile["username"], "bob-name");
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_push_still_acknowledges_the_sender_and_rolls_back() {
        let fx = fixture();
        fx.user("alice").await;
        fx.user("bob").await;
        let alice = connect(&fx, "alice", "conn-alice").await;
        connect(&fx, "bob", "conn-bob").await;
        fx.transport
            .on("receivedCR", Script::Reject("cannot decrypt".into()));

        let pending = call(
            &fx,
            &alice,
            "sendContactRequest",
            json!({"recipientUID": "bob", "requestID": "cr-1", "date": 3, "isOrigin": true}),
        )
        .await
        .unwrap();
        assert_eq!(pending["requestID"], "cr-1");
        assert!(fx.transport.events_to("conn-bob").contains(&"receivedCR".to_string()));
        assert_eq!(fx.store.count(Table::ContactRequests).await, 0);
        assert_eq!(fx.store.count(Table::Events).await, 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unrelated_users_cannot_be_fetched() {
        let fx = fixture();
        fx.user("alice").await;
        fx.user("eve").await;
        let alice = connect(&fx, "alice", "conn-alice").await;
        let err = call(&fx, &alice, "fetchRelatedUser", json!({"uid": "eve"})).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn reconciliation_answers_then_pushes() {
        let fx = fixture();
        fx.user("alice").await;
        fx.user("bob").await;
        fx.channel("c1", "alice", "bob").await;
        let alice = connect(&fx, "alice", "conn-alice").await;

        let ack = call(&fx, &alice, "checkChannels", json!({"channelIDs": ["c9"]})).await.unwrap();
        assert_eq!(ack, json!({"c9": false}));
        assert_eq!(fx.transport.events_to("conn-alice").last().unwrap(), "receivedRUChannel");

        let missing = call(&fx, &alice, "checkContactRequests", json!({})).await;
        assert!(missing.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn deleting_a_user_drops_their_outbox_and_presence() {
        let fx = fixture();
        fx.user("alice").await;
        fx.user("bob").await;
        fx.channel("c1", "alice", "bob").await;
        let bob = connect(&fx, "bob", "conn-bob").await;
        fx.courier.presence().set_offline("bob");
        fx.courier
            .notify(Envelope::new(
                EventKind::ReceivedMessage,
                "alice",
                "bob",
                json!({"channelID": "c1"}),
            ))
            .await;
        fx.courier.presence().set_online("bob", "conn-bob");
        assert_eq!(fx.store.count(Table::Events).await, 1);

        call(&fx, &bob, "deleteUser", Value::Null).await.unwrap();
        assert_eq!(fx.store.count(Table::Events).await, 0);
        assert!(fx.store.fetch_user("bob").await.is_err());
        assert!(!fx.courier.presence().is_online("bob"));
        assert!(bob.uid().await.is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn channel_deletion_and_messages_flow_to_the_counterpart() {
        let fx = fixture();
        fx.user("alice").await;
        fx.user("bob").await;
        fx.channel("c1", "alice", "bob").await;
        let alice = connect(&fx, "alice", "conn-alice").await;
        connect(&fx, "bob", "conn-bob").await;

        call(
            &fx,
            &alice,
            "sendMessage",
            json!({"channelID": "c1", "messageID": "m1", "date": 1, "body": "hi"}),
        )
        .await
        .unwrap();
        assert_eq!(fx.transport.payloads_of("receivedMessage")[0].as_ref().unwrap()["body"], "hi");

        let deleted = call(&fx, &alice, "resetChannels", Value::Null).await.unwrap();
        assert_eq!(deleted, json!({"channelIDs": ["c1"]}));
        assert_eq!(fx.transport.events_to("conn-bob").last().unwrap(), "receivedCD");
    }
}
