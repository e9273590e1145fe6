//! Scripted transport and store fixtures for engine tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::model::{ContactRequest, EventId, RuChannel, User};
use crate::state::{Courier, DeliverySettings};
use crate::store::{
    FetchOptions, MemoryStore, Predicate, Record, Store, StoreError, StoreResult, Table,
};
use crate::transport::Transport;

/// How the fake client answers an event that asks for an acknowledgement.
#[derive(Debug, Clone)]
pub enum Script {
    Ack(Option<Value>),
    Reject(String),
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub connection: String,
    pub event: String,
    pub payload: Option<Value>,
    pub wants_ack: bool,
}

#[derive(Default)]
struct Inner {
    defaults: HashMap<String, Script>,
    queued: HashMap<String, VecDeque<Script>>,
    dead: HashSet<String>,
    /// Connection dies after this many further ack round trips.
    dies_after: HashMap<String, usize>,
    log: Vec<Emission>,
}

/// A [`Transport`] whose client behaviour is scripted per event name.
/// Unscripted events are acknowledged with no payload.
#[derive(Default)]
pub struct ScriptedTransport {
    inner: Mutex<Inner>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Default answer for every `event` round trip.
    pub fn on(&self, event: &str, script: Script) {
        self.inner
            .lock()
            .unwrap()
            .defaults
            .insert(event.to_string(), script);
    }

    /// One-shot answer consumed before the default.
    pub fn push(&self, event: &str, script: Script) {
        self.inner
            .lock()
            .unwrap()
            .queued
            .entry(event.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn disconnect(&self, connection: &str) {
        self.inner.lock().unwrap().dead.insert(connection.to_string());
    }

    pub fn disconnect_after(&self, connection: &str, round_trips: usize) {
        self.inner
            .lock()
            .unwrap()
            .dies_after
            .insert(connection.to_string(), round_trips);
    }

    pub fn emissions(&self) -> Vec<Emission> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn events_to(&self, connection: &str) -> Vec<String> {
        self.emissions()
            .into_iter()
            .filter(|emission| emission.connection == connection)
            .map(|emission| emission.event)
            .collect()
    }

    pub fn payloads_of(&self, event: &str) -> Vec<Option<Value>> {
        self.emissions()
            .into_iter()
            .filter(|emission| emission.event == event)
            .map(|emission| emission.payload)
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn emit(&self, connection: &str, event: &str, payload: Option<Value>) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.dead.contains(connection) {
            return Err(CoreError::Presence(connection.to_string()));
        }
        inner.log.push(Emission {
            connection: connection.to_string(),
            event: event.to_string(),
            payload,
            wants_ack: false,
        });
        Ok(())
    }

    async fn emit_with_ack(
        &self,
        connection: &str,
        event: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> CoreResult<Option<Value>> {
        let script = {
            let mut inner = self.inner.lock().unwrap();
            if inner.dead.contains(connection) {
                return Err(CoreError::Presence(connection.to_string()));
            }
            inner.log.push(Emission {
                connection: connection.to_string(),
                event: event.to_string(),
                payload,
                wants_ack: true,
            });
            if let Some(remaining) = inner.dies_after.get_mut(connection) {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    inner.dies_after.remove(connection);
                    inner.dead.insert(connection.to_string());
                }
            }
            let queued = inner
                .queued
                .get_mut(event)
                .and_then(|queue| queue.pop_front());
            queued
                .or_else(|| inner.defaults.get(event).cloned())
                .unwrap_or(Script::Ack(None))
        };
        match script {
            Script::Ack(response) => Ok(response),
            Script::Reject(reason) => Err(CoreError::ClientRejected {
                event: event.to_string(),
                reason,
            }),
            Script::Timeout => Err(CoreError::DeliveryTimeout {
                event: event.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn is_live(&self, connection: &str) -> bool {
        !self.inner.lock().unwrap().dead.contains(connection)
    }
}

/// Wraps a [`MemoryStore`], handing control back to the scheduler after
/// every read so concurrent operations interleave between read and write.
/// Deletes whose predicate matches a poisoned record fail.
pub struct InterleavingStore {
    inner: Arc<MemoryStore>,
    poisoned: Mutex<Vec<(Table, Record)>>,
}

impl InterleavingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            poisoned: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_deletes_of(&self, table: Table, record: Value) {
        if let Value::Object(record) = record {
            self.poisoned.lock().unwrap().push((table, record));
        }
    }
}

#[async_trait]
impl Store for InterleavingStore {
    async fn fetch_records(
        &self,
        table: Table,
        predicate: &Predicate,
        options: &FetchOptions,
    ) -> StoreResult<Vec<Record>> {
        let records = self.inner.fetch_records(table, predicate, options).await;
        tokio::task::yield_now().await;
        records
    }

    async fn update_records(
        &self,
        table: Table,
        predicate: &Predicate,
        column: &str,
        value: Value,
    ) -> StoreResult<usize> {
        self.inner
            .update_records(table, predicate, column, value)
            .await
    }

    async fn delete_records(&self, table: Table, predicate: &Predicate) -> StoreResult<usize> {
        let poisoned = self
            .poisoned
            .lock()
            .unwrap()
            .iter()
            .any(|(t, record)| *t == table && predicate.matches(record));
        if poisoned {
            return Err(StoreError::Backend(format!("{table} delete refused")));
        }
        self.inner.delete_records(table, predicate).await
    }

    async fn insert_record(&self, table: Table, record: Record) -> StoreResult<()> {
        self.inner.insert_record(table, record).await
    }

    async fn next_event_id(&self) -> StoreResult<EventId> {
        self.inner.next_event_id().await
    }
}

pub struct Fixture {
    pub courier: Courier,
    pub transport: Arc<ScriptedTransport>,
    pub store: Arc<MemoryStore>,
}

fn test_settings() -> DeliverySettings {
    DeliverySettings {
        ack_timeout: Duration::from_millis(50),
        flush_batch_size: 10,
        flush_ack_timeout: Duration::from_millis(50),
    }
}

pub fn fixture() -> Fixture {
    fixture_with(test_settings())
}

pub fn fixture_with(settings: DeliverySettings) -> Fixture {
    let transport = ScriptedTransport::new();
    let store = MemoryStore::new();
    let courier = Courier::new(transport.clone(), store.clone(), settings);
    Fixture {
        courier,
        transport,
        store,
    }
}

/// A fixture whose courier reads and writes through an [`InterleavingStore`].
/// `Fixture::store` still points at the underlying memory tables.
pub fn interleaved_fixture() -> (Fixture, Arc<InterleavingStore>) {
    let transport = ScriptedTransport::new();
    let store = MemoryStore::new();
    let wrapper = InterleavingStore::new(store.clone());
    let courier = Courier::new(transport.clone(), wrapper.clone(), test_settings());
    (
        Fixture {
            courier,
            transport,
            store,
        },
        wrapper,
    )
}

impl Fixture {
    pub async fn user(&self, uid: &str) -> User {
        let user = User {
            uid: uid.to_string(),
            username: format!("{uid}-name"),
            public_key: Some(format!("{uid}-key")),
            creation_date: 1,
        };
        self.store.create_user(&user).await.unwrap();
        user
    }

    pub async fn contact_request(&self, id: &str, origin: &str, recipient: &str) -> ContactRequest {
        let request = ContactRequest {
            request_id: id.to_string(),
            origin_uid: origin.to_string(),
            recipient_uid: recipient.to_string(),
            request_date: 10,
        };
        self.store.create_cr(&request).await.unwrap();
        request
    }

    pub async fn channel(&self, id: &str, a: &str, b: &str) -> RuChannel {
        let channel = RuChannel {
            channel_id: id.to_string(),
            member_a: a.to_string(),
            member_b: b.to_string(),
            creation_date: 20,
        };
        self.store.create_ru_channel(&channel).await.unwrap();
        channel
    }
}
