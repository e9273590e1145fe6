//! Data-access contract for users, contact requests, channels and the event outbox.
//!
//! Records are flat JSON objects keyed by column name. A [`Predicate`] is a
//! conjunction of `column == value` clauses; every backend evaluates it with
//! [`select`] so the query semantics stay identical between them.

mod memory;
mod redis_store;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::model::{ContactRequest, EventId, NewEvent, RuChannel, StoredEvent, User};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

pub type Record = Map<String, Value>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type StoreHandle = Arc<dyn Store>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Users,
    ContactRequests,
    Channels,
    Events,
}

impl Table {
    pub const fn as_str(self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::ContactRequests => "contact_requests",
            Table::Channels => "channels",
            Table::Events => "events",
        }
    }

    pub const fn primary_key(self) -> &'static str {
        match self {
            Table::Users => "uid",
            Table::ContactRequests => "request_id",
            Table::Channels => "channel_id",
            Table::Events => "event_id",
        }
    }

    /// Primary key of `record` rendered as a string.
    pub fn key_of(self, record: &Record) -> StoreResult<String> {
        match record.get(self.primary_key()) {
            Some(Value::String(key)) => Ok(key.clone()),
            Some(Value::Number(key)) => Ok(key.to_string()),
            _ => Err(StoreError::Codec(format!(
                "{} record is missing its `{}` column",
                self,
                self.primary_key()
            ))),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("no {table} record matched")]
    EmptyResult { table: Table },
    #[error("{count} {table} records matched where exactly one was required")]
    MultipleResults { table: Table, count: usize },
    #[error("{table} record `{key}` already exists")]
    Duplicate { table: Table, key: String },
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("record codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

/// Conjunction of equality clauses over record columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate(BTreeMap<String, Value>);

impl Predicate {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::default().and(column, value)
    }

    pub fn and(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.0.insert(column.to_string(), value.into());
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.0
            .iter()
            .all(|(column, expected)| record.get(column) == Some(expected))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub column: String,
    pub ascending: bool,
}

impl Sort {
    pub fn ascending(column: &str) -> Self {
        Self {
            column: column.to_string(),
            ascending: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Projection; `None` returns every column.
    pub columns: Option<Vec<String>>,
    pub sort: Option<Sort>,
    pub limit: Option<usize>,
}

impl FetchOptions {
    pub fn sorted(sort: Sort) -> Self {
        Self {
            sort: Some(sort),
            ..Self::default()
        }
    }

    pub fn columns(columns: &[&str]) -> Self {
        Self {
            columns: Some(columns.iter().map(|c| c.to_string()).collect()),
            ..Self::default()
        }
    }
}

/// Filter, sort, truncate and project `records` the way every backend must.
pub fn select(
    records: impl IntoIterator<Item = Record>,
    predicate: &Predicate,
    options: &FetchOptions,
) -> Vec<Record> {
    let mut matched: Vec<Record> = records
        .into_iter()
        .filter(|record| predicate.matches(record))
        .collect();

    if let Some(sort) = &options.sort {
        matched.sort_by(|a, b| {
            let ordering = compare_values(a.get(&sort.column), b.get(&sort.column));
            if sort.ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
    }
    if let Some(limit) = options.limit {
        matched.truncate(limit);
    }
    if let Some(columns) = &options.columns {
        for record in &mut matched {
            record.retain(|column, _| columns.iter().any(|c| c == column));
        }
    }
    matched
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

pub fn to_record<T: Serialize>(value: &T) -> StoreResult<Record> {
    match serde_json::to_value(value)? {
        Value::Object(record) => Ok(record),
        other => Err(StoreError::Codec(format!(
            "expected an object record, got {other}"
        ))),
    }
}

pub fn from_record<T: DeserializeOwned>(record: Record) -> StoreResult<T> {
    Ok(serde_json::from_value(Value::Object(record))?)
}

fn exactly_one(table: Table, mut records: Vec<Record>) -> StoreResult<Record> {
    match records.len() {
        0 => Err(StoreError::EmptyResult { table }),
        1 => Ok(records.remove(0)),
        count => Err(StoreError::MultipleResults { table, count }),
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn fetch_records(
        &self,
        table: Table,
        predicate: &Predicate,
        options: &FetchOptions,
    ) -> StoreResult<Vec<Record>>;

    /// Sets `column = value` on every matching record; returns the number touched.
    async fn update_records(
        &self,
        table: Table,
        predicate: &Predicate,
        column: &str,
        value: Value,
    ) -> StoreResult<usize>;

    async fn delete_records(&self, table: Table, predicate: &Predicate) -> StoreResult<usize>;

    /// Inserts a record; fails with [`StoreError::Duplicate`] if its key exists.
    async fn insert_record(&self, table: Table, record: Record) -> StoreResult<()>;

    /// Next value of the monotonic outbox sequence.
    async fn next_event_id(&self) -> StoreResult<EventId>;

    async fn fetch_record(&self, table: Table, predicate: &Predicate) -> StoreResult<Record> {
        let records = self
            .fetch_records(table, predicate, &FetchOptions::default())
            .await?;
        exactly_one(table, records)
    }

    async fn create_user(&self, user: &User) -> StoreResult<()> {
        self.insert_record(Table::Users, to_record(user)?).await
    }

    async fn create_cr(&self, request: &ContactRequest) -> StoreResult<()> {
        self.insert_record(Table::ContactRequests, to_record(request)?)
            .await
    }

    async fn create_ru_channel(&self, channel: &RuChannel) -> StoreResult<()> {
        self.insert_record(Table::Channels, to_record(channel)?).await
    }

    async fn create_event(&self, event: NewEvent) -> StoreResult<StoredEvent> {
        let event_id = self.next_event_id().await?;
        let stored = event.with_id(event_id);
        self.insert_record(Table::Events, to_record(&stored)?).await?;
        Ok(stored)
    }

    async fn fetch_user(&self, uid: &str) -> StoreResult<User> {
        let record = self
            .fetch_record(Table::Users, &Predicate::eq("uid", uid))
            .await?;
        from_record(record)
    }

    async fn username_taken(&self, username: &str) -> StoreResult<bool> {
        let options = FetchOptions {
            limit: Some(1),
            ..FetchOptions::columns(&["uid"])
        };
        let records = self
            .fetch_records(Table::Users, &Predicate::eq("username", username), &options)
            .await?;
        Ok(!records.is_empty())
    }

    async fn fetch_cr(&self, request_id: &str) -> StoreResult<ContactRequest> {
        let record = self
            .fetch_record(
                Table::ContactRequests,
                &Predicate::eq("request_id", request_id),
            )
            .await?;
        from_record(record)
    }

    /// Pending requests where `uid` is either the origin or the recipient.
    async fn contact_requests_for(&self, uid: &str) -> StoreResult<Vec<ContactRequest>> {
        let mut records = self
            .fetch_records(
                Table::ContactRequests,
                &Predicate::eq("origin_uid", uid),
                &FetchOptions::default(),
            )
            .await?;
        records.extend(
            self.fetch_records(
                Table::ContactRequests,
                &Predicate::eq("recipient_uid", uid),
                &FetchOptions::default(),
            )
            .await?,
        );
        records.into_iter().map(from_record).collect()
    }

    async fn fetch_channel(&self, channel_id: &str) -> StoreResult<RuChannel> {
        let record = self
            .fetch_record(Table::Channels, &Predicate::eq("channel_id", channel_id))
            .await?;
        from_record(record)
    }

    /// Channels where `uid` is either member.
    async fn channels_for(&self, uid: &str) -> StoreResult<Vec<RuChannel>> {
        let mut records = self
            .fetch_records(
                Table::Channels,
                &Predicate::eq("member_a", uid),
                &FetchOptions::default(),
            )
            .await?;
        records.extend(
            self.fetch_records(
                Table::Channels,
                &Predicate::eq("member_b", uid),
                &FetchOptions::default(),
            )
            .await?,
        );
        let mut channels: Vec<RuChannel> = records
            .into_iter()
            .map(from_record)
            .collect::<StoreResult<_>>()?;
        // A self-channel would match both queries.
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        channels.dedup_by(|a, b| a.channel_id == b.channel_id);
        Ok(channels)
    }

    /// Outbox of `recipient_uid`, oldest first.
    async fn pending_events(&self, recipient_uid: &str) -> StoreResult<Vec<StoredEvent>> {
        let records = self
            .fetch_records(
                Table::Events,
                &Predicate::eq("recipient_uid", recipient_uid),
                &FetchOptions::sorted(Sort::ascending("timestamp")),
            )
            .await?;
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            match from_record::<StoredEvent>(record) {
                Ok(event) => events.push(event),
                Err(err) => warn!(recipient = %recipient_uid, error = %err, "skipping unreadable outbox record"),
            }
        }
        events.sort_by_key(|event| (event.timestamp, event.event_id));
        Ok(events)
    }

    async fn delete_event(&self, event_id: EventId) -> StoreResult<usize> {
        self.delete_records(Table::Events, &Predicate::eq("event_id", event_id))
            .await
    }
}
