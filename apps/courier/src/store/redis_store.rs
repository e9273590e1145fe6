use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::Value;

use super::{select, FetchOptions, Predicate, Record, Store, StoreError, StoreResult, Table};
use crate::model::EventId;

/// Records live as JSON strings under `{prefix}:{table}:{key}`; each table
/// keeps a set of its keys so scans never touch unrelated keyspace.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, prefix: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            prefix: prefix.to_string(),
        })
    }

    fn record_key(&self, table: Table, key: &str) -> String {
        format!("{}:{}:{}", self.prefix, table, key)
    }

    fn index_key(&self, table: Table) -> String {
        format!("{}:{}:index", self.prefix, table)
    }

    fn sequence_key(&self) -> String {
        format!("{}:events:sequence", self.prefix)
    }

    /// Every record of `table` paired with its primary key.
    async fn load_table(&self, table: Table) -> StoreResult<Vec<(String, Record)>> {
        let mut conn = self.redis.clone();
        let keys: Vec<String> = conn.smembers(self.index_key(table)).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let record_keys: Vec<String> = keys.iter().map(|k| self.record_key(table, k)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&record_keys)
            .query_async(&mut conn)
            .await?;

        let mut rows = Vec::with_capacity(keys.len());
        for (key, value) in keys.into_iter().zip(values) {
            let Some(json) = value else {
                // Index entry outlived its record.
                let _: () = conn.srem(self.index_key(table), &key).await?;
                continue;
            };
            match serde_json::from_str::<Value>(&json)? {
                Value::Object(record) => rows.push((key, record)),
                _ => {
                    tracing::warn!(%table, %key, "ignoring non-object record");
                }
            }
        }
        Ok(rows)
    }

    async fn matching(
        &self,
        table: Table,
        predicate: &Predicate,
    ) -> StoreResult<Vec<(String, Record)>> {
        Ok(self
            .load_table(table)
            .await?
            .into_iter()
            .filter(|(_, record)| predicate.matches(record))
            .collect())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn fetch_records(
        &self,
        table: Table,
        predicate: &Predicate,
        options: &FetchOptions,
    ) -> StoreResult<Vec<Record>> {
        let rows = self.load_table(table).await?;
        Ok(select(
            rows.into_iter().map(|(_, record)| record),
            predicate,
            options,
        ))
    }

    async fn update_records(
        &self,
        table: Table,
        predicate: &Predicate,
        column: &str,
        value: Value,
    ) -> StoreResult<usize> {
        if column == table.primary_key() {
            return Err(StoreError::Backend(format!(
                "refusing to rewrite primary key `{column}` of {table}"
            )));
        }
        let rows = self.matching(table, predicate).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        for (key, mut record) in rows.iter().cloned() {
            record.insert(column.to_string(), value.clone());
            pipe.cmd("SET")
                .arg(self.record_key(table, &key))
                .arg(serde_json::to_string(&record)?)
                .ignore();
        }
        let mut conn = self.redis.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(rows.len())
    }

    async fn delete_records(&self, table: Table, predicate: &Predicate) -> StoreResult<usize> {
        let rows = self.matching(table, predicate).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        for (key, _) in &rows {
            pipe.cmd("DEL")
                .arg(self.record_key(table, key))
                .ignore()
                .cmd("SREM")
                .arg(self.index_key(table))
                .arg(key)
                .ignore();
        }
        let mut conn = self.redis.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(rows.len())
    }

    async fn insert_record(&self, table: Table, record: Record) -> StoreResult<()> {
        let key = table.key_of(&record)?;
        let serialized = serde_json::to_string(&record)?;
        let mut conn = self.redis.clone();
        let created: bool = conn.set_nx(self.record_key(table, &key), serialized).await?;
        if !created {
            return Err(StoreError::Duplicate { table, key });
        }
        let _: () = conn.sadd(self.index_key(table), &key).await?;
        Ok(())
    }

    async fn next_event_id(&self) -> StoreResult<EventId> {
        let mut conn = self.redis.clone();
        let id: EventId = conn.incr(self.sequence_key(), 1).await?;
        Ok(id)
    }
}
