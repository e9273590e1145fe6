use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{select, FetchOptions, Predicate, Record, Store, StoreError, StoreResult, Table};
use crate::model::EventId;

/// Process-local store for development and tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, BTreeMap<String, Record>>>,
    sequence: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn count(&self, table: Table) -> usize {
        self.tables
            .lock()
            .await
            .get(&table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch_records(
        &self,
        table: Table,
        predicate: &Predicate,
        options: &FetchOptions,
    ) -> StoreResult<Vec<Record>> {
        let tables = self.tables.lock().await;
        let rows = tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(select(rows, predicate, options))
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
        let mut tables = self.tables.lock().await;
        let mut touched = 0;
        if let Some(rows) = tables.get_mut(&table) {
            for record in rows.values_mut().filter(|record| predicate.matches(record)) {
                record.insert(column.to_string(), value.clone());
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn delete_records(&self, table: Table, predicate: &Predicate) -> StoreResult<usize> {
        let mut tables = self.tables.lock().await;
        let Some(rows) = tables.get_mut(&table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|_, record| !predicate.matches(record));
        Ok(before - rows.len())
    }

    async fn insert_record(&self, table: Table, record: Record) -> StoreResult<()> {
        let key = table.key_of(&record)?;
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(table).or_default();
        if rows.contains_key(&key) {
            return Err(StoreError::Duplicate { table, key });
        }
        rows.insert(key, record);
        Ok(())
    }

    async fn next_event_id(&self) -> StoreResult<EventId> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }
}
