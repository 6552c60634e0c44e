use std::collections::BTreeMap;

use async_trait::async_trait;
use kv_sync_core::error::RawFailure;
use parking_lot::Mutex;
use serde_json::{Map, Value};

pub type ItemAttributes = Map<String, Value>;

/// Durable key-value store keyed by (partition key, sort key).
///
/// `put_item` overwrites any existing item with the same keys, so repeated
/// writes of one record are safe.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn put_item(
        &self,
        partition_key: &str,
        sort_key: &str,
        attributes: &ItemAttributes,
    ) -> Result<(), RawFailure>;
}

/// Process-local store used by tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    items: Mutex<BTreeMap<(String, String), ItemAttributes>>,
    puts: Mutex<u64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition_key: &str, sort_key: &str) -> Option<ItemAttributes> {
        self.items
            .lock()
            .get(&(partition_key.to_string(), sort_key.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn put_count(&self) -> u64 {
        *self.puts.lock()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn put_item(
        &self,
        partition_key: &str,
        sort_key: &str,
        attributes: &ItemAttributes,
    ) -> Result<(), RawFailure> {
        if partition_key.is_empty() || sort_key.is_empty() {
            return Err(RawFailure::StoreRejected(
                "partition and sort keys must be non-empty".to_string(),
            ));
        }
        *self.puts.lock() += 1;
        self.items.lock().insert(
            (partition_key.to_string(), sort_key.to_string()),
            attributes.clone(),
        );
        Ok(())
    }
}
