// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process backend implementations.
//!
//! These back the capability traits with process-local state. They exist
//! for tests and for embedders that want the coordination semantics without
//! a cloud provider; everything here is lost on process exit.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{Database, FileStore, KvStore, PubSub};
use crate::error::Result;

/// Buffer size for per-subscriber channels.
const SUBSCRIBER_BUFFER: usize = 64;

/// In-process [`KvStore`].
///
/// `set_if_absent` is atomic via the map's entry API, so racing callers
/// observe exactly one winner just like against a real conditional write.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, String>,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value directly (test helper, not part of the contract).
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(value.to_string());
                Ok(true)
            }
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }
}

/// In-process [`Database`] storing JSON items keyed by (table, key value).
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    rows: DashMap<(String, String), Value>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an item directly (test helper).
    pub fn item(&self, table: &str, key_value: &str) -> Option<Value> {
        self.rows
            .get(&(table.to_string(), key_value.to_string()))
            .map(|v| v.value().clone())
    }

    /// All items in a table, as (key value, item) pairs (test helper).
    pub fn table_items(&self, table: &str) -> Vec<(String, Value)> {
        self.rows
            .iter()
            .filter(|entry| entry.key().0 == table)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn put_item(
        &self,
        table: &str,
        key_name: &str,
        key_value: &str,
        item: &Value,
    ) -> Result<()> {
        let mut stored = item.clone();
        if let Value::Object(ref mut fields) = stored {
            fields.insert(key_name.to_string(), Value::String(key_value.to_string()));
        }
        self.rows
            .insert((table.to_string(), key_value.to_string()), stored);
        Ok(())
    }

    async fn update_item(
        &self,
        table: &str,
        key_name: &str,
        key_value: &str,
        changes: &Value,
    ) -> Result<()> {
        let mut entry = self
            .rows
            .entry((table.to_string(), key_value.to_string()))
            .or_insert_with(|| {
                let mut fields = Map::new();
                fields.insert(key_name.to_string(), Value::String(key_value.to_string()));
                Value::Object(fields)
            });
        if let (Value::Object(existing), Value::Object(updates)) =
            (entry.value_mut(), changes)
        {
            for (field, value) in updates {
                existing.insert(field.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn delete_item(&self, table: &str, _key_name: &str, key_value: &str) -> Result<()> {
        self.rows
            .remove(&(table.to_string(), key_value.to_string()));
        Ok(())
    }

    async fn add_array_elements(
        &self,
        table: &str,
        key_name: &str,
        key_value: &str,
        array_name: &str,
        elements: &[Value],
    ) -> Result<()> {
        let mut entry = self
            .rows
            .entry((table.to_string(), key_value.to_string()))
            .or_insert_with(|| {
                let mut fields = Map::new();
                fields.insert(key_name.to_string(), Value::String(key_value.to_string()));
                Value::Object(fields)
            });
        if let Value::Object(fields) = entry.value_mut() {
            let array = fields
                .entry(array_name.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = array {
                items.extend(elements.iter().cloned());
            }
        }
        Ok(())
    }

    async fn remove_array_elements(
        &self,
        table: &str,
        _key_name: &str,
        key_value: &str,
        array_name: &str,
        elements: &[Value],
    ) -> Result<()> {
        if let Some(mut entry) = self
            .rows
            .get_mut(&(table.to_string(), key_value.to_string()))
        {
            if let Value::Object(fields) = entry.value_mut() {
                if let Some(Value::Array(items)) = fields.get_mut(array_name) {
                    items.retain(|item| !elements.contains(item));
                }
            }
        }
        Ok(())
    }
}

/// In-process [`FileStore`] keyed by `bucket/key`.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: DashMap<String, Vec<u8>>,
}

impl MemoryFileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a file (test helper).
    pub fn put(&self, bucket: &str, key: &str, contents: &[u8]) {
        self.files
            .insert(format!("{}/{}", bucket, key), contents.to_vec());
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn delete_file(&self, bucket: &str, key: &str) -> Result<()> {
        self.files.remove(&format!("{}/{}", bucket, key));
        Ok(())
    }

    async fn delete_folder(&self, bucket: &str, prefix: &str) -> Result<()> {
        let folder = format!("{}/{}", bucket, prefix);
        self.files.retain(|path, _| !path.starts_with(&folder));
        Ok(())
    }

    async fn file_exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.files.contains_key(&format!("{}/{}", bucket, key)))
    }
}

/// In-process [`PubSub`] fanning messages out to every subscriber.
///
/// Delivery is at-least-once in spirit: a subscriber whose buffer is full
/// or whose receiver was dropped simply misses the message, matching the
/// weak guarantees of the real transports this stands in for.
#[derive(Debug, Default)]
pub struct MemoryPubSub {
    topics: DashMap<String, Vec<mpsc::Sender<String>>>,
}

impl MemoryPubSub {
    /// Create a bus with no topics.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, body: &str) -> Result<()> {
        // Clone the sender list out so no map guard is held across awaits.
        let senders: Vec<mpsc::Sender<String>> = match self.topics.get(topic) {
            Some(list) => list.value().clone(),
            None => return Ok(()),
        };
        for sender in senders {
            let _ = sender.send(body.to_string()).await;
        }
        if let Some(mut list) = self.topics.get_mut(topic) {
            list.value_mut().retain(|sender| !sender.is_closed());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.topics.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }
}
