// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend capability contracts and reference implementations.
//!
//! These traits are the narrow seams toward the pluggable cloud backends.
//! Provider bindings (managed KV stores, document databases, blob stores,
//! message buses) implement them out of tree; the in-process [`memory`]
//! backends implement them for tests and embedders.

pub mod memory;

pub use self::memory::{MemoryDatabase, MemoryFileStore, MemoryKvStore, MemoryPubSub};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// A key-value store offering conditional writes.
///
/// The only primitive the clearance controller and the dedup layer rely on
/// is [`set_if_absent`](KvStore::set_if_absent): two concurrent calls for
/// the same key must yield exactly one winner. The store is not expected to
/// provide locks, TTLs, or transactions.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set `key` to `value` only if the key does not exist yet.
    ///
    /// Returns `true` if this call created the entry, `false` if the key
    /// was already present.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool>;

    /// Unconditionally set `key` to `value`, overwriting any holder.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// A document database keyed by table / key-name / key-value.
#[async_trait]
pub trait Database: Send + Sync {
    /// Insert or replace an item.
    async fn put_item(
        &self,
        table: &str,
        key_name: &str,
        key_value: &str,
        item: &Value,
    ) -> Result<()>;

    /// Merge `changes` into an existing item (upsert on miss).
    async fn update_item(
        &self,
        table: &str,
        key_name: &str,
        key_value: &str,
        changes: &Value,
    ) -> Result<()>;

    /// Delete an item. Deleting a missing item is not an error.
    async fn delete_item(&self, table: &str, key_name: &str, key_value: &str) -> Result<()>;

    /// Append elements to an array attribute of an item.
    async fn add_array_elements(
        &self,
        table: &str,
        key_name: &str,
        key_value: &str,
        array_name: &str,
        elements: &[Value],
    ) -> Result<()>;

    /// Remove matching elements from an array attribute of an item.
    async fn remove_array_elements(
        &self,
        table: &str,
        key_name: &str,
        key_value: &str,
        array_name: &str,
        elements: &[Value],
    ) -> Result<()>;
}

/// A blob/file store addressed by bucket and key.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Delete a single file.
    async fn delete_file(&self, bucket: &str, key: &str) -> Result<()>;

    /// Delete every file under a prefix.
    async fn delete_folder(&self, bucket: &str, prefix: &str) -> Result<()>;

    /// Whether the file currently exists.
    ///
    /// Used to distinguish "delete failed" from "already gone" when a
    /// delete reports an error.
    async fn file_exists(&self, bucket: &str, key: &str) -> Result<bool>;
}

/// A publish/subscribe transport.
///
/// Delivery is at-least-once and possibly duplicated; the
/// [`dedup`](crate::dedup) layer narrows that to effectively-once where it
/// matters.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a message body to a topic.
    async fn publish(&self, topic: &str, body: &str) -> Result<()>;

    /// Subscribe to a topic, receiving raw message bodies.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>>;
}
