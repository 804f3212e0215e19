// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for ballast-core E2E tests.
//!
//! Provides a started [`CoreContext`] over in-memory backends with test-fast
//! retry and clearance windows, plus a failure-injecting database wrapper.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use ballast_core::action::Action;
use ballast_core::backends::{
    Database, MemoryDatabase, MemoryFileStore, MemoryKvStore, MemoryPubSub,
};
use ballast_core::config::Config;
use ballast_core::context::CoreContext;
use ballast_core::error::{BallastError, Result};

/// Database wrapper that fails the first `failures` non-ledger calls.
pub struct FlakyDatabase {
    pub inner: MemoryDatabase,
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyDatabase {
    pub fn failing(failures: u32) -> Self {
        Self {
            inner: MemoryDatabase::new(),
            failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn fail_maybe(&self) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(BallastError::BackendUnavailable {
                backend: "database".to_string(),
                details: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Database for FlakyDatabase {
    async fn put_item(
        &self,
        table: &str,
        key_name: &str,
        key_value: &str,
        item: &Value,
    ) -> Result<()> {
        // Ledger writes always succeed so terminal handling is observable.
        if !table.starts_with("failed-ops-") {
            self.fail_maybe()?;
        }
        self.inner.put_item(table, key_name, key_value, item).await
    }

    async fn update_item(
        &self,
        table: &str,
        key_name: &str,
        key_value: &str,
        changes: &Value,
    ) -> Result<()> {
        self.fail_maybe()?;
        self.inner
            .update_item(table, key_name, key_value, changes)
            .await
    }

    async fn delete_item(&self, table: &str, key_name: &str, key_value: &str) -> Result<()> {
        self.fail_maybe()?;
        self.inner.delete_item(table, key_name, key_value).await
    }

    async fn add_array_elements(
        &self,
        table: &str,
        key_name: &str,
        key_value: &str,
        array_name: &str,
        elements: &[Value],
    ) -> Result<()> {
        self.fail_maybe()?;
        self.inner
            .add_array_elements(table, key_name, key_value, array_name, elements)
            .await
    }

    async fn remove_array_elements(
        &self,
        table: &str,
        key_name: &str,
        key_value: &str,
        array_name: &str,
        elements: &[Value],
    ) -> Result<()> {
        self.fail_maybe()?;
        self.inner
            .remove_array_elements(table, key_name, key_value, array_name, elements)
            .await
    }
}

/// A configuration with windows shrunk to test scale.
pub fn fast_config() -> Config {
    let mut config = Config::for_service("test-svc", "test");
    config.publish_retry_delay = Duration::from_millis(5);
    config.clearance_wait = Duration::from_millis(100);
    config.clearance_poll_interval = Duration::from_millis(20);
    config
}

/// A started context over in-memory backends with injectable DB failures.
pub struct TestContext {
    pub kv: Arc<MemoryKvStore>,
    pub db: Arc<FlakyDatabase>,
    pub files: Arc<MemoryFileStore>,
    pub bus: Arc<MemoryPubSub>,
    pub context: CoreContext,
}

impl TestContext {
    pub async fn new(db_failures: u32) -> Self {
        let kv = Arc::new(MemoryKvStore::new());
        let db = Arc::new(FlakyDatabase::failing(db_failures));
        let files = Arc::new(MemoryFileStore::new());
        let bus = Arc::new(MemoryPubSub::new());

        let context = CoreContext::builder()
            .config(fast_config())
            .kv(kv.clone())
            .database(db.clone())
            .file_store(files.clone())
            .pubsub(bus.clone())
            .build()
            .expect("all backends supplied")
            .start()
            .await
            .expect("context start");

        Self {
            kv,
            db,
            files,
            bus,
            context,
        }
    }
}

/// A DbPutItem action against table "T", key "K".
pub fn put_action() -> Action {
    Action::DbPutItem {
        retry_count: 0,
        table: "T".to_string(),
        key_name: "Id".to_string(),
        key_value: "K".to_string(),
        item: json!({"v": 1}),
    }
}

/// Poll `check` every 10ms until it passes or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, check: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
