// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for the full request flow: processor, clearance, delivery,
//! and the cluster broadcast round trip over real (in-memory) transport.

mod common;

use common::*;
use std::time::Duration;

use ballast_core::action::Action;
use ballast_core::clearance::AcquireOutcome;

#[tokio::test]
async fn test_flaky_database_recovers_before_response() {
    let t = TestContext::new(2).await;

    let ctx = t.context.begin_request(true);
    let delivery = t.context.delivery().clone();
    let result = t
        .context
        .processor()
        .process_request(ctx, move |request| {
            let delivery = delivery.clone();
            async move {
                delivery.enqueue(&request, put_action());
                Ok("created".to_string())
            }
        })
        .await;

    assert_eq!(result.unwrap(), "created");
    // The response only went out after the queue drained: two failures,
    // then the successful third attempt, all before this point.
    assert_eq!(t.db.attempts(), 3);
    assert!(t.db.inner.item("T", "K").is_some());
    assert!(t.db.inner.table_items("failed-ops-test-svc").is_empty());

    t.context.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_always_failing_action_travels_broadcast_to_ledger() {
    let t = TestContext::new(u32::MAX).await;

    let ctx = t.context.begin_request(true);
    let delivery = t.context.delivery().clone();
    t.context
        .processor()
        .process_request(ctx, move |request| {
            let delivery = delivery.clone();
            async move {
                delivery.enqueue(&request, put_action());
                Ok(String::new())
            }
        })
        .await
        .unwrap();

    // Local retries exhausted during the flush; the hand-off then crossed
    // the broker back into this same instance's consumer, failed once
    // more, and landed in the ledger.
    let db = t.db.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            !db.inner.table_items("failed-ops-test-svc").is_empty()
        })
        .await,
        "ledger entry must appear after the broadcast round trip"
    );

    let ledger = t.db.inner.table_items("failed-ops-test-svc");
    assert_eq!(ledger.len(), 1);
    let recorded =
        Action::from_wire(ledger[0].1["SerializedAction"].as_str().unwrap()).unwrap();
    assert_eq!(recorded.retry_count(), 6);
    assert!(t.db.inner.item("T", "K").is_none());

    t.context.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clearance_contention_interrupts_stuck_holder() {
    let t = TestContext::new(0).await;

    // Request A takes the clearance and then never finishes.
    let ctx_a = t.context.begin_request(false);
    let clearance_a = t.context.clearance().clone();
    let processor = t.context.processor();
    let holder = tokio::spawn(async move {
        processor
            .process_request(ctx_a, move |request| {
                let clearance = clearance_a.clone();
                async move {
                    clearance.acquire_for(&request, "orders", "o-1").await?;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok("never".to_string())
                }
            })
            .await
    });

    // Let A win the record before B shows up.
    let kv = t.kv.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            kv.get("op-clearance-orders-o-1").is_some()
        })
        .await
    );

    // Request B outwaits the window, broadcasts the timeout notice, and
    // takes the record by force.
    let ctx_b = t.context.begin_request(false);
    let clearance_b = t.context.clearance().clone();
    let result_b = t
        .context
        .processor()
        .process_request(ctx_b, move |request| {
            let clearance = clearance_b.clone();
            async move {
                let outcome = clearance.acquire_for(&request, "orders", "o-1").await?;
                assert_eq!(outcome, AcquireOutcome::ForcedOverride);
                Ok("took over".to_string())
            }
        })
        .await;
    assert_eq!(result_b.unwrap(), "took over");

    // The notice crossed the broker and interrupted A's wait.
    let result_a = tokio::time::timeout(Duration::from_secs(5), holder)
        .await
        .expect("request A must resolve well before its handler would")
        .unwrap();
    assert_eq!(result_a.unwrap_err().error_code(), "OPERATION_TIMED_OUT");

    // B released on its way out; the record is free again.
    assert!(t.kv.get("op-clearance-orders-o-1").is_none());

    t.context.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_opted_out_request_never_touches_clearance() {
    let t = TestContext::new(0).await;

    let ctx = t.context.begin_request(true);
    let clearance = t.context.clearance().clone();
    let result = t
        .context
        .processor()
        .process_request(ctx, move |request| {
            let clearance = clearance.clone();
            async move {
                let outcome = clearance.acquire_for(&request, "orders", "o-1").await?;
                assert_eq!(outcome, AcquireOutcome::Skipped);
                Ok("done".to_string())
            }
        })
        .await;

    assert_eq!(result.unwrap(), "done");
    assert!(t.kv.get("op-clearance-orders-o-1").is_none());

    t.context.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_always_failing_file_delete_reaches_ledger() {
    use async_trait::async_trait;
    use ballast_core::backends::{FileStore, MemoryKvStore, MemoryPubSub};
    use ballast_core::context::CoreContext;
    use ballast_core::error::{BallastError, Result};
    use std::sync::Arc;

    struct BrokenFileStore;

    #[async_trait]
    impl FileStore for BrokenFileStore {
        async fn delete_file(&self, _bucket: &str, _key: &str) -> Result<()> {
            Err(BallastError::BackendUnavailable {
                backend: "file-store".to_string(),
                details: "injected failure".to_string(),
            })
        }
        async fn delete_folder(&self, _bucket: &str, _prefix: &str) -> Result<()> {
            Ok(())
        }
        async fn file_exists(&self, _bucket: &str, _key: &str) -> Result<bool> {
            // The file is still there, so the delete genuinely failed.
            Ok(true)
        }
    }

    let db = Arc::new(FlakyDatabase::failing(0));
    let context = CoreContext::builder()
        .config(fast_config())
        .kv(Arc::new(MemoryKvStore::new()))
        .database(db.clone())
        .file_store(Arc::new(BrokenFileStore))
        .pubsub(Arc::new(MemoryPubSub::new()))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let ctx = context.begin_request(true);
    let delivery = context.delivery().clone();
    context
        .processor()
        .process_request(ctx, move |request| {
            let delivery = delivery.clone();
            async move {
                delivery.enqueue(
                    &request,
                    Action::FsDeleteFile {
                        retry_count: 0,
                        bucket: "user-files".to_string(),
                        key: "avatars/u-1.png".to_string(),
                    },
                );
                Ok(String::new())
            }
        })
        .await
        .unwrap();

    let check_db = db.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            !check_db.inner.table_items("failed-ops-test-svc").is_empty()
        })
        .await,
        "ledger entry must appear after the broadcast round trip"
    );

    let ledger = db.inner.table_items("failed-ops-test-svc");
    assert_eq!(ledger.len(), 1);
    let recorded =
        Action::from_wire(ledger[0].1["SerializedAction"].as_str().unwrap()).unwrap();
    assert_eq!(recorded.retry_count(), 6);
    assert!(matches!(recorded, Action::FsDeleteFile { .. }));

    context.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sequential_requests_share_one_context() {
    let t = TestContext::new(0).await;

    for n in 0..3 {
        let ctx = t.context.begin_request(false);
        let delivery = t.context.delivery().clone();
        t.context
            .processor()
            .process_request(ctx, move |request| {
                let delivery = delivery.clone();
                async move {
                    delivery.enqueue(
                        &request,
                        Action::DbPutItem {
                            retry_count: 0,
                            table: "T".to_string(),
                            key_name: "Id".to_string(),
                            key_value: format!("k-{}", n),
                            item: serde_json::json!({ "n": n }),
                        },
                    );
                    Ok(String::new())
                }
            })
            .await
            .unwrap();
    }

    assert_eq!(t.db.inner.table_items("T").len(), 3);
    assert!(t.context.registry().is_empty());

    t.context.shutdown().await.unwrap();
}
