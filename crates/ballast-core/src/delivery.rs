// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Guarantees side-effecting operations eventually execute.
//!
//! Requests enqueue actions without waiting for them; the processor flushes
//! each request's queue before replying. Execution retries locally up to a
//! bound, then hands the action to the whole cluster by broadcasting it on
//! the router, and as the last resort records it in the failed-operation
//! ledger. An action is never silently dropped.
//!
//! The engine provides at-least-once execution, not exactly-once: callers
//! must design the mutations they enqueue to be idempotent under
//! redelivery. Transport-level deduplication is the
//! [`dedup`](crate::dedup) layer's job, not this one's.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::Action;
use crate::backends::{Database, FileStore, PubSub};
use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{BallastError, Result};
use crate::router::ActionRouter;

/// The retry/broadcast/ledger engine.
pub struct DeliveryEnsurer {
    database: Arc<dyn Database>,
    file_store: Arc<dyn FileStore>,
    pubsub: Arc<dyn PubSub>,
    router: ActionRouter,
    ledger_table: String,
    local_retry_bound: u32,
    publish_retry_bound: u32,
    publish_retry_delay: Duration,
    queues: DashMap<Uuid, Vec<Action>>,
}

impl DeliveryEnsurer {
    /// Create an engine over the given backends.
    pub fn new(
        database: Arc<dyn Database>,
        file_store: Arc<dyn FileStore>,
        pubsub: Arc<dyn PubSub>,
        router: ActionRouter,
        config: &Config,
    ) -> Self {
        Self {
            database,
            file_store,
            pubsub,
            router,
            ledger_table: config.ledger_table(),
            local_retry_bound: config.local_retry_bound,
            publish_retry_bound: config.publish_retry_bound,
            publish_retry_delay: config.publish_retry_delay,
            queues: DashMap::new(),
        }
    }

    /// Append an action to the request's pending queue. Non-blocking.
    ///
    /// The queue is created on first enqueue and drained by
    /// [`flush_and_wait`](Self::flush_and_wait). Enqueuing after the
    /// request's flush recreates the queue; the processor runs a residual
    /// flush when an interrupted handler eventually finishes, so late
    /// actions still execute.
    pub fn enqueue(&self, ctx: &RequestContext, action: Action) {
        debug!(
            request_id = %ctx.request_id(),
            query_type = %action.kind(),
            "action enqueued"
        );
        self.queues
            .entry(ctx.request_id())
            .or_default()
            .push(action);
    }

    /// Drain this request's queue and wait until every action in it has
    /// been attempted once (success, broadcast hand-off, or ledger).
    ///
    /// Only this request's queue is waited on; queues of concurrent
    /// requests are untouched.
    pub async fn flush_and_wait(self: &Arc<Self>, ctx: &RequestContext) {
        let Some((_, actions)) = self.queues.remove(&ctx.request_id()) else {
            return;
        };
        debug!(
            request_id = %ctx.request_id(),
            count = actions.len(),
            "flushing delivery queue"
        );

        let engine = Arc::clone(self);
        let worker = tokio::spawn(async move {
            for action in actions {
                // Terminal outcomes are logged and ledgered inside execute.
                let _ = engine.execute(action).await;
            }
        });
        if worker.await.is_err() {
            error!(request_id = %ctx.request_id(), "delivery worker panicked");
        }
    }

    /// Entry point for actions arriving via the cluster broadcast.
    ///
    /// Returns the terminal [`BallastError::RetriesExhausted`] when the
    /// action still fails after its broadcast round trip and lands in the
    /// ledger.
    pub async fn on_broadcast_received(&self, action: Action) -> Result<()> {
        debug!(
            query_type = %action.kind(),
            retry_count = action.retry_count(),
            "executing broadcast action"
        );
        self.execute(action).await
    }

    /// Execute one action to a terminal outcome.
    ///
    /// Failures below the retry bound retry immediately in-process; at the
    /// bound the action is handed to the cluster; past it (a broadcast
    /// round trip already happened) it goes to the ledger and the terminal
    /// error is returned.
    async fn execute(&self, mut action: Action) -> Result<()> {
        loop {
            match self.dispatch(&action).await {
                Ok(()) => {
                    debug!(
                        query_type = %action.kind(),
                        retry_count = action.retry_count(),
                        "action executed"
                    );
                    return Ok(());
                }
                Err(e) => {
                    let retry_count = action.retry_count();
                    if retry_count < self.local_retry_bound {
                        action.set_retry_count(retry_count + 1);
                        warn!(
                            query_type = %action.kind(),
                            retry_count = retry_count + 1,
                            error = %e,
                            "action failed, retrying in-process"
                        );
                    } else if retry_count == self.local_retry_bound {
                        action.set_retry_count(retry_count + 1);
                        warn!(
                            query_type = %action.kind(),
                            error = %e,
                            "local retries exhausted, handing off to cluster"
                        );
                        self.broadcast(&action).await;
                        return Ok(());
                    } else {
                        let exhausted = BallastError::RetriesExhausted {
                            query_type: action.kind().to_string(),
                            retry_count,
                        };
                        warn!(
                            error = %exhausted,
                            last_failure = %e,
                            "action still failing after broadcast round trip"
                        );
                        self.write_ledger(&action).await;
                        return Err(exhausted);
                    }
                }
            }
        }
    }

    /// Dispatch on the discriminator to the matching backend call.
    async fn dispatch(&self, action: &Action) -> Result<()> {
        match action {
            Action::FsDeleteFile { bucket, key, .. } => {
                match self.file_store.delete_file(bucket, key).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // A delete that failed against a file that no longer
                        // exists already achieved its goal.
                        if !self.file_store.file_exists(bucket, key).await.unwrap_or(true) {
                            debug!(bucket, key, "file already gone, treating delete as done");
                            Ok(())
                        } else {
                            Err(e)
                        }
                    }
                }
            }
            Action::FsDeleteFolder { bucket, prefix, .. } => {
                self.file_store.delete_folder(bucket, prefix).await
            }
            Action::DbUpdateItem {
                table,
                key_name,
                key_value,
                changes,
                ..
            } => {
                self.database
                    .update_item(table, key_name, key_value, changes)
                    .await
            }
            Action::DbPutItem {
                table,
                key_name,
                key_value,
                item,
                ..
            } => self.database.put_item(table, key_name, key_value, item).await,
            Action::DbDeleteItem {
                table,
                key_name,
                key_value,
                ..
            } => self.database.delete_item(table, key_name, key_value).await,
            Action::DbAddArrayElements {
                table,
                key_name,
                key_value,
                array_name,
                elements,
                ..
            } => {
                self.database
                    .add_array_elements(table, key_name, key_value, array_name, elements)
                    .await
            }
            Action::DbRemoveArrayElements {
                table,
                key_name,
                key_value,
                array_name,
                elements,
                ..
            } => {
                self.database
                    .remove_array_elements(table, key_name, key_value, array_name, elements)
                    .await
            }
        }
    }

    /// Hand the action to any instance in the cluster, including this one.
    ///
    /// Publishing itself retries with fixed backoff; if every attempt
    /// fails the serialized action is logged verbatim so it is never lost
    /// from observability. The ledger write happens on the normal
    /// exhausted-retry path, not here.
    async fn broadcast(&self, action: &Action) {
        let (topic, body) = match self.router.encode(action) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(
                    action = ?action,
                    error = %e,
                    "failed to encode action for broadcast"
                );
                return;
            }
        };

        let mut last_error = String::new();
        for attempt in 1..=self.publish_retry_bound {
            match self.pubsub.publish(&topic, &body).await {
                Ok(()) => {
                    info!(
                        topic,
                        query_type = %action.kind(),
                        retry_count = action.retry_count(),
                        "action handed off to cluster"
                    );
                    return;
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(topic, attempt, error = %e, "broadcast publish failed");
                    tokio::time::sleep(self.publish_retry_delay).await;
                }
            }
        }

        let failure = BallastError::PublishFailed {
            topic,
            attempts: self.publish_retry_bound,
            details: last_error,
        };
        error!(serialized_action = %body, error = %failure, "broadcast hand-off failed");
    }

    /// Record an exhausted action in the failed-operation ledger.
    ///
    /// If the ledger write itself fails, the serialized action still
    /// reaches the error channel verbatim.
    async fn write_ledger(&self, action: &Action) {
        let serialized = match action.to_wire() {
            Ok(s) => s,
            Err(e) => {
                error!(action = ?action, error = %e, "failed to serialize action for ledger");
                return;
            }
        };

        let entry_id = ledger_entry_id();
        let entry = json!({ "SerializedAction": serialized });
        match self
            .database
            .put_item(&self.ledger_table, "FailureId", &entry_id, &entry)
            .await
        {
            Ok(()) => {
                warn!(
                    ledger_table = %self.ledger_table,
                    entry_id,
                    query_type = %action.kind(),
                    retry_count = action.retry_count(),
                    "action exhausted all retries, recorded to ledger"
                );
            }
            Err(e) => {
                let failure = BallastError::LedgerWriteFailed {
                    ledger_table: self.ledger_table.clone(),
                    serialized_action: serialized,
                    details: e.to_string(),
                };
                error!(error = %failure, "ledger write failed, action preserved in log only");
            }
        }
    }
}

impl std::fmt::Debug for DeliveryEnsurer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEnsurer")
            .field("ledger_table", &self.ledger_table)
            .field("local_retry_bound", &self.local_retry_bound)
            .field("pending_queues", &self.queues.len())
            .finish_non_exhaustive()
    }
}

/// Timestamp-derived ledger key: monotonically increasing for ordering
/// eyeballs, random suffix for collision avoidance.
fn ledger_entry_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", nanos, &suffix[..8])
}
