// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runs request handlers off the caller and lets a cluster-broadcast
//! timeout notice interrupt the wait.
//!
//! The caller parks on a result slot (a bounded channel of size one)
//! that either the handler task or the timeout path writes to. First
//! writer wins; the loser's write is a no-op. A handler interrupted this
//! way keeps running unsupervised in the background; the notice only stops
//! the caller from waiting on it.
//!
//! Live requests register in a [`ProcessorRegistry`] so the broadcast
//! subscription can reach them; entries are removed explicitly when the
//! wait resolves and closed slots are pruned on every notice, so a
//! processor that disappeared without deregistering cannot wedge the
//! broadcast path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::clearance::{ClearanceController, TimeoutNotice};
use crate::context::RequestContext;
use crate::delivery::DeliveryEnsurer;
use crate::error::{BallastError, Result};

/// What a request handler resolves to: a response body, or an error.
pub type HandlerResult = Result<String>;

/// Process-wide registry of requests currently parked on a result slot.
#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    entries: DashMap<u64, RegisteredRequest>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct RegisteredRequest {
    ctx: Arc<RequestContext>,
    slot: mpsc::Sender<HandlerResult>,
}

impl ProcessorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parked request; returns a handle for deregistration.
    pub fn register(&self, ctx: Arc<RequestContext>, slot: mpsc::Sender<HandlerResult>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, RegisteredRequest { ctx, slot });
        id
    }

    /// Remove a request once its wait resolved.
    pub fn deregister(&self, id: u64) {
        self.entries.remove(&id);
    }

    /// Fan a timeout notice out to every request tracking the pair.
    ///
    /// Requests not tracking `(table, identifier)` are untouched; a
    /// request whose slot already holds a result ignores the write (first
    /// writer wins). Duplicate notices are therefore harmless.
    pub fn on_timeout_notice(&self, notice: &TimeoutNotice) {
        for entry in self.entries.iter() {
            if entry.ctx.is_tracking(&notice.table, &notice.identifier) {
                debug!(
                    request_id = %entry.ctx.request_id(),
                    table = %notice.table,
                    identifier = %notice.identifier,
                    "timeout notice matched tracked pair, interrupting wait"
                );
                let _ = entry.slot.try_send(Err(BallastError::OperationTimedOut {
                    table: notice.table.clone(),
                    identifier: notice.identifier.clone(),
                }));
            }
        }
        // Prune requests whose receivers are gone.
        self.entries.retain(|_, entry| !entry.slot.is_closed());
    }

    /// Number of currently registered requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no requests are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Orchestrates one request: worker dispatch, interruptible wait, and the
/// end-of-request clearance/delivery flush.
pub struct RequestProcessor {
    registry: Arc<ProcessorRegistry>,
    clearance: Arc<ClearanceController>,
    delivery: Arc<DeliveryEnsurer>,
}

impl RequestProcessor {
    /// Create a processor over the shared coordination pieces.
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        clearance: Arc<ClearanceController>,
        delivery: Arc<DeliveryEnsurer>,
    ) -> Self {
        Self {
            registry,
            clearance,
            delivery,
        }
    }

    /// Run `handler` on a worker and wait for the first of: handler
    /// completion, or a timeout notice matching a pair this request
    /// tracks.
    ///
    /// Before the result is returned to the transport layer, deferred
    /// clearance releases are flushed (when clearance tracking is on) and
    /// the request's delivery queue is drained. If a timeout notice
    /// interrupted the wait, the handler keeps running in the background;
    /// whatever it acquires or enqueues after this point is covered by a
    /// residual flush once it actually finishes.
    #[instrument(skip_all, fields(request_id = %ctx.request_id()))]
    pub async fn process_request<F, Fut>(&self, ctx: Arc<RequestContext>, handler: F) -> HandlerResult
    where
        F: FnOnce(Arc<RequestContext>) -> Fut,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let (slot_tx, mut slot_rx) = mpsc::channel::<HandlerResult>(1);
        let (flushed_tx, flushed_rx) = oneshot::channel::<()>();
        let entry_id = self.registry.register(ctx.clone(), slot_tx.clone());

        let worker = tokio::spawn(handler(ctx.clone()));
        let watcher_ctx = ctx.clone();
        let watcher_clearance = self.clearance.clone();
        let watcher_delivery = self.delivery.clone();
        tokio::spawn(async move {
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "request handler panicked");
                    Err(BallastError::HandlerFailed {
                        details: e.to_string(),
                    })
                }
            };
            // First writer wins: a timeout notice may already occupy the slot.
            let _ = slot_tx.try_send(result);

            // A handler that was interrupted keeps running past the caller's
            // end-of-request flush and may acquire or enqueue afterwards.
            // Once the caller's flush is done and the handler has actually
            // finished, run a residual flush so nothing it left behind is
            // lost.
            let _ = flushed_rx.await;
            if watcher_ctx.clearance_tracking() {
                watcher_clearance.flush_releases(&watcher_ctx).await;
            }
            watcher_delivery.flush_and_wait(&watcher_ctx).await;
        });

        // The registry keeps a sender alive until deregistration, so the
        // slot cannot close before a result arrives.
        let result = match slot_rx.recv().await {
            Some(result) => result,
            None => Err(BallastError::HandlerFailed {
                details: "result slot closed before any writer".to_string(),
            }),
        };
        self.registry.deregister(entry_id);

        if ctx.clearance_tracking() {
            self.clearance.flush_releases(&ctx).await;
        }
        self.delivery.flush_and_wait(&ctx).await;
        let _ = flushed_tx.send(());

        result
    }
}

impl std::fmt::Debug for RequestProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestProcessor")
            .field("registered", &self.registry.len())
            .finish_non_exhaustive()
    }
}
