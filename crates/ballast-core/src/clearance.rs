// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-process mutual exclusion built on conditional KV writes.
//!
//! A clearance record's existence is the lock: it is created with a
//! conditional "set if absent", deleted by the holder on release, and
//! forcibly overwritten by a waiter whose patience ran out. The force
//! override is a deliberate liveness-over-exclusion policy ("assume the
//! other holder is stuck or dead"), always preceded by a cluster-wide
//! timeout notice so whoever is tracking the pair abandons its wait. The
//! window and poll interval are tunable per deployment because the
//! heuristic is not proven safe for every table.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backends::{KvStore, PubSub};
use crate::config::Config;
use crate::context::RequestContext;
use crate::error::Result;
use crate::router::ActionRouter;

/// Sentinel value marking a clearance record as held.
const BUSY_SENTINEL: &str = "busy";

/// Broadcast value object telling every cluster member tracking a
/// `(table, identifier)` pair to abandon its wait.
///
/// Compared structurally; duplicate notices for pairs nobody tracks are
/// harmless no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeoutNotice {
    /// Table of the contended pair.
    #[serde(rename = "tableName")]
    pub table: String,
    /// Identifier of the contended pair.
    #[serde(rename = "identifier")]
    pub identifier: String,
}

/// How an acquisition resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The conditional set won on the first attempt.
    Immediate,
    /// The conditional set won after polling while another holder released.
    Waited,
    /// The wait window elapsed; a timeout notice was broadcast and the
    /// record was overwritten.
    ForcedOverride,
    /// The request opted out of clearance tracking; nothing was acquired.
    Skipped,
}

/// Serializes concurrent operations against the same logical resource.
pub struct ClearanceController {
    kv: Arc<dyn KvStore>,
    pubsub: Arc<dyn PubSub>,
    notice_topic: String,
    prefix: String,
    wait: Duration,
    poll_interval: Duration,
}

impl ClearanceController {
    /// Create a controller using the deployment's notice topic and the
    /// configured prefix and windows.
    pub fn new(
        kv: Arc<dyn KvStore>,
        pubsub: Arc<dyn PubSub>,
        router: &ActionRouter,
        config: &Config,
    ) -> Self {
        Self {
            kv,
            pubsub,
            notice_topic: router.timeout_topic(),
            prefix: config.clearance_prefix.clone(),
            wait: config.clearance_wait,
            poll_interval: config.clearance_poll_interval,
        }
    }

    fn key(&self, table: &str, identifier: &str) -> String {
        format!("{}{}-{}", self.prefix, table, identifier)
    }

    /// Acquire clearance for `(table, identifier)`.
    ///
    /// Polls the conditional set once per poll interval for the duration
    /// of the wait window; past the window, broadcasts a [`TimeoutNotice`]
    /// and force-overwrites the record. After this returns (other than an
    /// error), the caller holds clearance.
    pub async fn acquire(&self, table: &str, identifier: &str) -> Result<AcquireOutcome> {
        let key = self.key(table, identifier);

        if self.kv.set_if_absent(&key, BUSY_SENTINEL).await? {
            debug!(table, identifier, "clearance acquired immediately");
            return Ok(AcquireOutcome::Immediate);
        }

        let deadline = Instant::now() + self.wait;
        while Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
            if self.kv.set_if_absent(&key, BUSY_SENTINEL).await? {
                debug!(table, identifier, "clearance acquired after waiting");
                return Ok(AcquireOutcome::Waited);
            }
        }

        // Presume the holder is stuck or dead: tell the whole cluster the
        // pair timed out, then take the record unconditionally.
        warn!(
            table,
            identifier,
            wait_secs = self.wait.as_secs_f64(),
            "clearance wait elapsed, broadcasting timeout and overriding"
        );
        let notice = TimeoutNotice {
            table: table.to_string(),
            identifier: identifier.to_string(),
        };
        match serde_json::to_string(&notice) {
            Ok(body) => {
                if let Err(e) = self.pubsub.publish(&self.notice_topic, &body).await {
                    // Liveness wins: the override proceeds even if the
                    // notice could not be delivered.
                    warn!(table, identifier, error = %e, "failed to broadcast timeout notice");
                }
            }
            Err(e) => {
                warn!(table, identifier, error = %e, "failed to serialize timeout notice");
            }
        }
        self.kv.set(&key, BUSY_SENTINEL).await?;
        Ok(AcquireOutcome::ForcedOverride)
    }

    /// Acquire clearance on behalf of a request.
    ///
    /// Returns [`AcquireOutcome::Skipped`] without touching the KV store
    /// when the request opted out of clearance tracking. On success the
    /// pair is tracked on the request (so a matching timeout notice can
    /// interrupt it) and its release is deferred to the end-of-request
    /// flush.
    pub async fn acquire_for(
        &self,
        ctx: &RequestContext,
        table: &str,
        identifier: &str,
    ) -> Result<AcquireOutcome> {
        if !ctx.clearance_tracking() {
            return Ok(AcquireOutcome::Skipped);
        }
        let outcome = self.acquire(table, identifier).await?;
        ctx.track_pair(table, identifier);
        ctx.defer_release(table, identifier);
        Ok(outcome)
    }

    /// Release clearance immediately.
    pub async fn release(&self, table: &str, identifier: &str) -> Result<()> {
        self.kv.delete(&self.key(table, identifier)).await?;
        debug!(table, identifier, "clearance released");
        Ok(())
    }

    /// Delete every release the request deferred, in one pass.
    ///
    /// Individual failures are logged and do not stop the pass; a leaked
    /// record is eventually reclaimed by some waiter's force override.
    pub async fn flush_releases(&self, ctx: &RequestContext) {
        let deferred = ctx.take_deferred_releases();
        if deferred.is_empty() {
            return;
        }
        debug!(
            request_id = %ctx.request_id(),
            count = deferred.len(),
            "flushing deferred clearance releases"
        );
        for (table, identifier) in deferred {
            if let Err(e) = self.release(&table, &identifier).await {
                warn!(
                    table,
                    identifier,
                    error = %e,
                    "failed to release clearance, a waiter will override it"
                );
            }
            ctx.untrack_pair(&table, &identifier);
        }
    }
}

impl std::fmt::Debug for ClearanceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClearanceController")
            .field("notice_topic", &self.notice_topic)
            .field("prefix", &self.prefix)
            .field("wait", &self.wait)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryKvStore, MemoryPubSub};

    fn fast_config() -> Config {
        let mut config = Config::for_service("test-svc", "test");
        config.clearance_wait = Duration::from_millis(200);
        config.clearance_poll_interval = Duration::from_millis(40);
        config
    }

    fn controller(
        kv: Arc<MemoryKvStore>,
        bus: Arc<MemoryPubSub>,
    ) -> ClearanceController {
        let config = fast_config();
        let router = ActionRouter::new(&config.deploy_branch);
        ClearanceController::new(kv, bus, &router, &config)
    }

    #[tokio::test]
    async fn test_immediate_acquisition() {
        let kv = Arc::new(MemoryKvStore::new());
        let ctrl = controller(kv.clone(), Arc::new(MemoryPubSub::new()));

        let outcome = ctrl.acquire("orders", "o-1").await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Immediate);
        assert_eq!(
            kv.get("op-clearance-orders-o-1"),
            Some("busy".to_string())
        );
    }

    #[tokio::test]
    async fn test_waiter_wins_after_release() {
        let kv = Arc::new(MemoryKvStore::new());
        let bus = Arc::new(MemoryPubSub::new());
        let ctrl = Arc::new(controller(kv, bus));

        assert_eq!(
            ctrl.acquire("orders", "o-1").await.unwrap(),
            AcquireOutcome::Immediate
        );

        let waiter = {
            let ctrl = ctrl.clone();
            tokio::spawn(async move { ctrl.acquire("orders", "o-1").await.unwrap() })
        };

        // Release while the waiter is polling.
        tokio::time::sleep(Duration::from_millis(60)).await;
        ctrl.release("orders", "o-1").await.unwrap();

        assert_eq!(waiter.await.unwrap(), AcquireOutcome::Waited);
    }

    #[tokio::test]
    async fn test_force_override_broadcasts_exactly_one_notice() {
        let kv = Arc::new(MemoryKvStore::new());
        let bus = Arc::new(MemoryPubSub::new());
        let ctrl = controller(kv.clone(), bus.clone());

        use crate::backends::PubSub as _;
        let mut notices = bus.subscribe("OperationTimeout-test").await.unwrap();

        assert_eq!(
            ctrl.acquire("orders", "o-1").await.unwrap(),
            AcquireOutcome::Immediate
        );
        // Second acquisition never sees a release, so it must override.
        let outcome = ctrl.acquire("orders", "o-1").await.unwrap();
        assert_eq!(outcome, AcquireOutcome::ForcedOverride);

        let body = notices.recv().await.unwrap();
        let notice: TimeoutNotice = serde_json::from_str(&body).unwrap();
        assert_eq!(
            notice,
            TimeoutNotice {
                table: "orders".to_string(),
                identifier: "o-1".to_string()
            }
        );
        assert!(notices.try_recv().is_err(), "only one notice per timeout");

        // The override left the record held by the new owner.
        assert_eq!(kv.get("op-clearance-orders-o-1"), Some("busy".to_string()));
    }

    #[tokio::test]
    async fn test_opted_out_request_skips_clearance() {
        let kv = Arc::new(MemoryKvStore::new());
        let ctrl = controller(kv.clone(), Arc::new(MemoryPubSub::new()));
        let ctx = RequestContext::new(false);

        let outcome = ctrl.acquire_for(&ctx, "orders", "o-1").await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Skipped);
        assert!(kv.get("op-clearance-orders-o-1").is_none());
        assert!(!ctx.is_tracking("orders", "o-1"));
    }

    #[tokio::test]
    async fn test_acquire_for_tracks_and_defers() {
        let kv = Arc::new(MemoryKvStore::new());
        let ctrl = controller(kv.clone(), Arc::new(MemoryPubSub::new()));
        let ctx = RequestContext::new(true);

        ctrl.acquire_for(&ctx, "orders", "o-1").await.unwrap();
        ctrl.acquire_for(&ctx, "users", "u-9").await.unwrap();
        assert!(ctx.is_tracking("orders", "o-1"));
        assert!(ctx.is_tracking("users", "u-9"));
        assert!(kv.get("op-clearance-orders-o-1").is_some());
        assert!(kv.get("op-clearance-users-u-9").is_some());

        ctrl.flush_releases(&ctx).await;
        assert!(kv.get("op-clearance-orders-o-1").is_none());
        assert!(kv.get("op-clearance-users-u-9").is_none());
        assert!(!ctx.is_tracking("orders", "o-1"));

        // A second flush has nothing left to do.
        ctrl.flush_releases(&ctx).await;
    }

    #[tokio::test]
    async fn test_release_allows_reacquisition() {
        let kv = Arc::new(MemoryKvStore::new());
        let ctrl = controller(kv, Arc::new(MemoryPubSub::new()));

        ctrl.acquire("orders", "o-1").await.unwrap();
        ctrl.release("orders", "o-1").await.unwrap();
        assert_eq!(
            ctrl.acquire("orders", "o-1").await.unwrap(),
            AcquireOutcome::Immediate
        );
    }
}
