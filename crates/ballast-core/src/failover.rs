// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-flight connection recovery shared by backend clients.
//!
//! When a KV or pub/sub connection drops, every caller that notices
//! reports it here; exactly one task per process runs the recovery probe
//! loop while the rest (and all regular traffic) wait for the failing
//! state to clear. Recovery probes are the only backend traffic allowed
//! during the outage.
//!
//! Co-hosted process instances of the same service cooperate too: probe
//! loops are serialized through an advisory lock file keyed by service and
//! branch, so a host never probes a struggling backend from two processes
//! at once. Separate hosts recover independently, each probing its own
//! connections, which is safe because probes are idempotent.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fs4::fs_std::FileExt;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::config::Config;

/// Shared recovery state for one backend connection class.
pub struct FailoverGuard {
    failover_id: AtomicU64,
    recovery_lock: Mutex<()>,
    lock_path: PathBuf,
    failing_tx: watch::Sender<bool>,
    initial_backoff: Duration,
    probe_interval: Duration,
    required_probes: u32,
}

impl FailoverGuard {
    /// Create a guard with the configured backoff and probe cadence.
    pub fn new(config: &Config) -> Self {
        let (failing_tx, _) = watch::channel(false);
        Self {
            failover_id: AtomicU64::new(0),
            recovery_lock: Mutex::new(()),
            lock_path: std::env::temp_dir().join(format!(
                "ballast-failover-{}-{}.lock",
                config.service_name, config.deploy_branch
            )),
            failing_tx,
            initial_backoff: config.failover_initial_backoff,
            probe_interval: config.failover_probe_interval,
            required_probes: config.failover_probe_successes,
        }
    }

    /// The current failover generation. Advances once per recovery.
    pub fn failover_id(&self) -> u64 {
        self.failover_id.load(Ordering::SeqCst)
    }

    /// Whether the guard is currently in the failing state.
    pub fn is_failing(&self) -> bool {
        *self.failing_tx.borrow()
    }

    /// Block until the guard is healthy.
    ///
    /// Callers about to use the connection call this first; it resolves
    /// immediately outside an outage. It never touches the backend itself,
    /// so waiting traffic cannot pile onto a struggling connection.
    pub async fn failover_check(&self) {
        let mut rx = self.failing_tx.subscribe();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Report a dropped connection and, if first, run recovery.
    ///
    /// `probe` performs one lightweight write against the backend and
    /// reports whether it succeeded. The caller that wins the single-flight
    /// race backs off, takes the host-wide recovery lock, then probes until
    /// [`Config::failover_probe_successes`] consecutive probes succeed;
    /// every other caller parks on the recovery lock and returns once
    /// recovery is done (its captured generation has advanced by then).
    pub async fn on_failover_detected<P, Fut>(&self, probe: P)
    where
        P: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let observed = self.failover_id.load(Ordering::SeqCst);
        let _guard = self.recovery_lock.lock().await;

        if self.failover_id.load(Ordering::SeqCst) != observed {
            debug!(
                observed,
                current = self.failover_id(),
                "failover already handled by another caller"
            );
            return;
        }

        self.failover_id.fetch_add(1, Ordering::SeqCst);
        let _ = self.failing_tx.send(true);
        warn!(
            failover_id = self.failover_id(),
            backoff_secs = self.initial_backoff.as_secs_f64(),
            "connection failover detected, entering failing state"
        );

        tokio::time::sleep(self.initial_backoff).await;

        let host_lock = self.acquire_host_lock().await;

        let mut consecutive = 0u32;
        while consecutive < self.required_probes {
            if probe().await {
                consecutive += 1;
                debug!(consecutive, required = self.required_probes, "recovery probe succeeded");
            } else {
                if consecutive > 0 {
                    debug!("recovery probe failed, resetting streak");
                }
                consecutive = 0;
            }
            tokio::time::sleep(self.probe_interval).await;
        }

        if let Some(file) = host_lock {
            if let Err(e) = FileExt::unlock(&file) {
                debug!(error = %e, "failed to unlock recovery lock file");
            }
        }
        let _ = self.failing_tx.send(false);
        info!(failover_id = self.failover_id(), "backend recovered, leaving failing state");
    }

    /// Take the host-wide recovery lock shared by every process instance
    /// of this service and branch.
    ///
    /// Polls the advisory file lock once per probe interval. If the lock
    /// file cannot be opened or locked at all, recovery proceeds without
    /// cross-process serialization rather than stalling forever.
    async fn acquire_host_lock(&self) -> Option<File> {
        let file = match OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
        {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    path = %self.lock_path.display(),
                    error = %e,
                    "cannot open recovery lock file, probing unserialized"
                );
                return None;
            }
        };
        loop {
            match file.try_lock_exclusive() {
                Ok(true) => return Some(file),
                Ok(false) => {
                    debug!(
                        path = %self.lock_path.display(),
                        "another process instance is recovering, waiting"
                    );
                    tokio::time::sleep(self.probe_interval).await;
                }
                Err(e) => {
                    warn!(
                        path = %self.lock_path.display(),
                        error = %e,
                        "recovery lock failed, probing unserialized"
                    );
                    return None;
                }
            }
        }
    }
}

impl std::fmt::Debug for FailoverGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverGuard")
            .field("failover_id", &self.failover_id())
            .field("failing", &self.is_failing())
            .finish_non_exhaustive()
    }
}
