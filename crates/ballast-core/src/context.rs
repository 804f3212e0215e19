// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application-scoped wiring and per-request state.
//!
//! [`CoreContext`] replaces the global singletons of older designs: it is
//! constructed explicitly with the backend handles, wires the cluster
//! subscriptions as background tasks on [`start`](CoreContextConfig::start),
//! and tears them down on [`shutdown`](CoreContext::shutdown).

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{Action, ActionKind};
use crate::backends::{Database, FileStore, KvStore, PubSub};
use crate::clearance::{ClearanceController, TimeoutNotice};
use crate::config::Config;
use crate::delivery::DeliveryEnsurer;
use crate::failover::FailoverGuard;
use crate::processor::{ProcessorRegistry, RequestProcessor};
use crate::router::ActionRouter;

/// Per-request identity and coordination state.
///
/// Created once per inbound request; the clearance-tracking flag comes
/// from transport metadata (`do-not-get-db-clearance` disables it) and is
/// fixed for the request's lifetime.
#[derive(Debug)]
pub struct RequestContext {
    request_id: Uuid,
    clearance_tracking: bool,
    tracked: StdMutex<HashSet<(String, String)>>,
    deferred_releases: StdMutex<HashSet<(String, String)>>,
}

impl RequestContext {
    /// Create a fresh request context.
    pub fn new(clearance_tracking: bool) -> Arc<Self> {
        Arc::new(Self {
            request_id: Uuid::new_v4(),
            clearance_tracking,
            tracked: StdMutex::new(HashSet::new()),
            deferred_releases: StdMutex::new(HashSet::new()),
        })
    }

    /// This request's identity; keys its delivery queue.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Whether clearance acquisition/release applies to this request.
    pub fn clearance_tracking(&self) -> bool {
        self.clearance_tracking
    }

    /// Whether this request is tracking the given clearance pair.
    pub fn is_tracking(&self, table: &str, identifier: &str) -> bool {
        self.tracked
            .lock()
            .expect("tracked set poisoned")
            .contains(&(table.to_string(), identifier.to_string()))
    }

    pub(crate) fn track_pair(&self, table: &str, identifier: &str) {
        self.tracked
            .lock()
            .expect("tracked set poisoned")
            .insert((table.to_string(), identifier.to_string()));
    }

    pub(crate) fn untrack_pair(&self, table: &str, identifier: &str) {
        self.tracked
            .lock()
            .expect("tracked set poisoned")
            .remove(&(table.to_string(), identifier.to_string()));
    }

    pub(crate) fn defer_release(&self, table: &str, identifier: &str) {
        self.deferred_releases
            .lock()
            .expect("deferred set poisoned")
            .insert((table.to_string(), identifier.to_string()));
    }

    pub(crate) fn take_deferred_releases(&self) -> Vec<(String, String)> {
        self.deferred_releases
            .lock()
            .expect("deferred set poisoned")
            .drain()
            .collect()
    }
}

/// Builder for a [`CoreContext`].
#[derive(Default)]
pub struct CoreContextBuilder {
    config: Option<Config>,
    kv: Option<Arc<dyn KvStore>>,
    database: Option<Arc<dyn Database>>,
    file_store: Option<Arc<dyn FileStore>>,
    pubsub: Option<Arc<dyn PubSub>>,
}

impl std::fmt::Debug for CoreContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContextBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CoreContextBuilder {
    /// Create a builder with nothing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the KV store backend (required).
    pub fn kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Set the database backend (required).
    pub fn database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    /// Set the file-store backend (required).
    pub fn file_store(mut self, file_store: Arc<dyn FileStore>) -> Self {
        self.file_store = Some(file_store);
        self
    }

    /// Set the pub/sub backend (required).
    pub fn pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Assemble the context configuration.
    ///
    /// Returns an error if a required piece is missing.
    pub fn build(self) -> Result<CoreContextConfig> {
        Ok(CoreContextConfig {
            config: self.config.ok_or_else(|| anyhow::anyhow!("config is required"))?,
            kv: self.kv.ok_or_else(|| anyhow::anyhow!("kv store is required"))?,
            database: self
                .database
                .ok_or_else(|| anyhow::anyhow!("database is required"))?,
            file_store: self
                .file_store
                .ok_or_else(|| anyhow::anyhow!("file store is required"))?,
            pubsub: self
                .pubsub
                .ok_or_else(|| anyhow::anyhow!("pubsub is required"))?,
        })
    }
}

/// A built but not yet started context.
pub struct CoreContextConfig {
    config: Config,
    kv: Arc<dyn KvStore>,
    database: Arc<dyn Database>,
    file_store: Arc<dyn FileStore>,
    pubsub: Arc<dyn PubSub>,
}

impl std::fmt::Debug for CoreContextConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContextConfig")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CoreContextConfig {
    /// Start the context: construct the coordination pieces and wire the
    /// action-broadcast and timeout-notice subscriptions as background
    /// tasks.
    pub async fn start(self) -> Result<CoreContext> {
        let router = ActionRouter::new(&self.config.deploy_branch);
        let clearance = Arc::new(ClearanceController::new(
            self.kv.clone(),
            self.pubsub.clone(),
            &router,
            &self.config,
        ));
        let delivery = Arc::new(DeliveryEnsurer::new(
            self.database.clone(),
            self.file_store.clone(),
            self.pubsub.clone(),
            router.clone(),
            &self.config,
        ));
        let registry = Arc::new(ProcessorRegistry::new());
        let failover = Arc::new(FailoverGuard::new(&self.config));

        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = Vec::new();

        // One consumer per action topic: any instance may pick up a
        // broadcast hand-off, including the one that published it.
        for kind in ActionKind::ACTION_KINDS {
            let topic = router.topic_for(kind);
            let rx = self.pubsub.subscribe(&topic).await?;
            tasks.push(tokio::spawn(run_action_consumer(
                topic,
                rx,
                router.clone(),
                delivery.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        // Timeout notices fan in to the processor registry.
        let timeout_topic = router.timeout_topic();
        let rx = self.pubsub.subscribe(&timeout_topic).await?;
        tasks.push(tokio::spawn(run_notice_consumer(
            timeout_topic,
            rx,
            registry.clone(),
            shutdown_tx.subscribe(),
        )));

        info!(
            service = %self.config.service_name,
            branch = %self.config.deploy_branch,
            "ballast core context started"
        );

        Ok(CoreContext {
            config: self.config,
            kv: self.kv,
            database: self.database,
            file_store: self.file_store,
            pubsub: self.pubsub,
            router,
            clearance,
            delivery,
            registry,
            failover,
            shutdown_tx,
            tasks,
        })
    }
}

/// The running application-scoped context.
pub struct CoreContext {
    /// The configuration the context was started with.
    pub config: Config,
    kv: Arc<dyn KvStore>,
    database: Arc<dyn Database>,
    file_store: Arc<dyn FileStore>,
    pubsub: Arc<dyn PubSub>,
    router: ActionRouter,
    clearance: Arc<ClearanceController>,
    delivery: Arc<DeliveryEnsurer>,
    registry: Arc<ProcessorRegistry>,
    failover: Arc<FailoverGuard>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CoreContext {
    /// Create a new builder.
    pub fn builder() -> CoreContextBuilder {
        CoreContextBuilder::new()
    }

    /// The topic router for this deployment.
    pub fn router(&self) -> &ActionRouter {
        &self.router
    }

    /// The clearance controller.
    pub fn clearance(&self) -> &Arc<ClearanceController> {
        &self.clearance
    }

    /// The delivery ensurer.
    pub fn delivery(&self) -> &Arc<DeliveryEnsurer> {
        &self.delivery
    }

    /// The processor registry.
    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    /// The connection failover guard shared by backend clients.
    pub fn failover(&self) -> &Arc<FailoverGuard> {
        &self.failover
    }

    /// The KV store handle.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// The database handle.
    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    /// The file-store handle.
    pub fn file_store(&self) -> &Arc<dyn FileStore> {
        &self.file_store
    }

    /// The pub/sub handle.
    pub fn pubsub(&self) -> &Arc<dyn PubSub> {
        &self.pubsub
    }

    /// Begin a request.
    ///
    /// `do_not_get_db_clearance` is the transport-level opt-out flag;
    /// requests carrying it skip clearance tracking entirely.
    pub fn begin_request(&self, do_not_get_db_clearance: bool) -> Arc<RequestContext> {
        RequestContext::new(!do_not_get_db_clearance)
    }

    /// A request processor over this context's shared pieces.
    pub fn processor(&self) -> RequestProcessor {
        RequestProcessor::new(
            self.registry.clone(),
            self.clearance.clone(),
            self.delivery.clone(),
        )
    }

    /// Stop the background consumers and wait for them to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("ballast core context shutting down...");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("consumer task panicked during shutdown: {}", e);
            }
        }
        info!("ballast core context shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("config", &self.config)
            .field("consumers", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

/// Consume one action topic, decoding and executing broadcast hand-offs.
async fn run_action_consumer(
    topic: String,
    mut rx: tokio::sync::mpsc::Receiver<String>,
    router: ActionRouter,
    delivery: Arc<DeliveryEnsurer>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(topic, "action consumer received shutdown signal");
                    break;
                }
            }

            raw = rx.recv() => {
                let Some(raw) = raw else { break };
                match router.decode(&raw) {
                    Ok(decoded) if ActionKind::ACTION_KINDS.contains(&decoded.kind) => {
                        match Action::from_wire(&decoded.payload) {
                            Ok(action) => {
                                if let Err(e) = delivery.on_broadcast_received(action).await {
                                    warn!(topic, error = %e, "broadcast action exhausted its retry budget");
                                }
                            }
                            Err(e) => warn!(topic, error = %e, "broadcast payload failed to decode"),
                        }
                    }
                    Ok(decoded) => {
                        // Native storage notifications are routed, not executed.
                        debug!(topic, kind = %decoded.kind, "storage event observed");
                    }
                    Err(e) => warn!(topic, error = %e, "inbound message failed to decode"),
                }
            }
        }
    }
    debug!(topic, "action consumer stopped");
}

/// Consume the timeout-notice topic, fanning notices into the registry.
async fn run_notice_consumer(
    topic: String,
    mut rx: tokio::sync::mpsc::Receiver<String>,
    registry: Arc<ProcessorRegistry>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(topic, "notice consumer received shutdown signal");
                    break;
                }
            }

            raw = rx.recv() => {
                let Some(raw) = raw else { break };
                match serde_json::from_str::<TimeoutNotice>(&raw) {
                    Ok(notice) => registry.on_timeout_notice(&notice),
                    Err(e) => warn!(topic, error = %e, "malformed timeout notice"),
                }
            }
        }
    }
    debug!(topic, "notice consumer stopped");
}
