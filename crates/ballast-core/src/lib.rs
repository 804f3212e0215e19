// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ballast Core - Reliability Coordination Layer
//!
//! This crate sits between request handlers and external backends (database,
//! KV store, file store, pub/sub) and guarantees that side-effecting
//! operations eventually execute, that concurrent operations on the same
//! logical resource are serialized, and that duplicated messages are
//! delivered once.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Request Handlers                             │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      RequestProcessor                               │
//! │        (worker dispatch, interruptible wait, end-of-request         │
//! │                 clearance + delivery flush)                         │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                      │                       │
//!          ▼                      ▼                       ▼
//! ┌─────────────────┐  ┌───────────────────┐  ┌──────────────────────┐
//! │ ClearanceCtrl   │  │  DeliveryEnsurer  │  │  ProcessorRegistry   │
//! │ (KV lock +      │  │  (retry →         │  │  (timeout-notice     │
//! │  force override)│  │   broadcast →     │  │   fan-out)           │
//! │                 │  │   ledger)         │  │                      │
//! └─────────────────┘  └───────────────────┘  └──────────────────────┘
//!          │                      │                       ▲
//!          ▼                      ▼                       │
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │              Pub/Sub (branch-scoped topics, UniquePubSub)           │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Coordination Pieces
//!
//! | Piece | Guarantee |
//! |-------|-----------|
//! | [`delivery::DeliveryEnsurer`] | At-least-once execution of enqueued actions: local retries, cluster broadcast hand-off, failed-operation ledger |
//! | [`clearance::ClearanceController`] | Cross-process mutual exclusion per `(table, identifier)` pair, with a bounded-wait force override |
//! | [`processor::RequestProcessor`] | First-writer-wins result slot; cluster timeout notices interrupt waits |
//! | [`dedup::UniquePubSub`] | At-most-once publish and delivery per tagged message via KV check-and-set |
//! | [`failover::FailoverGuard`] | Single-flight connection recovery with consecutive-probe confirmation |
//! | [`router::ActionRouter`] | Branch-scoped topic naming and native message shape normalization |
//!
//! Delivery is at-least-once and dedup is at-most-once per token; combined
//! (publishing actions through a [`dedup::UniquePubSub`]) they approximate
//! exactly-once hand-off, as long as the executed mutations stay idempotent.
//!
//! # Wiring
//!
//! Everything hangs off a [`context::CoreContext`], built explicitly with
//! the backend handles:
//!
//! ```no_run
//! use std::sync::Arc;
//! use ballast_core::backends::{MemoryDatabase, MemoryFileStore, MemoryKvStore, MemoryPubSub};
//! use ballast_core::config::Config;
//! use ballast_core::context::CoreContext;
//!
//! # async fn wire() -> anyhow::Result<()> {
//! let context = CoreContext::builder()
//!     .config(Config::for_service("orders", "main"))
//!     .kv(Arc::new(MemoryKvStore::new()))
//!     .database(Arc::new(MemoryDatabase::new()))
//!     .file_store(Arc::new(MemoryFileStore::new()))
//!     .pubsub(Arc::new(MemoryPubSub::new()))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let request = context.begin_request(false);
//! let result = context
//!     .processor()
//!     .process_request(request, |_ctx| async { Ok("done".to_string()) })
//!     .await;
//! context.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod action;
pub mod backends;
pub mod clearance;
pub mod config;
pub mod context;
pub mod dedup;
pub mod delivery;
pub mod error;
pub mod failover;
pub mod processor;
pub mod router;

pub use action::{Action, ActionKind};
pub use config::Config;
pub use context::{CoreContext, RequestContext};
pub use error::{BallastError, Result};
