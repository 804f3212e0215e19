// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Makes at-least-once pub/sub delivery look at-most-once to subscribers.
//!
//! Publishers prepend a timestamp-derived token to every message body;
//! both the publish side and the subscribe side run a check-and-set
//! against the shared KV store, so across all cooperating processes
//! exactly one publish and exactly one delivery win per token. Eviction of
//! seen tokens (the bounded dedup window) is the KV backend's concern.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backends::{KvStore, PubSub};
use crate::error::{BallastError, Result};

/// Separator between the dedup token and the message body on the wire.
const TOKEN_SEPARATOR: char = '|';

/// Buffer size for deduplicated subscriber channels.
const SUBSCRIBER_BUFFER: usize = 64;

/// Disambiguates tokens generated within the same clock reading.
static TOKEN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Token bookkeeping against the shared KV store.
#[derive(Clone)]
pub struct UniqueDelivery {
    kv: Arc<dyn KvStore>,
}

impl UniqueDelivery {
    /// Create a dedup layer over the given KV store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Tag a message body with a fresh token.
    ///
    /// Returns the tagged body and the token for the publish-side
    /// uniqueness check.
    pub fn prepare_publish(&self, body: &str) -> (String, String) {
        let token = generate_token();
        let tagged = format!("{}{}{}", token, TOKEN_SEPARATOR, body);
        (tagged, token)
    }

    /// Publish-side check-and-set.
    ///
    /// Returns `true` if this process is the first to publish this token
    /// on this topic and the send may proceed; `false` means a sibling
    /// already sent an equivalent message and the caller must not
    /// double-publish.
    pub async fn confirm_publish(&self, topic: &str, token: &str) -> Result<bool> {
        self.kv
            .set_if_absent(&format!("dedup-pub-{}-{}", topic, token), "1")
            .await
    }

    /// Split the token back off a received body.
    pub fn extract_on_receive(&self, body: &str) -> Result<(String, String)> {
        match body.split_once(TOKEN_SEPARATOR) {
            Some((token, clean)) => Ok((clean.to_string(), token.to_string())),
            None => Err(BallastError::DecodeFailed {
                details: "message body carries no dedup token".to_string(),
            }),
        }
    }

    /// Subscribe-side check-and-set.
    ///
    /// Returns `true` for exactly one receiver per token across every
    /// instance subscribed to the same logical topic; duplicates get
    /// `false` and must be absorbed silently.
    pub async fn confirm_delivery(&self, topic: &str, token: &str) -> Result<bool> {
        self.kv
            .set_if_absent(&format!("dedup-sub-{}-{}", topic, token), "1")
            .await
    }
}

impl std::fmt::Debug for UniqueDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniqueDelivery").finish_non_exhaustive()
    }
}

/// Hash of the current high-resolution timestamp plus an in-process
/// sequence number. Collision avoidance, not strict ordering.
fn generate_token() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = TOKEN_SEQUENCE.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(nanos.to_be_bytes());
    hasher.update(seq.to_be_bytes());
    let digest = hasher.finalize();

    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// A [`PubSub`] decorator applying dedup on both sides of the transport.
///
/// Wrapping any transport in this makes its delivery effectively-once as
/// seen by application callbacks, at the cost of one KV round trip per
/// publish and per receive.
pub struct UniquePubSub {
    inner: Arc<dyn PubSub>,
    dedup: UniqueDelivery,
}

impl UniquePubSub {
    /// Wrap a transport, deduplicating against the given KV store.
    pub fn new(inner: Arc<dyn PubSub>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            inner,
            dedup: UniqueDelivery::new(kv),
        }
    }
}

#[async_trait]
impl PubSub for UniquePubSub {
    async fn publish(&self, topic: &str, body: &str) -> Result<()> {
        let (tagged, token) = self.dedup.prepare_publish(body);
        if self.dedup.confirm_publish(topic, &token).await? {
            self.inner.publish(topic, &tagged).await
        } else {
            debug!(topic, token, "sibling already published this token, skipping");
            Ok(())
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>> {
        let mut inner_rx = self.inner.subscribe(topic).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let dedup = self.dedup.clone();
        let topic = topic.to_string();

        tokio::spawn(async move {
            while let Some(raw) = inner_rx.recv().await {
                let (clean, token) = match dedup.extract_on_receive(&raw) {
                    Ok(parts) => parts,
                    Err(e) => {
                        warn!(topic, error = %e, "dropping untagged message");
                        continue;
                    }
                };
                match dedup.confirm_delivery(&topic, &token).await {
                    Ok(true) => {
                        if tx.send(clean).await.is_err() {
                            break;
                        }
                    }
                    Ok(false) => {
                        debug!(topic, token, "duplicate delivery absorbed");
                    }
                    Err(e) => {
                        warn!(topic, token, error = %e, "dedup check failed, dropping message");
                    }
                }
            }
        });

        Ok(rx)
    }
}
