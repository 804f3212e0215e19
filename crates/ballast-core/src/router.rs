// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Maps logical action kinds to physical topics and decodes inbound
//! messages.
//!
//! Topic names carry the deployment branch identifier so staging and
//! production deployments of the same service never consume each other's
//! traffic. Inbound messages arrive either as this system's own envelope
//! or in one of two native-provider shapes (a base64 `message.data` field,
//! or a CloudEvents-style `data` field); both are normalized before the
//! discriminator is read. The file store's native event notifications have
//! no discriminator at all and are recognized structurally.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{Action, ActionKind};
use crate::error::{BallastError, Result};

/// The pub/sub envelope published by this system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Physical topic name, doubling as the kind discriminator.
    #[serde(rename = "actionType")]
    pub action_type: String,
    /// The serialized [`Action`], still encoded.
    #[serde(rename = "serializedAction")]
    pub serialized_action: String,
}

/// A successfully decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// The logical kind of the message.
    pub kind: ActionKind,
    /// The still-serialized payload: a serialized [`Action`] for the seven
    /// action kinds, the raw notification record for the storage kinds.
    pub payload: String,
}

/// Maps kinds to topics and normalizes/decodes inbound messages.
#[derive(Debug, Clone)]
pub struct ActionRouter {
    deploy_branch: String,
}

impl ActionRouter {
    /// Create a router for the given deployment branch.
    pub fn new(deploy_branch: &str) -> Self {
        Self {
            deploy_branch: deploy_branch.to_string(),
        }
    }

    /// Physical topic name for a logical kind.
    pub fn topic_for(&self, kind: ActionKind) -> String {
        format!("{}-{}", kind.as_str(), self.deploy_branch)
    }

    /// Topic carrying operation-timeout notices for this deployment.
    pub fn timeout_topic(&self) -> String {
        format!("OperationTimeout-{}", self.deploy_branch)
    }

    /// Wrap an action in the envelope, returning `(topic, body)`.
    pub fn encode(&self, action: &Action) -> Result<(String, String)> {
        let topic = self.topic_for(action.kind());
        let envelope = Envelope {
            action_type: topic.clone(),
            serialized_action: action.to_wire()?,
        };
        let body = serde_json::to_string(&envelope)?;
        Ok((topic, body))
    }

    /// Decode a raw inbound message into its logical kind and payload.
    ///
    /// The caller always learns whether decoding succeeded before touching
    /// the payload; malformed messages are reported, never dropped.
    pub fn decode(&self, raw: &str) -> Result<Decoded> {
        let normalized = self.normalize(raw)?;
        let value: Value =
            serde_json::from_str(&normalized).map_err(|e| BallastError::DecodeFailed {
                details: format!("message body is not JSON: {}", e),
            })?;

        // Our own envelope, discriminator first.
        if let (Some(action_type), Some(serialized_action)) = (
            value.get("actionType").and_then(Value::as_str),
            value.get("serializedAction").and_then(Value::as_str),
        ) {
            let kind = self.kind_for_topic(action_type)?;
            return Ok(Decoded {
                kind,
                payload: serialized_action.to_string(),
            });
        }

        // Native file-store event notification: no discriminator, but the
        // record shape (bucket + name) is recognizable.
        if value.get("bucket").and_then(Value::as_str).is_some()
            && value.get("name").and_then(Value::as_str).is_some()
        {
            let event_type = value
                .get("eventType")
                .and_then(Value::as_str)
                .unwrap_or("OBJECT_FINALIZE");
            let kind = if event_type.contains("DELETE") {
                ActionKind::StorageFileDeleted
            } else {
                ActionKind::StorageFileUploaded
            };
            return Ok(Decoded {
                kind,
                payload: normalized,
            });
        }

        Err(BallastError::DecodeFailed {
            details: "message matches neither the envelope nor a storage notification".to_string(),
        })
    }

    /// Strip provider framing, returning the serialized envelope (or record).
    ///
    /// Recognized shapes, in order: `{"message": {"data": <base64>}}`,
    /// CloudEvents `{"data": <object or base64 string>}`. Anything else is
    /// treated as the raw body itself.
    fn normalize(&self, raw: &str) -> Result<String> {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return Ok(raw.to_string());
        };

        if let Some(data) = value.get("message").and_then(|m| m.get("data")) {
            let encoded = data.as_str().ok_or_else(|| BallastError::DecodeFailed {
                details: "message.data is not a string".to_string(),
            })?;
            return decode_base64(encoded);
        }

        if let Some(data) = value.get("data") {
            return match data {
                Value::String(encoded) => decode_base64(encoded),
                Value::Object(_) => Ok(data.to_string()),
                _ => Err(BallastError::DecodeFailed {
                    details: "data field is neither an object nor a base64 string".to_string(),
                }),
            };
        }

        Ok(raw.to_string())
    }

    /// Resolve an `actionType` value back to a logical kind.
    ///
    /// Accepts both the branch-suffixed topic form and the bare kind name
    /// so envelopes survive being re-published by tooling that only knows
    /// the kind.
    fn kind_for_topic(&self, action_type: &str) -> Result<ActionKind> {
        let all = [
            ActionKind::FsDeleteFile,
            ActionKind::FsDeleteFolder,
            ActionKind::DbUpdateItem,
            ActionKind::DbPutItem,
            ActionKind::DbDeleteItem,
            ActionKind::DbAddArrayElements,
            ActionKind::DbRemoveArrayElements,
            ActionKind::StorageFileUploaded,
            ActionKind::StorageFileDeleted,
        ];
        for kind in all {
            if action_type == self.topic_for(kind) || action_type == kind.as_str() {
                return Ok(kind);
            }
        }
        Err(BallastError::UnknownActionType {
            action_type: action_type.to_string(),
        })
    }
}

fn decode_base64(encoded: &str) -> Result<String> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| BallastError::DecodeFailed {
            details: format!("invalid base64 payload: {}", e),
        })?;
    String::from_utf8(bytes).map_err(|e| BallastError::DecodeFailed {
        details: format!("payload is not UTF-8: {}", e),
    })
}
