// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The closed set of side-effecting actions the delivery ensurer executes.
//!
//! Actions are value objects: immutable once constructed except for
//! `RetryCount`, which is the sole cross-process retry budget and must
//! round-trip through serialization with the rest of the payload. The
//! `QueryType` discriminator is encoded as an internal tag so decoders read
//! it before interpreting the remaining fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BallastError, Result};

/// A side-effecting operation against the database or file store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "QueryType", rename_all_fields = "PascalCase")]
pub enum Action {
    /// Delete a single file from the blob store.
    FsDeleteFile {
        /// Cross-process retry budget tracker.
        retry_count: u32,
        /// Bucket holding the file.
        bucket: String,
        /// Object key of the file.
        key: String,
    },

    /// Delete every file under a prefix in the blob store.
    FsDeleteFolder {
        /// Cross-process retry budget tracker.
        retry_count: u32,
        /// Bucket holding the folder.
        bucket: String,
        /// Key prefix identifying the folder.
        prefix: String,
    },

    /// Merge changes into a database item.
    DbUpdateItem {
        /// Cross-process retry budget tracker.
        retry_count: u32,
        /// Target table.
        table: String,
        /// Name of the primary-key attribute.
        key_name: String,
        /// Value of the primary key.
        key_value: String,
        /// Attribute changes to merge.
        changes: Value,
    },

    /// Insert or replace a database item.
    DbPutItem {
        /// Cross-process retry budget tracker.
        retry_count: u32,
        /// Target table.
        table: String,
        /// Name of the primary-key attribute.
        key_name: String,
        /// Value of the primary key.
        key_value: String,
        /// The full item payload.
        item: Value,
    },

    /// Delete a database item.
    DbDeleteItem {
        /// Cross-process retry budget tracker.
        retry_count: u32,
        /// Target table.
        table: String,
        /// Name of the primary-key attribute.
        key_name: String,
        /// Value of the primary key.
        key_value: String,
    },

    /// Append elements to an array attribute of a database item.
    DbAddArrayElements {
        /// Cross-process retry budget tracker.
        retry_count: u32,
        /// Target table.
        table: String,
        /// Name of the primary-key attribute.
        key_name: String,
        /// Value of the primary key.
        key_value: String,
        /// Name of the array attribute.
        array_name: String,
        /// Elements to append.
        elements: Vec<Value>,
    },

    /// Remove matching elements from an array attribute of a database item.
    DbRemoveArrayElements {
        /// Cross-process retry budget tracker.
        retry_count: u32,
        /// Target table.
        table: String,
        /// Name of the primary-key attribute.
        key_name: String,
        /// Value of the primary key.
        key_value: String,
        /// Name of the array attribute.
        array_name: String,
        /// Elements to remove.
        elements: Vec<Value>,
    },
}

impl Action {
    /// The logical kind of this action.
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::FsDeleteFile { .. } => ActionKind::FsDeleteFile,
            Self::FsDeleteFolder { .. } => ActionKind::FsDeleteFolder,
            Self::DbUpdateItem { .. } => ActionKind::DbUpdateItem,
            Self::DbPutItem { .. } => ActionKind::DbPutItem,
            Self::DbDeleteItem { .. } => ActionKind::DbDeleteItem,
            Self::DbAddArrayElements { .. } => ActionKind::DbAddArrayElements,
            Self::DbRemoveArrayElements { .. } => ActionKind::DbRemoveArrayElements,
        }
    }

    /// Current retry count.
    pub fn retry_count(&self) -> u32 {
        match self {
            Self::FsDeleteFile { retry_count, .. }
            | Self::FsDeleteFolder { retry_count, .. }
            | Self::DbUpdateItem { retry_count, .. }
            | Self::DbPutItem { retry_count, .. }
            | Self::DbDeleteItem { retry_count, .. }
            | Self::DbAddArrayElements { retry_count, .. }
            | Self::DbRemoveArrayElements { retry_count, .. } => *retry_count,
        }
    }

    /// Set the retry count. Only the delivery-ensurer engine mutates this.
    pub fn set_retry_count(&mut self, count: u32) {
        match self {
            Self::FsDeleteFile { retry_count, .. }
            | Self::FsDeleteFolder { retry_count, .. }
            | Self::DbUpdateItem { retry_count, .. }
            | Self::DbPutItem { retry_count, .. }
            | Self::DbDeleteItem { retry_count, .. }
            | Self::DbAddArrayElements { retry_count, .. }
            | Self::DbRemoveArrayElements { retry_count, .. } => *retry_count = count,
        }
    }

    /// Serialize for the wire or the ledger.
    pub fn to_wire(&self) -> Result<String> {
        serde_json::to_string(self).map_err(BallastError::from)
    }

    /// Deserialize from the wire.
    pub fn from_wire(serialized: &str) -> Result<Self> {
        serde_json::from_str(serialized).map_err(BallastError::from)
    }
}

/// Logical message kinds routed over the pub/sub transport.
///
/// The seven action kinds mirror the [`Action`] variants; the two storage
/// kinds cover the file store's native event notifications, which arrive in
/// a different shape and never carry a `QueryType` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Delete-file action.
    FsDeleteFile,
    /// Delete-folder action.
    FsDeleteFolder,
    /// Update-item action.
    DbUpdateItem,
    /// Put-item action.
    DbPutItem,
    /// Delete-item action.
    DbDeleteItem,
    /// Add-array-elements action.
    DbAddArrayElements,
    /// Remove-array-elements action.
    DbRemoveArrayElements,
    /// A file appeared in the file store (native notification).
    StorageFileUploaded,
    /// A file disappeared from the file store (native notification).
    StorageFileDeleted,
}

impl ActionKind {
    /// The seven kinds that carry a serialized [`Action`].
    pub const ACTION_KINDS: [ActionKind; 7] = [
        ActionKind::FsDeleteFile,
        ActionKind::FsDeleteFolder,
        ActionKind::DbUpdateItem,
        ActionKind::DbPutItem,
        ActionKind::DbDeleteItem,
        ActionKind::DbAddArrayElements,
        ActionKind::DbRemoveArrayElements,
    ];

    /// Stable name, identical to the `QueryType` discriminator for the
    /// action kinds.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FsDeleteFile => "FsDeleteFile",
            Self::FsDeleteFolder => "FsDeleteFolder",
            Self::DbUpdateItem => "DbUpdateItem",
            Self::DbPutItem => "DbPutItem",
            Self::DbDeleteItem => "DbDeleteItem",
            Self::DbAddArrayElements => "DbAddArrayElements",
            Self::DbRemoveArrayElements => "DbRemoveArrayElements",
            Self::StorageFileUploaded => "StorageFileUploaded",
            Self::StorageFileDeleted => "StorageFileDeleted",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
