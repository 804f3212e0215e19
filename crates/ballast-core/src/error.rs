// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ballast-core.
//!
//! Provides a unified error type with stable error codes for logging and
//! cross-process reporting.

use std::fmt;

/// Result type using BallastError
pub type Result<T> = std::result::Result<T, BallastError>;

/// Core errors that can occur while coordinating backend operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum BallastError {
    /// A single call against a backend failed (transient).
    BackendUnavailable {
        /// Which backend failed (kv, database, file-store, pubsub).
        backend: String,
        /// Error details from the backend client.
        details: String,
    },

    /// An action exhausted its local and broadcast retry budget.
    RetriesExhausted {
        /// The action discriminator.
        query_type: String,
        /// The retry count at the moment of exhaustion.
        retry_count: u32,
    },

    /// A request's wait was abandoned because a clearance timeout notice
    /// matched one of its tracked pairs.
    OperationTimedOut {
        /// The table of the clearance pair.
        table: String,
        /// The identifier of the clearance pair.
        identifier: String,
    },

    /// An inbound message could not be decoded.
    DecodeFailed {
        /// What went wrong while decoding.
        details: String,
    },

    /// The message discriminator named an action type this deployment
    /// does not know.
    UnknownActionType {
        /// The unrecognized discriminator value.
        action_type: String,
    },

    /// A request handler panicked before supplying a result.
    HandlerFailed {
        /// Details from the join error.
        details: String,
    },

    /// Publishing a message failed after all bounded retries.
    PublishFailed {
        /// The topic the publish targeted.
        topic: String,
        /// How many attempts were made.
        attempts: u32,
        /// Error details from the last attempt.
        details: String,
    },

    /// Writing to the failed-operation ledger failed. The serialized
    /// action is carried verbatim so it is never lost from observability.
    LedgerWriteFailed {
        /// The ledger table that rejected the write.
        ledger_table: String,
        /// The serialized action that should have been recorded.
        serialized_action: String,
        /// Error details from the database.
        details: String,
    },
}

impl BallastError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Self::OperationTimedOut { .. } => "OPERATION_TIMED_OUT",
            Self::DecodeFailed { .. } => "DECODE_FAILED",
            Self::UnknownActionType { .. } => "UNKNOWN_ACTION_TYPE",
            Self::HandlerFailed { .. } => "HANDLER_FAILED",
            Self::PublishFailed { .. } => "PUBLISH_FAILED",
            Self::LedgerWriteFailed { .. } => "LEDGER_WRITE_FAILED",
        }
    }

    /// Whether this error is worth retrying at all.
    ///
    /// Decode failures are permanent (the payload is malformed, not
    /// unavailable); everything else is transient or terminal-by-policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

impl fmt::Display for BallastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BackendUnavailable { backend, details } => {
                write!(f, "Backend '{}' unavailable: {}", backend, details)
            }
            Self::RetriesExhausted {
                query_type,
                retry_count,
            } => {
                write!(
                    f,
                    "Action '{}' exhausted retries (retry count {})",
                    query_type, retry_count
                )
            }
            Self::OperationTimedOut { table, identifier } => {
                write!(
                    f,
                    "Internal error: operation timed out for '{}'-'{}'",
                    table, identifier
                )
            }
            Self::DecodeFailed { details } => {
                write!(f, "Failed to decode message: {}", details)
            }
            Self::UnknownActionType { action_type } => {
                write!(f, "Unknown action type '{}'", action_type)
            }
            Self::HandlerFailed { details } => {
                write!(f, "Request handler failed: {}", details)
            }
            Self::PublishFailed {
                topic,
                attempts,
                details,
            } => {
                write!(
                    f,
                    "Failed to publish to '{}' after {} attempts: {}",
                    topic, attempts, details
                )
            }
            Self::LedgerWriteFailed {
                ledger_table,
                serialized_action,
                details,
            } => {
                write!(
                    f,
                    "Failed to write ledger '{}' ({}); unrecorded action: {}",
                    ledger_table, details, serialized_action
                )
            }
        }
    }
}

impl std::error::Error for BallastError {}

impl From<serde_json::Error> for BallastError {
    fn from(err: serde_json::Error) -> Self {
        BallastError::DecodeFailed {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                BallastError::BackendUnavailable {
                    backend: "database".to_string(),
                    details: "connection refused".to_string(),
                },
                "BACKEND_UNAVAILABLE",
            ),
            (
                BallastError::RetriesExhausted {
                    query_type: "DbPutItem".to_string(),
                    retry_count: 6,
                },
                "RETRIES_EXHAUSTED",
            ),
            (
                BallastError::OperationTimedOut {
                    table: "orders".to_string(),
                    identifier: "o-1".to_string(),
                },
                "OPERATION_TIMED_OUT",
            ),
            (
                BallastError::DecodeFailed {
                    details: "not json".to_string(),
                },
                "DECODE_FAILED",
            ),
            (
                BallastError::UnknownActionType {
                    action_type: "DbTruncate".to_string(),
                },
                "UNKNOWN_ACTION_TYPE",
            ),
            (
                BallastError::PublishFailed {
                    topic: "DbPutItem-main".to_string(),
                    attempts: 10,
                    details: "broker gone".to_string(),
                },
                "PUBLISH_FAILED",
            ),
            (
                BallastError::LedgerWriteFailed {
                    ledger_table: "failed-ops-orders".to_string(),
                    serialized_action: "{}".to_string(),
                    details: "table missing".to_string(),
                },
                "LEDGER_WRITE_FAILED",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_only_backend_failures_are_retryable() {
        assert!(
            BallastError::BackendUnavailable {
                backend: "kv".to_string(),
                details: "timeout".to_string(),
            }
            .is_retryable()
        );
        assert!(
            !BallastError::DecodeFailed {
                details: "bad".to_string()
            }
            .is_retryable()
        );
        assert!(
            !BallastError::OperationTimedOut {
                table: "t".to_string(),
                identifier: "i".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_ledger_write_failure_carries_action_verbatim() {
        let serialized = r#"{"QueryType":"DbPutItem","RetryCount":6}"#;
        let err = BallastError::LedgerWriteFailed {
            ledger_table: "failed-ops-svc".to_string(),
            serialized_action: serialized.to_string(),
            details: "disk full".to_string(),
        };
        // The serialized action must survive into the display output so it
        // is never lost even when only the message is logged.
        assert!(err.to_string().contains(serialized));
    }

    #[test]
    fn test_operation_timed_out_display() {
        let err = BallastError::OperationTimedOut {
            table: "orders".to_string(),
            identifier: "o-42".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Internal error: operation timed out for 'orders'-'o-42'"
        );
    }
}
