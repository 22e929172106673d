// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runtara-process.
//!
//! Every core operation returns [`EngineError`]. Caller errors (bad targets,
//! stale ids, malformed requests) are never retried; [`EngineError::ConcurrentModification`]
//! is the only variant a scheduler should retry, and only by re-running the whole
//! unit of work from a fresh snapshot.

use std::fmt;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the process runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EngineError {
    /// An activity or transition referenced by a request is not part of the process graph,
    /// or cannot be used the way the request asks.
    InvalidTarget {
        /// The activity or transition id.
        target: String,
        /// What is wrong with the target.
        message: String,
    },

    /// An entity could not be resolved against the current state.
    NotFound {
        /// Kind of entity, e.g. "Activity instance".
        entity: String,
        /// The id that was looked up.
        id: String,
    },

    /// The request is structurally invalid and was rejected before any mutation.
    BadRequest {
        /// The validation error message.
        message: String,
    },

    /// The instance hierarchy changed between load and commit.
    ConcurrentModification {
        /// Root process instance id of the hierarchy.
        root_process_instance_id: String,
        /// Revision the unit of work was based on.
        expected_revision: u64,
        /// Revision found at commit time.
        actual_revision: Option<u64>,
    },

    /// A mutating operation targeted a suspended process instance.
    Suspended {
        /// The suspended process instance id.
        process_instance_id: String,
    },

    /// An entity is in a state that forbids the requested operation.
    InvalidState {
        /// The entity id.
        entity_id: String,
        /// Why the operation is not allowed.
        message: String,
    },

    /// Process behavior failed while moving tokens (service task, listener, gateway).
    ProcessEngine {
        /// The failure message.
        message: String,
    },

    /// The store failed.
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Shorthand for [`EngineError::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Shorthand for [`EngineError::BadRequest`].
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Shorthand for [`EngineError::InvalidTarget`].
    pub fn invalid_target(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Shorthand for [`EngineError::InvalidState`].
    pub fn invalid_state(entity_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidState {
            entity_id: entity_id.into(),
            message: message.into(),
        }
    }

    /// Shorthand for [`EngineError::ProcessEngine`].
    pub fn process_engine(message: impl Into<String>) -> Self {
        Self::ProcessEngine {
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidTarget { .. } => "INVALID_TARGET",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Self::Suspended { .. } => "SUSPENDED",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::ProcessEngine { .. } => "PROCESS_ENGINE",
            Self::Storage { .. } => "STORAGE_ERROR",
        }
    }

    /// Whether re-running the unit of work from scratch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTarget { target, message } => {
                write!(f, "Invalid target '{}': {}", target, message)
            }
            Self::NotFound { entity, id } => write!(f, "{} '{}' not found", entity, id),
            Self::BadRequest { message } => write!(f, "Bad request: {}", message),
            Self::ConcurrentModification {
                root_process_instance_id,
                expected_revision,
                actual_revision,
            } => match actual_revision {
                Some(actual) => write!(
                    f,
                    "Process instance hierarchy '{}' was modified concurrently: expected revision {}, found {}",
                    root_process_instance_id, expected_revision, actual
                ),
                None => write!(
                    f,
                    "Process instance hierarchy '{}' was removed concurrently (expected revision {})",
                    root_process_instance_id, expected_revision
                ),
            },
            Self::Suspended {
                process_instance_id,
            } => write!(f, "Process instance '{}' is suspended", process_instance_id),
            Self::InvalidState { entity_id, message } => {
                write!(f, "'{}' is in invalid state: {}", entity_id, message)
            }
            Self::ProcessEngine { message } => write!(f, "{}", message),
            Self::Storage { operation, details } => {
                write!(f, "Storage error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_codes() {
        let test_cases = vec![
            (EngineError::invalid_target("task9", "missing"), "INVALID_TARGET"),
            (
                EngineError::not_found("Activity instance", "task1:1"),
                "NOT_FOUND",
            ),
            (EngineError::bad_request("empty"), "BAD_REQUEST"),
            (
                EngineError::ConcurrentModification {
                    root_process_instance_id: "pi-1".to_string(),
                    expected_revision: 1,
                    actual_revision: Some(2),
                },
                "CONCURRENT_MODIFICATION",
            ),
            (
                EngineError::Suspended {
                    process_instance_id: "pi-1".to_string(),
                },
                "SUSPENDED",
            ),
            (EngineError::invalid_state("job-1", "locked"), "INVALID_STATE"),
            (EngineError::process_engine("boom"), "PROCESS_ENGINE"),
            (
                EngineError::Storage {
                    operation: "commit".to_string(),
                    details: "disk".to_string(),
                },
                "STORAGE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(error.error_code(), expected_code, "wrong code for {error:?}");
        }
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::not_found("Activity instance", "task1:abc");
        assert_eq!(err.to_string(), "Activity instance 'task1:abc' not found");

        let err = EngineError::invalid_target(
            "foo",
            "element 'foo' does not exist in process 'invoice:1'",
        );
        assert!(err.to_string().contains("element 'foo' does not exist in process"));

        let err = EngineError::ConcurrentModification {
            root_process_instance_id: "pi-1".to_string(),
            expected_revision: 3,
            actual_revision: None,
        };
        assert!(err.to_string().contains("removed concurrently"));
    }

    #[test]
    fn test_only_concurrent_modification_is_retryable() {
        assert!(
            EngineError::ConcurrentModification {
                root_process_instance_id: "pi".to_string(),
                expected_revision: 0,
                actual_revision: Some(1),
            }
            .is_retryable()
        );
        assert!(!EngineError::bad_request("x").is_retryable());
        assert!(!EngineError::not_found("Execution", "e").is_retryable());
    }
}
