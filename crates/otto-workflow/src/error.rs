// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error-kind strings shared by all activities.
///
/// Individual activities may define additional kinds (the LLM activity adds
/// `context_overflow`, `api_limit` and `fatal`); these four are the ones the
/// kernel itself produces.
pub mod error_kinds {
    pub const APPLICATION: &str = "application";
    pub const TIMEOUT: &str = "timeout";
    pub const CANCELED: &str = "canceled";
    pub const UNKNOWN: &str = "unknown";
}

/// A typed activity failure.
///
/// `kind` is a stable string the workflow branches on; `retryable` tells the
/// kernel's retry loop whether another attempt can help.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ActivityError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl ActivityError {
    /// A typed failure that further attempts cannot fix.
    pub fn non_retryable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// A failure worth retrying under the activity's retry policy.
    pub fn retryable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Structured tool failure; the message becomes the tool output content.
    pub fn application(message: impl Into<String>) -> Self {
        Self::non_retryable(error_kinds::APPLICATION, message)
    }

    pub fn timeout() -> Self {
        Self::retryable(error_kinds::TIMEOUT, "activity start-to-close timeout elapsed")
    }

    pub fn canceled() -> Self {
        Self::non_retryable(error_kinds::CANCELED, "activity was canceled")
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::retryable(error_kinds::UNKNOWN, message)
    }
}

/// A validator turned an update down.  Never recorded in history; the
/// caller may fix the input and retry.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{reason}")]
pub struct UpdateRejection {
    pub reason: String,
}

impl UpdateRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Unrecoverable workflow failure.  The runtime records it and the
/// instance is lost.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    #[error("internal workflow failure: {0}")]
    Internal(String),
    #[error("malformed workflow input: {0}")]
    BadInput(String),
}

/// Errors surfaced to workflow clients.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("workflow is closed")]
    Closed,
    #[error("no handler registered for {0:?}")]
    HandlerMissing(String),
    #[error("update rejected: {0}")]
    Rejected(#[from] UpdateRejection),
    #[error("workflow not found: {0}")]
    NotFound(String),
    #[error("workflow already running: {0}")]
    AlreadyRunning(String),
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_errors_are_not_retryable() {
        let e = ActivityError::application("disk full");
        assert!(!e.retryable);
        assert_eq!(e.kind, error_kinds::APPLICATION);
    }

    #[test]
    fn timeout_is_retryable() {
        assert!(ActivityError::timeout().retryable);
    }

    #[test]
    fn activity_error_roundtrips() {
        let e = ActivityError::non_retryable("context_overflow", "too many tokens");
        let json = serde_json::to_string(&e).unwrap();
        let back: ActivityError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "context_overflow");
        assert!(!back.retryable);
    }

    #[test]
    fn display_includes_kind_and_message() {
        let e = ActivityError::application("nope");
        assert_eq!(e.to_string(), "application: nope");
    }
}
