//! Error types for kvkeeper

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by the controller loop to pick a retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// RPC timeout, write conflict, connection trouble: retry with backoff
    TransientInfra,
    /// Malformed spec or configuration: surfaced, never retried
    Validation,
    /// "Not ready yet": retried through the same channel, not a failure
    Requeue,
    /// Unexpected missing state: logged, tick aborted, retried next period
    FatalForTick,
}

#[derive(Error, Debug)]
pub enum Error {
    // === Transient infrastructure ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Write conflict on {kind} {name}: {reason}")]
    Conflict {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // === Requeue signals ===
    #[error("Requeue: {reason}")]
    Requeue {
        reason: String,
        after: Option<Duration>,
    },

    // === Validation ===
    #[error("Invalid cluster spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Collaborator errors ===
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Store control error: {0}")]
    Store(String),

    #[error("Capture control error: {0}")]
    Capture(String),

    // === Fatal for the current tick ===
    #[error("Missing required state: {0}")]
    MissingState(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a requeue signal without an explicit delay
    pub fn requeue(reason: impl Into<String>) -> Self {
        Error::Requeue {
            reason: reason.into(),
            after: None,
        }
    }

    /// Build a requeue signal that asks to be retried after `after`
    pub fn requeue_after(reason: impl Into<String>, after: Duration) -> Self {
        Error::Requeue {
            reason: reason.into(),
            after: Some(after),
        }
    }

    pub fn conflict(kind: &str, name: &str, reason: impl Into<String>) -> Self {
        Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Is this an explicit "not ready yet" signal?
    pub fn is_requeue(&self) -> bool {
        matches!(self, Error::Requeue { .. })
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::TransientInfra | ErrorClass::Requeue | ErrorClass::FatalForTick
        )
    }

    /// Delay requested by a requeue signal, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Requeue { after, .. } => *after,
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Timeout(_)
            | Error::Conflict { .. }
            | Error::ConnectionFailed(_)
            | Error::Http(_)
            | Error::Store(_)
            | Error::Capture(_) => ErrorClass::TransientInfra,
            Error::Requeue { .. } => ErrorClass::Requeue,
            Error::InvalidSpec(_) | Error::InvalidConfig(_) => ErrorClass::Validation,
            _ => ErrorClass::FatalForTick,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::Internal(format!("bad store address pattern: {}", e))
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_is_retryable_but_distinct() {
        let err = Error::requeue("drain in progress");
        assert!(err.is_requeue());
        assert!(err.is_retryable());
        assert_eq!(err.class(), ErrorClass::Requeue);
        assert!(err.retry_after().is_none());

        let err = Error::requeue_after("quorum unmet", Duration::from_secs(10));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            Error::Timeout("get stores".into()).class(),
            ErrorClass::TransientInfra
        );
        assert_eq!(
            Error::conflict("replicaset", "basic-storage", "stale").class(),
            ErrorClass::TransientInfra
        );
        let invalid = Error::InvalidSpec("no storage claims".into());
        assert_eq!(invalid.class(), ErrorClass::Validation);
        assert!(!invalid.is_retryable());
        assert_eq!(
            Error::MissingState("replica set status".into()).class(),
            ErrorClass::FatalForTick
        );
    }
}
