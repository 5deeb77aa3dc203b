//! Error types and result aliases for Relay.
//!
//! This module defines the shared error taxonomy used across all Relay
//! components. Errors are structured for programmatic handling: transient
//! storage failures are retryable, precondition failures signal lost races,
//! and configuration errors are fatal at startup.

use std::fmt;

/// The result type used throughout Relay.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Relay operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Required configuration is missing or invalid. Fatal at startup.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the identifier invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A named resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// The operation conflicts with existing state (already exists, held).
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflicting state.
        message: String,
    },

    /// A precondition for the operation was not met (lost CAS race).
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// A storage or network operation failed. Retryable.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An operation exceeded its time budget.
    #[error("timeout: {message}")]
    Timeout {
        /// Description of what timed out.
        message: String,
    },

    /// An internal error that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Returns whether this error is transient and safe to retry.
    ///
    /// Only storage/network failures qualify. Precondition failures are not
    /// transient: the caller must re-read state before retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_transient() {
        assert!(Error::storage("connection reset").is_transient());
        assert!(!Error::conflict("lock held").is_transient());
        assert!(!Error::NotFound("doc".into()).is_transient());
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::storage_with_source("failed to read object", source);
        assert!(err.to_string().contains("storage error"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn resource_not_found_display() {
        let err = Error::resource_not_found("workspace", "ws-1");
        assert!(err.to_string().contains("workspace"));
        assert!(err.to_string().contains("ws-1"));
    }
}
