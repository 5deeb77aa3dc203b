//! Error types for the orchestration domain.

/// The result type used throughout relay-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A container runtime operation failed.
    #[error("runtime error: {message}")]
    Runtime {
        /// Description of the runtime failure.
        message: String,
    },

    /// The upstream event channel failed.
    #[error("upstream error: {message}")]
    Upstream {
        /// Description of the upstream failure.
        message: String,
    },

    /// A request was rejected before any side effect.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of the problem.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from relay-core.
    #[error("core error: {0}")]
    Core(#[from] relay_core::Error),
}

impl Error {
    /// Creates a new runtime error.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Creates a new upstream error.
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Creates a new invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        assert!(Error::runtime("container vanished")
            .to_string()
            .contains("container vanished"));
        assert!(Error::invalid_request("leaseMs too large")
            .to_string()
            .contains("invalid request"));
    }

    #[test]
    fn core_errors_convert() {
        let err: Error = relay_core::Error::NotFound("lock".into()).into();
        assert!(matches!(err, Error::Core(_)));
    }
}
