//! Error types for the authorization sidecar

use thiserror::Error;

/// Authorization sidecar error types
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Credential failed cryptographic or claim validation
    #[error("invalid token: {message}")]
    InvalidToken {
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Revocation lookup failure (store unreachable, timeout)
    #[error("revocation lookup error: {message}")]
    Revocation {
        /// Error message
        message: String,
    },

    /// Startup bootstrap of the revocation cache failed
    #[error("revocation bootstrap error: {message}")]
    Bootstrap {
        /// Error message
        message: String,
    },

    /// Event consumer failure
    #[error("event consumer error: {message}")]
    Consumer {
        /// Error message
        message: String,
    },

    /// Transport (gRPC/HTTP) error
    #[error("transport error: {message}")]
    Transport {
        /// Error message
        message: String,
    },

    /// Key-value store error
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Event bus transport error
    #[error("event bus error: {0}")]
    Bus(#[from] lapin::Error),
}

impl AuthzError {
    /// Create an invalid-token error
    pub fn invalid_token(msg: impl Into<String>) -> Self {
        Self::InvalidToken {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a revocation lookup error
    pub fn revocation(msg: impl Into<String>) -> Self {
        Self::Revocation {
            message: msg.into(),
        }
    }

    /// Create a bootstrap error
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::Bootstrap {
            message: msg.into(),
        }
    }

    /// Create an event consumer error
    pub fn consumer(msg: impl Into<String>) -> Self {
        Self::Consumer {
            message: msg.into(),
        }
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    /// Check if this error is a client-side authentication failure
    /// (vs an infrastructure fault that must surface as a 500)
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, AuthzError::InvalidToken { .. })
    }
}

/// Result type for sidecar operations
pub type Result<T> = std::result::Result<T, AuthzError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_token_error() {
        let err = AuthzError::invalid_token("token expired");
        assert!(err.to_string().contains("token expired"));
        assert!(err.is_auth_failure());
    }

    #[test]
    fn test_auth_failure_classification() {
        assert!(AuthzError::invalid_token("expired").is_auth_failure());
        assert!(!AuthzError::revocation("timeout").is_auth_failure());
        assert!(!AuthzError::bootstrap("scan failed").is_auth_failure());
        assert!(!AuthzError::configuration("bad port").is_auth_failure());
    }

    #[test]
    fn test_bootstrap_error_display() {
        let err = AuthzError::bootstrap("store unreachable");
        assert!(err.to_string().contains("bootstrap"));
        assert!(err.to_string().contains("store unreachable"));
    }
}
