//! Error types for the inter-service communication core.
//!
//! All components surface failures through [`CommsError`]. Infrastructure
//! being unreachable is always a recoverable error here, never a panic:
//! the host process must keep serving whatever it can while the registry,
//! the configuration service, or a peer is down.

use thiserror::Error;

/// Result type alias for communication operations
pub type Result<T> = std::result::Result<T, CommsError>;

#[derive(Error, Debug)]
pub enum CommsError {
    /// Registry store connectivity or I/O errors
    #[error("Registry error: {message}")]
    Registry {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Service discovery lifecycle violation
    #[error("Service discovery already running")]
    AlreadyRunning,

    /// Discovery found no live instance of the requested service
    #[error("No healthy instances of service '{service}' found")]
    NoHealthyInstance { service: String },

    /// A peer could not be resolved or dialed. Callers match on this
    /// variant to distinguish "that peer is down" from generic faults.
    #[error("Service '{service}' unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    /// Configuration service errors (unreachable, bad status, bad payload)
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization and wire-framing errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A remote call completed but the peer reported a failure
    #[error("RPC '{method}' failed: {message}")]
    Rpc { method: String, message: String },

    /// Operation exceeded its time bound
    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Connection-level I/O errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CommsError {
    /// Create a registry error
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry {
            message: message.into(),
            source: None,
        }
    }

    /// Create a registry error with source
    pub fn registry_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Registry {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source
    pub fn configuration_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a service-unavailable error
    pub fn service_unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// True if this error means the target peer is down rather than a
    /// generic transport or serialization fault
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }
}

impl From<redis::RedisError> for CommsError {
    fn from(err: redis::RedisError) -> Self {
        Self::registry_with_source("redis operation failed", err)
    }
}

impl From<serde_json::Error> for CommsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_unavailable_is_distinguishable() {
        let err = CommsError::service_unavailable("audit-correlator", "no live records");
        assert!(err.is_service_unavailable());
        assert!(err.to_string().contains("audit-correlator"));

        let other = CommsError::transport("connection reset");
        assert!(!other.is_service_unavailable());
    }

    #[test]
    fn timeout_message_includes_bound() {
        let err = CommsError::timeout("connect", 10_000);
        assert_eq!(err.to_string(), "Timeout: connect exceeded 10000ms");
    }
}
