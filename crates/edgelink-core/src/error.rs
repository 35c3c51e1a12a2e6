//! Unified error handling for EdgeLink.
//!
//! One error type covers every concern surface of the agent so that
//! framework APIs, plugins, and the wire layers can share a single
//! `Result<T>` alias.

/// Unified error type for EdgeLink.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Missing or invalid identity, host, or other configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connect failure, publish/subscribe on a dead session, TLS failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed message, unknown method, topic parse failure.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Broker rejected the supplied credentials.
    #[error("Authorization error: {0}")]
    Auth(String),

    /// Double-initialize, stop-before-start, plugin cycle, duplicate device.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Download incomplete, digest mismatch, update or rollback failure.
    #[error("OTA error: {0}")]
    Ota(String),

    /// RRPC wait expired, registration no-response, drain budget exceeded.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// One or more event handlers failed during a publish.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A user handler panicked and was recovered by the event bus.
    #[error("Handler panic: {0}")]
    HandlerPanic(String),

    /// Lookup failures (device, plugin, service, method).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem errors (version store, update staging).
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Convenience constructors for common errors
impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    pub fn ota(msg: impl Into<String>) -> Self {
        Self::Ota(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn handler_panic(msg: impl Into<String>) -> Self {
        Self::HandlerPanic(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("product key is required");
        assert_eq!(
            err.to_string(),
            "Configuration error: product key is required"
        );

        let err = Error::transport("client is not connected");
        assert_eq!(err.to_string(), "Transport error: client is not connected");
    }

    #[test]
    fn test_error_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
