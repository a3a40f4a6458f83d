//! Error types for axum-dbconn.
//!
//! Three surfaces, three types: `ConfigError` is returned synchronously at
//! construction and aborts setup; `AcquireError` is returned to the caller of
//! `acquire` on each request; `DriverError` is the driver-facing error carried
//! inside both and published on the supervision channel for fatal conditions.

use thiserror::Error;

/// Error code a driver reports when the underlying transport dropped.
///
/// A connection error event carrying this code triggers automatic reconnection
/// under the single-connection strategy; every other code is treated as
/// unrecoverable.
pub const PROTOCOL_CONNECTION_LOST: &str = "PROTOCOL_CONNECTION_LOST";

/// Error raised by a [`Driver`](crate::driver::Driver) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Connect failed: {message}")]
    Connect { message: String },

    #[error("Connection error ({code}): {message}")]
    Event { code: String, message: String },

    #[error("Pool checkout failed: {message}")]
    Checkout { message: String },

    #[error("Pool is closed")]
    PoolClosed,
}

impl DriverError {
    /// Create a connect error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Create a connection error event with a driver error code.
    pub fn event(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Event {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a pool checkout error.
    pub fn checkout(message: impl Into<String>) -> Self {
        Self::Checkout {
            message: message.into(),
        }
    }

    /// Create the distinguished "protocol connection lost" event.
    pub fn protocol_lost(message: impl Into<String>) -> Self {
        Self::event(PROTOCOL_CONNECTION_LOST, message)
    }

    /// Get the driver error code for event errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Event { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether this error is the recoverable transport-dropped condition.
    pub fn is_protocol_lost(&self) -> bool {
        self.code() == Some(PROTOCOL_CONNECTION_LOST)
    }
}

/// Invalid or missing setup arguments, reported before any request is processed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "Not supported connection strategy: '{value}'. Expected one of 'single', 'pool', 'request'."
    )]
    UnknownStrategy { value: String },

    #[error("Invalid option '{option}': {message}")]
    InvalidOption { option: String, message: String },

    #[error("Invalid connection URL: {message}")]
    InvalidUrl { message: String },

    #[error("Pool creation rejected")]
    PoolCreation(#[source] DriverError),
}

impl ConfigError {
    /// Create an unknown-strategy error naming the bad value.
    pub fn unknown_strategy(value: impl Into<String>) -> Self {
        Self::UnknownStrategy {
            value: value.into(),
        }
    }

    /// Create an invalid-option error.
    pub fn invalid_option(option: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-URL error.
    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            message: message.into(),
        }
    }
}

/// Failure to bind a connection to a request.
///
/// Acquisition never panics and never crosses the supervision channel; request
/// code decides whether the request fails.
#[derive(Error, Debug, Clone)]
pub enum AcquireError {
    #[error("Pool checkout failed")]
    Checkout(#[source] DriverError),

    #[error("Connect failed")]
    Connect(#[source] DriverError),

    #[error("Request already completed; its connection slot is closed")]
    RequestCompleted,
}

impl AcquireError {
    /// Whether a later acquire on the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::RequestCompleted)
    }
}

/// Convert sqlx errors to DriverError for the MySQL driver.
///
/// Transport-level failures map to the protocol-lost code so the reconnect
/// supervisor treats them as recoverable; everything else keeps the server's
/// own code where one exists.
#[cfg(feature = "mysql")]
impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DriverError::connect(msg.to_string()),
            sqlx::Error::Io(io_err) => {
                DriverError::protocol_lost(format!("I/O error: {}", io_err))
            }
            sqlx::Error::Protocol(msg) => {
                DriverError::protocol_lost(format!("Protocol error: {}", msg))
            }
            sqlx::Error::WorkerCrashed => {
                DriverError::protocol_lost("Database worker crashed")
            }
            sqlx::Error::Tls(tls_err) => DriverError::connect(format!("TLS error: {}", tls_err)),
            sqlx::Error::PoolTimedOut => DriverError::checkout("Pool acquire timed out"),
            sqlx::Error::PoolClosed => DriverError::PoolClosed,
            sqlx::Error::Database(db_err) => {
                let code = db_err
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "UNKNOWN".to_string());
                DriverError::event(code, db_err.message().to_string())
            }
            _ => DriverError::connect(format!("Unknown driver error: {}", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::connect("refused");
        assert!(err.to_string().contains("Connect failed"));
    }

    #[test]
    fn test_protocol_lost_code() {
        let err = DriverError::protocol_lost("transport dropped");
        assert!(err.is_protocol_lost());
        assert_eq!(err.code(), Some(PROTOCOL_CONNECTION_LOST));
    }

    #[test]
    fn test_other_event_not_protocol_lost() {
        let err = DriverError::event("ER_ACCESS_DENIED_ERROR", "bad credentials");
        assert!(!err.is_protocol_lost());
        assert_eq!(err.code(), Some("ER_ACCESS_DENIED_ERROR"));
    }

    #[test]
    fn test_connect_error_has_no_code() {
        assert_eq!(DriverError::connect("refused").code(), None);
        assert!(!DriverError::PoolClosed.is_protocol_lost());
    }

    #[test]
    fn test_config_error_names_bad_strategy() {
        let err = ConfigError::unknown_strategy("cluster");
        let msg = err.to_string();
        assert!(msg.contains("cluster"));
        assert!(msg.contains("Not supported"));
    }

    #[test]
    fn test_acquire_error_retryable() {
        assert!(AcquireError::Checkout(DriverError::checkout("busy")).is_retryable());
        assert!(AcquireError::Connect(DriverError::connect("refused")).is_retryable());
        assert!(!AcquireError::RequestCompleted.is_retryable());
    }

    #[test]
    fn test_acquire_error_carries_source() {
        let err = AcquireError::Checkout(DriverError::PoolClosed);
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("closed"));
    }
}
