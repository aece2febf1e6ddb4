use std::time::Duration;

/// Unified transport error type.
///
/// Errors are `Clone` so they can be attached to an exchange and still be
/// delivered through a completion callback on another task.
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    /// Protocol tag is not one of tcp / udp / local
    #[error("Unrecognized protocol '{value}'")]
    UnrecognizedProtocol { value: String },

    /// Invalid configuration, raised before anything starts
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration { field: String, reason: String },

    /// Consumer could not bind its listening endpoint
    #[error("Cannot bind to {address}: {reason}")]
    Bind { address: String, reason: String },

    /// Producer could not reach the remote endpoint
    #[error("Cannot connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    /// An asynchronous write failed on the wire
    #[error("Write failed: {reason}")]
    Write { reason: String },

    /// Payload could not be converted for the configured codec chain
    #[error("Payload conversion failed: {reason}")]
    Conversion { reason: String },

    /// Send was refused because the producer is not accepting work
    #[error("Send rejected: {reason}")]
    Rejected { reason: String },

    /// A bounded operation ran out of time
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    /// The channel closed before the operation could finish
    #[error("Channel closed: {reason}")]
    Closed { reason: String },
}

/// Convenience constructors
impl TransportError {
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn bind_error(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Bind {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn connect_error(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connect {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn write_error(reason: impl Into<String>) -> Self {
        Self::Write {
            reason: reason.into(),
        }
    }

    pub fn conversion_error(reason: impl Into<String>) -> Self {
        Self::Conversion {
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed {
            reason: reason.into(),
        }
    }

    /// Fatal errors abort startup; everything else is delivered through the
    /// owning exchange.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::UnrecognizedProtocol { .. }
                | TransportError::Configuration { .. }
                | TransportError::Bind { .. }
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Write {
            reason: format!("IO error: {}", error),
        }
    }
}
