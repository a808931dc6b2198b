// MIT License
// Comfort LAN bridge

use std::time::Duration;

/// Invalid connection parameters. Fatal at setup: no socket is ever opened
/// with a config that fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Host must not be empty")]
    EmptyHost,

    #[error("Host contains whitespace: {host:?}")]
    InvalidHost { host: String },

    #[error("Port must be in 1-65535")]
    InvalidPort,

    #[error("Login PIN must not be empty")]
    EmptyPin,

    #[error("Login PIN contains a framing byte")]
    InvalidPin,

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("Receive buffer size must be greater than zero")]
    ZeroBufferSize,

    #[error("Backoff exponent {value} exceeds maximum of {max}")]
    BackoffTooLarge { value: u32, max: u32 },

    #[error("Display name must not be empty")]
    EmptyName,
}

/// Failure to establish the TCP connection. Retried by the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Could not resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {addr} refused")]
    Refused {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("Connection to {addr} failed: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConnectError {
    /// Classify an I/O error raised by a connect attempt.
    pub fn from_io(addr: impl Into<String>, source: std::io::Error) -> Self {
        let addr = addr.into();
        match source.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectError::Refused { addr, source },
            std::io::ErrorKind::TimedOut => ConnectError::Timeout {
                addr,
                timeout: Duration::ZERO,
            },
            _ => ConnectError::Io { addr, source },
        }
    }
}

/// All errors that can occur in the comfort-lan-bridge library.
#[derive(Debug, thiserror::Error)]
pub enum ComfortError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("Write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("Not connected to panel")]
    NotConnected,

    #[error("Client has been stopped")]
    Stopped,

    #[error("Supervisor already started")]
    AlreadyStarted,

    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: &'static str },
}

impl ComfortError {
    /// Whether this error is transient and the connection should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ComfortError::Connect(_)
                | ComfortError::Read(_)
                | ComfortError::Write(_)
                | ComfortError::NotConnected
        )
    }
}

pub type Result<T> = std::result::Result<T, ComfortError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_connect_error_classification() {
        let refused = ConnectError::from_io(
            "10.0.0.1:1001",
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert!(matches!(refused, ConnectError::Refused { .. }));

        let other = ConnectError::from_io("10.0.0.1:1001", io::Error::other("boom"));
        assert!(matches!(other, ConnectError::Io { .. }));
        assert!(other.to_string().contains("10.0.0.1:1001"));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ComfortError::NotConnected.is_retryable());
        assert!(ComfortError::Read(io::Error::from(io::ErrorKind::ConnectionReset)).is_retryable());
        assert!(ComfortError::Write(io::Error::from(io::ErrorKind::BrokenPipe)).is_retryable());
        assert!(!ComfortError::Config(ConfigError::InvalidPort).is_retryable());
        assert!(!ComfortError::Stopped.is_retryable());
    }
}
