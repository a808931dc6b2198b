// MIT License
// Comfort LAN bridge

use std::fmt;
use std::time::Duration;

use crate::constants::{
    CONTROL, DEFAULT_BUFFER_SIZE, DEFAULT_COMMAND_WAIT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HOST,
    DEFAULT_NAME, DEFAULT_PORT, DEFAULT_READ_TIMEOUT, DEFAULT_RETRY_DELAY, MAX_BACKOFF_EXPONENT,
    TERMINATOR,
};
use crate::error::ConfigError;

/// Parameters for connecting to a Comfort panel.
///
/// Created once at setup and never mutated. The supervisor owns it and hands a
/// reference to every session it opens.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Panel (or UCM/Ethernet module) host name or IP address
    pub host: String,
    /// Panel TCP port (default: 1001)
    pub port: u16,
    /// Login PIN, sent verbatim in the `LI` frame
    pub pin: String,
    /// Per-read timeout; expiry sends a keepalive rather than reconnecting
    pub read_timeout: Duration,
    /// Maximum time for DNS resolution plus TCP connect
    pub connect_timeout: Duration,
    /// Delay before a reconnect attempt (base delay when backoff is enabled)
    pub retry_delay: Duration,
    /// Cap on the backoff exponent for consecutive failed connects (0 = fixed delay)
    pub max_backoff_exponent: u32,
    /// Bytes requested per socket read
    pub buffer_size: usize,
    /// Display name of the panel
    pub name: String,
    /// Send `M?` and `Z?` after every successful login
    pub bootstrap_queries: bool,
    /// How long a command waits for a connection before failing with `NotConnected`
    pub command_wait: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            pin: String::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_backoff_exponent: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            name: DEFAULT_NAME.to_string(),
            bootstrap_queries: true,
            command_wait: DEFAULT_COMMAND_WAIT,
        }
    }
}

// The PIN is a credential; keep it out of logs.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("pin", &"<redacted>")
            .field("read_timeout", &self.read_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry_delay", &self.retry_delay)
            .field("max_backoff_exponent", &self.max_backoff_exponent)
            .field("buffer_size", &self.buffer_size)
            .field("name", &self.name)
            .field("bootstrap_queries", &self.bootstrap_queries)
            .field("command_wait", &self.command_wait)
            .finish()
    }
}

impl ConnectionConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// `host:port` string used for connecting and logging.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Stable identifier derived from the display name.
    pub fn id(&self) -> String {
        self.name.to_lowercase()
    }

    /// Check every field at the boundary, before any session is constructed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.host.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidHost {
                host: self.host.clone(),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.pin.is_empty() {
            return Err(ConfigError::EmptyPin);
        }
        if self
            .pin
            .bytes()
            .any(|b| b == TERMINATOR || b == CONTROL)
        {
            return Err(ConfigError::InvalidPin);
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "read_timeout",
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "connect_timeout",
            });
        }
        if self.retry_delay.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "retry_delay",
            });
        }
        if self.max_backoff_exponent > MAX_BACKOFF_EXPONENT {
            return Err(ConfigError::BackoffTooLarge {
                value: self.max_backoff_exponent,
                max: MAX_BACKOFF_EXPONENT,
            });
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        Ok(())
    }

    /// Delay before the next attempt after `failures` consecutive failed connects.
    ///
    /// The first retry (and every retry after a session that was up) waits exactly
    /// `retry_delay`; each further failure doubles it up to `max_backoff_exponent`.
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(self.max_backoff_exponent);
        self.retry_delay.saturating_mul(1u32 << exponent)
    }
}

/// Builder for ConnectionConfig.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn pin(mut self, pin: impl Into<String>) -> Self {
        self.config.pin = pin.into();
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn max_backoff_exponent(mut self, exponent: u32) -> Self {
        self.config.max_backoff_exponent = exponent;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn bootstrap_queries(mut self, enabled: bool) -> Self {
        self.config.bootstrap_queries = enabled;
        self
    }

    pub fn command_wait(mut self, wait: Duration) -> Self {
        self.config.command_wait = wait;
        self
    }

    /// Validate and return the finished config.
    pub fn build(self) -> Result<ConnectionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
