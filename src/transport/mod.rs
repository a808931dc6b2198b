// MIT License
// Comfort LAN bridge

pub mod session;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::ConnectError;

pub use session::{Session, SessionState};

/// A bidirectional byte stream to the panel.
pub trait PanelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PanelStream for T {}

/// Boxed stream handed from a [`Connector`] to a [`Session`].
pub type BoxedStream = Box<dyn PanelStream>;

/// Opens the raw connection a session runs over.
///
/// The supervisor only ever talks to this trait, so tests can substitute
/// in-memory streams for real sockets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a connection, honouring `config.connect_timeout`.
    async fn connect(&self, config: &ConnectionConfig) -> Result<BoxedStream, ConnectError>;
}

/// Plain TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<BoxedStream, ConnectError> {
        let addr = config.addr();
        debug!(addr = %addr, timeout_ms = config.connect_timeout.as_millis(), "Connecting to panel");

        let stream = timeout(config.connect_timeout, connect_tcp(&addr))
            .await
            .map_err(|_| ConnectError::Timeout {
                addr: addr.clone(),
                timeout: config.connect_timeout,
            })??;

        // Frames are tiny and latency-sensitive.
        if let Err(e) = stream.set_nodelay(true) {
            warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY (continuing anyway)");
        }

        info!(addr = %addr, "TCP connection established");
        Ok(Box::new(stream))
    }
}

/// Resolve then connect, trying each resolved address in turn.
async fn connect_tcp(addr: &str) -> Result<TcpStream, ConnectError> {
    let resolved: Vec<_> = tokio::net::lookup_host(addr)
        .await
        .map_err(|source| ConnectError::Resolve {
            addr: addr.to_string(),
            source,
        })?
        .collect();

    let mut last_error = None;
    for socket_addr in resolved {
        match TcpStream::connect(socket_addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(addr = %socket_addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => ConnectError::from_io(addr, e),
        None => ConnectError::Resolve {
            addr: addr.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses resolved",
            ),
        },
    })
}
