// MIT License
// Comfort LAN bridge

use std::io;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{FrameBuffer, encode_command};
use crate::config::ConnectionConfig;
use crate::error::{ComfortError, ConnectError, Result};
use crate::event::EventSink;
use crate::protocol::{Command, classify};
use crate::transport::{BoxedStream, Connector};

/// Lifecycle of one connection.
///
/// `Connecting → Authenticating → Listening`; any I/O failure goes straight to
/// `Closed`. `Closing` only appears on a caller-initiated [`Session::close`].
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Listening,
    Closing,
    Closed,
}

/// Why the read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
    Stopped,
    PeerClosed,
    Failed,
}

/// State shared between the session handle and its read loop.
struct Shared {
    addr: String,
    state: watch::Sender<SessionState>,
    writer: Mutex<WriteHalf<BoxedStream>>,
    write_timeout: Duration,
    cancel: CancellationToken,
}

impl Shared {
    /// Move to `next` unless already `Closed`.
    fn transition(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == next {
                return false;
            }
            debug!("Session {}: {:?} -> {:?}", self.addr, current, next);
            *current = next;
            true
        });
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        timeout(self.write_timeout, async {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
    }

    /// Mark the session dead after an I/O failure and stop the read loop.
    fn fail(&self) {
        self.transition(SessionState::Closed);
        self.cancel.cancel();
    }

    /// Best-effort socket shutdown.
    async fn release(&self) {
        let mut writer = self.writer.lock().await;
        if let Ok(Err(e)) = timeout(self.write_timeout, writer.shutdown()).await {
            debug!("Session {}: shutdown error: {}", self.addr, e);
        }
    }
}

/// Read half and settings, parked until [`Session::listen`] starts the loop.
struct PendingReader {
    half: ReadHalf<BoxedStream>,
    read_timeout: Duration,
    buffer_size: usize,
    sink: Arc<dyn EventSink>,
}

/// One live (or attempting) connection to the panel.
///
/// The socket is owned here exclusively: the background read loop holds the read
/// half, [`Session::send`] writes through the write half.
pub struct Session {
    shared: Arc<Shared>,
    pending: std::sync::Mutex<Option<PendingReader>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect, send the login frame and start the read loop.
    ///
    /// Does not retry; that is the supervisor's job. Returns as soon as the login
    /// frame is written: the panel's `LU` reply arrives through the event sink like
    /// any other frame.
    pub async fn open(
        connector: &dyn Connector,
        config: &ConnectionConfig,
        sink: Arc<dyn EventSink>,
    ) -> std::result::Result<Self, ConnectError> {
        let session = Self::connect(connector, config, sink).await?;
        session.listen().await;
        Ok(session)
    }

    /// Connect and send the login frame, but deliver nothing until
    /// [`Session::listen`] is called. Whatever the panel sends meanwhile waits
    /// in the socket.
    pub async fn connect(
        connector: &dyn Connector,
        config: &ConnectionConfig,
        sink: Arc<dyn EventSink>,
    ) -> std::result::Result<Self, ConnectError> {
        let addr = config.addr();
        let (state, _) = watch::channel(SessionState::Connecting);
        info!("Connecting to panel at {}", addr);

        let stream = connector.connect(config).await?;
        let (reader, writer) = tokio::io::split(stream);

        let shared = Arc::new(Shared {
            addr: addr.clone(),
            state,
            writer: Mutex::new(writer),
            write_timeout: config.read_timeout,
            cancel: CancellationToken::new(),
        });
        shared.transition(SessionState::Authenticating);

        debug!("Sending login to {}", addr);
        let login = Command::Login {
            pin: config.pin.clone(),
        };
        if let Err(source) = shared.write(&login.encode()).await {
            error!("Failed to send login to {}: {}", addr, source);
            shared.transition(SessionState::Closed);
            return Err(ConnectError::Io { addr, source });
        }
        shared.transition(SessionState::Listening);

        Ok(Self {
            shared,
            pending: std::sync::Mutex::new(Some(PendingReader {
                half: reader,
                read_timeout: config.read_timeout,
                buffer_size: config.buffer_size,
                sink,
            })),
            reader_handle: Mutex::new(None),
        })
    }

    /// Start the read loop. Only the first call does anything, and nothing
    /// happens once the session is closing.
    pub async fn listen(&self) {
        let mut handle = self.reader_handle.lock().await;
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = pending else {
            return;
        };
        if self.shared.cancel.is_cancelled() {
            return;
        }

        *handle = Some(tokio::spawn(run_read_loop(self.shared.clone(), reader)));
        info!("Session to {} listening", self.shared.addr);
    }

    /// Encode and write a command. A failed write closes the session; the caller
    /// gets the error and the supervisor reconnects.
    pub async fn send(&self, command: &str) -> Result<()> {
        if self.shared.state() != SessionState::Listening {
            return Err(ComfortError::NotConnected);
        }

        debug!("Sending command to {}: {}", self.shared.addr, command);
        if let Err(e) = self.shared.write(&encode_command(command)).await {
            error!("Failed to write command to {}: {}", self.shared.addr, e);
            self.shared.fail();
            return Err(ComfortError::Write(e));
        }
        Ok(())
    }

    /// Stop the read loop and release the socket. Idempotent.
    ///
    /// Returns once the read loop has exited, so no event from this session is
    /// delivered after `close` completes.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.transition(SessionState::Closing);

        // Never started: drop the read half unread.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut handle = self.reader_handle.lock().await;
        if let Some(task) = handle.take()
            && let Err(e) = task.await
            && e.is_panic()
        {
            error!("Session {}: read loop panicked", self.shared.addr);
        }
        drop(handle);

        self.shared.release().await;
        self.shared.transition(SessionState::Closed);
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Whether commands can be sent.
    pub fn is_listening(&self) -> bool {
        self.state() == SessionState::Listening
    }

    /// Resolves once the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// `host:port` of the panel.
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Background read loop: read, frame, classify, deliver, in receipt order.
///
/// A read timeout sends a keepalive and keeps reading in the same state; EOF or a
/// read error closes the session and discards any partial frame.
async fn run_read_loop(shared: Arc<Shared>, reader: PendingReader) {
    let PendingReader {
        half: mut reader,
        read_timeout,
        buffer_size,
        sink,
    } = reader;
    let mut buf = vec![0u8; buffer_size];
    let mut frames = FrameBuffer::new(buffer_size);

    let reason = loop {
        let read = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break ExitReason::Stopped,
            read = timeout(read_timeout, reader.read(&mut buf)) => read,
        };

        match read {
            Err(_) => {
                debug!("Session {}: read timed out, sending keepalive", shared.addr);
                if let Err(e) = shared.write(&Command::Keepalive.encode()).await {
                    warn!("Session {}: keepalive failed: {}", shared.addr, ComfortError::Write(e));
                    break ExitReason::Failed;
                }
            }
            Ok(Ok(0)) => {
                info!("Session {}: connection closed by panel", shared.addr);
                break ExitReason::PeerClosed;
            }
            Ok(Ok(n)) => {
                for frame in frames.push(&buf[..n]) {
                    if shared.cancel.is_cancelled() {
                        break;
                    }
                    let event = classify(&frame);
                    debug!("Session {}: received {:?}", shared.addr, event.text);
                    sink.on_event(&event);
                }
            }
            Ok(Err(e)) => {
                warn!("Session {}: {}", shared.addr, ComfortError::Read(e));
                frames.clear();
                break ExitReason::Failed;
            }
        }
    };

    if reason == ExitReason::Stopped {
        shared.transition(SessionState::Closing);
    } else {
        // Dead already: refuse sends while the socket is shut down.
        shared.transition(SessionState::Closed);
        if !frames.pending().is_empty() {
            debug!(
                "Session {}: dropping {} bytes of partial frame",
                shared.addr,
                frames.pending().len()
            );
        }
    }

    shared.release().await;
    shared.transition(SessionState::Closed);
    shared.cancel.cancel();
    debug!("Session {}: read loop exited ({:?})", shared.addr, reason);
}
