// MIT License
// Comfort LAN bridge

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::{ComfortError, Result};
use crate::event::{ConnectionState, EventSink};
use crate::protocol::Command;
use crate::transport::{Connector, Session, TcpConnector};

/// Lifecycle of the reconnect supervisor.
///
/// `Idle → Connecting → Running → Reconnecting → Connecting → ...`, until
/// [`Supervisor::stop`] moves it to `Stopped`, the only state with no reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Running,
    Reconnecting,
    Stopped,
}

/// State shared by the supervisor task, its handle and every dispatcher.
pub(crate) struct Inner {
    pub(crate) config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn EventSink>,
    /// The one session commands may go to. Guarded because `stop()` and a
    /// reconnect can race to replace it.
    current: Mutex<Option<Arc<Session>>>,
    pub(crate) state: watch::Sender<SupervisorState>,
    connection: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    /// Cuts the retry delay short when a command is waiting.
    pub(crate) wake: Notify,
    /// Connect attempts started so far.
    attempts: AtomicU64,
}

impl Inner {
    fn set_state(&self, next: SupervisorState) {
        self.state.send_if_modified(|current| {
            if *current == SupervisorState::Stopped || *current == next {
                return false;
            }
            debug!("Supervisor: {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }

    /// Forward a connection state change to the sink, once per change.
    fn report(&self, next: ConnectionState) {
        let changed = self.connection.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            self.sink.on_connection_state(next);
        }
    }

    /// The current session, if it can take commands.
    pub(crate) async fn live_session(&self) -> Option<Arc<Session>> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|s| s.is_listening())
            .cloned()
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Keeps one session to the panel alive until told to stop.
///
/// Connect failures and dropped sessions are handled the same way: log, wait
/// `retry_delay` (with optional backoff), try again, forever. Nothing in the
/// read/write path is escalated to the owner.
pub struct Supervisor {
    inner: Arc<Inner>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Create a supervisor. The config is validated here, before any socket exists.
    pub fn new(
        config: ConnectionConfig,
        connector: impl Connector,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(SupervisorState::Idle);
        let (connection, _) = watch::channel(ConnectionState::Down);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector: Arc::new(connector),
                sink,
                current: Mutex::new(None),
                state,
                connection,
                cancel: CancellationToken::new(),
                wake: Notify::new(),
                attempts: AtomicU64::new(0),
            }),
            task: std::sync::Mutex::new(None),
        })
    }

    /// Create a supervisor that connects over plain TCP.
    pub fn tcp(config: ConnectionConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        Self::new(config, TcpConnector, sink)
    }

    /// Start the background connect/reconnect task. Must be called inside a tokio
    /// runtime, once.
    pub fn start(&self) -> Result<()> {
        let mut started = Ok(());
        self.inner.state.send_if_modified(|current| match *current {
            SupervisorState::Idle => {
                *current = SupervisorState::Connecting;
                true
            }
            SupervisorState::Stopped => {
                started = Err(ComfortError::Stopped);
                false
            }
            _ => {
                started = Err(ComfortError::AlreadyStarted);
                false
            }
        });
        started?;

        info!(
            "Starting supervisor for {} ({})",
            self.inner.config.name,
            self.inner.config.addr()
        );
        let handle = tokio::spawn(run(self.inner.clone()));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Stop for good: cancel any pending retry or connect, close the current
    /// session and wait for the background task to finish. Idempotent.
    pub async fn stop(&self) {
        info!("Stopping supervisor for {}", self.inner.config.name);
        self.inner.cancel.cancel();

        let session = self.inner.current.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
            && e.is_panic()
        {
            error!("Supervisor task panicked");
        }

        self.inner.report(ConnectionState::Down);
        self.inner.set_state(SupervisorState::Stopped);
    }

    /// Current supervisor state.
    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    /// Watch supervisor state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    /// Last connection state reported to the sink.
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.borrow()
    }

    /// Handle for sending commands through whichever session is current.
    pub fn dispatcher(&self) -> CommandDispatcher {
        CommandDispatcher::new(self.inner.clone())
    }

    /// The config this supervisor connects with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

/// The supervisor task.
async fn run(inner: Arc<Inner>) {
    let mut failures: u32 = 0;

    loop {
        inner.attempts.fetch_add(1, Ordering::SeqCst);
        inner.set_state(SupervisorState::Connecting);
        inner.report(ConnectionState::Connecting);

        let opened = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            opened = Session::connect(&*inner.connector, &inner.config, inner.sink.clone()) => opened,
        };

        match opened {
            Ok(session) => {
                let session = Arc::new(session);
                {
                    let mut current = inner.current.lock().await;
                    if inner.cancel.is_cancelled() {
                        drop(current);
                        debug!("Stopped while connecting, closing new session");
                        session.close().await;
                        break;
                    }
                    *current = Some(session.clone());
                }

                failures = 0;
                inner.set_state(SupervisorState::Running);
                inner.report(ConnectionState::Up);
                info!("Connected to {} at {}", inner.config.name, session.addr());
                // Frames only flow once the session is current and Up is out.
                session.listen().await;

                if inner.config.bootstrap_queries {
                    bootstrap(&session).await;
                }

                tokio::select! {
                    biased;
                    // stop() owns closing the current session.
                    _ = inner.cancel.cancelled() => break,
                    _ = session.closed() => {}
                }

                {
                    let mut current = inner.current.lock().await;
                    if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &session)) {
                        *current = None;
                    }
                }
                // Wait for the read loop to exit before anything replaces it.
                session.close().await;
                warn!("Connection to {} lost", inner.config.name);
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!("Connection attempt {} failed: {}", failures, e);
            }
        }

        let wake = inner.wake.notified();
        tokio::pin!(wake);
        wake.as_mut().enable();

        inner.report(ConnectionState::Down);
        inner.set_state(SupervisorState::Reconnecting);

        let delay = inner.config.reconnect_delay(failures);
        info!("Reconnecting in {:.1}s...", delay.as_secs_f64());
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            _ = &mut wake => debug!("Reconnect requested by pending command"),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // Only reached on cancellation. stop() normally took the session already.
    let session = inner.current.lock().await.take();
    if let Some(session) = session {
        session.close().await;
    }

    inner.report(ConnectionState::Down);
    inner.set_state(SupervisorState::Stopped);
    debug!("Supervisor task exited");
}

/// Ask for the current mode and zone states so the host starts from fresh data.
async fn bootstrap(session: &Session) {
    for command in [Command::SecurityModeQuery, Command::ZoneQuery] {
        if let Err(e) = session.send(&command.to_wire_string()).await {
            warn!("Bootstrap query {} failed: {}", command.to_wire_string(), e);
            return;
        }
    }
}
