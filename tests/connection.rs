// Connection lifecycle tests
//
// The panel side of every connection is an in-memory duplex stream handed to
// the test by a scripted connector, and the tokio clock is paused so retry
// delays and read timeouts elapse instantly and deterministically.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};

use comfort_lan_bridge::{
    BoxedStream, ComfortError, Command, ConnectError, ConnectionConfig, ConnectionConfigBuilder,
    ConnectionState, Connector, EventReceiver, PanelEvent, ParsedEvent, Session, SessionState,
    Supervisor, SupervisorState, event_channel,
};

// =========================================================================
// Test harness
// =========================================================================

/// Client end of a mock connection. Reads fail once with ConnectionReset
/// after `reset` is set, writes fail with BrokenPipe while `write_fault` is
/// set, and a slow stream takes a second to shut down.
struct FlakyStream {
    inner: DuplexStream,
    reset: Arc<AtomicBool>,
    write_fault: Arc<AtomicBool>,
    shutdown_delay: Option<Pin<Box<Sleep>>>,
    slow: bool,
    open: Arc<AtomicUsize>,
}

impl AsyncRead for FlakyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.reset.swap(false, Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FlakyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_fault.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if std::mem::take(&mut this.slow) {
            this.shutdown_delay = Some(Box::pin(tokio::time::sleep(SLOW_SHUTDOWN)));
        }
        if let Some(delay) = this.shutdown_delay.as_mut() {
            if delay.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            this.shutdown_delay = None;
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl Drop for FlakyStream {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

const SLOW_SHUTDOWN: Duration = Duration::from_secs(1);

/// Panel end of a mock connection.
struct Panel {
    stream: DuplexStream,
    reset: Arc<AtomicBool>,
    write_fault: Arc<AtomicBool>,
}

impl Panel {
    /// Read one frame written by the client, without its terminator.
    async fn read_frame(&mut self) -> String {
        let mut frame = Vec::new();
        loop {
            let byte = self.stream.read_u8().await.expect("client closed the connection");
            if byte == b'\r' {
                return String::from_utf8_lossy(&frame).into_owned();
            }
            frame.push(byte);
        }
    }

    async fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Make the client's next read fail with ConnectionReset.
    async fn reset(&mut self) {
        self.reset.store(true, Ordering::SeqCst);
        // Wake a read that is already pending.
        self.write(b"x").await;
    }

    /// Make every client write fail with BrokenPipe from now on.
    fn fail_writes(&self) {
        self.write_fault.store(true, Ordering::SeqCst);
    }
}

struct MockState {
    attempts: AtomicUsize,
    open: Arc<AtomicUsize>,
    failures: Mutex<VecDeque<ConnectError>>,
    fail_always: AtomicBool,
    hang: AtomicBool,
    slow_shutdown: AtomicBool,
    panels: mpsc::UnboundedSender<Panel>,
}

#[derive(Clone)]
struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    fn new() -> (Self, mpsc::UnboundedReceiver<Panel>) {
        let (panels, rx) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(MockState {
                attempts: AtomicUsize::new(0),
                open: Arc::new(AtomicUsize::new(0)),
                failures: Mutex::new(VecDeque::new()),
                fail_always: AtomicBool::new(false),
                hang: AtomicBool::new(false),
                slow_shutdown: AtomicBool::new(false),
                panels,
            }),
        };
        (connector, rx)
    }

    fn fail_next(&self, count: usize) {
        let mut failures = self.state.failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(refused());
        }
    }

    fn fail_always(&self) {
        self.state.fail_always.store(true, Ordering::SeqCst);
    }

    fn hang(&self) {
        self.state.hang.store(true, Ordering::SeqCst);
    }

    /// Streams created from now on take a second to shut down.
    fn slow_shutdown(&self) {
        self.state.slow_shutdown.store(true, Ordering::SeqCst);
    }

    fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    fn open_streams(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }
}

fn refused() -> ConnectError {
    ConnectError::Refused {
        addr: "panel.test:1001".to_string(),
        source: io::Error::from(io::ErrorKind::ConnectionRefused),
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<BoxedStream, ConnectError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.state.fail_always.load(Ordering::SeqCst) {
            return Err(refused());
        }
        let scripted = self.state.failures.lock().unwrap().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        let (client, server) = tokio::io::duplex(4096);
        let reset = Arc::new(AtomicBool::new(false));
        let write_fault = Arc::new(AtomicBool::new(false));
        self.state.open.fetch_add(1, Ordering::SeqCst);
        let stream = FlakyStream {
            inner: client,
            reset: reset.clone(),
            write_fault: write_fault.clone(),
            shutdown_delay: None,
            slow: self.state.slow_shutdown.load(Ordering::SeqCst),
            open: self.state.open.clone(),
        };
        let _ = self.state.panels.send(Panel {
            stream: server,
            reset,
            write_fault,
        });
        Ok(Box::new(stream))
    }
}

fn test_config() -> ConnectionConfigBuilder {
    ConnectionConfig::builder()
        .host("panel.test")
        .pin("1234")
        // Long enough that no keepalive fires unless a test wants one
        .read_timeout(Duration::from_secs(3600))
        .retry_delay(Duration::from_secs(5))
        .command_wait(Duration::from_secs(2))
        .bootstrap_queries(false)
}

fn start(config: ConnectionConfig, connector: &MockConnector) -> (Supervisor, EventReceiver) {
    let (tx, rx) = event_channel(64);
    let supervisor = Supervisor::new(config, connector.clone(), Arc::new(tx)).unwrap();
    supervisor.start().unwrap();
    (supervisor, rx)
}

async fn wait_for_state(supervisor: &Supervisor, target: SupervisorState) {
    let mut rx = supervisor.subscribe_state();
    rx.wait_for(|s| *s == target).await.unwrap();
}

/// Next classified frame, skipping connection state changes.
async fn next_message(rx: &mut EventReceiver) -> ParsedEvent {
    loop {
        match rx.recv().await.unwrap() {
            PanelEvent::Message(msg) => return msg,
            PanelEvent::ConnectionState(_) => {}
        }
    }
}

async fn next_connection_state(rx: &mut EventReceiver) -> ConnectionState {
    loop {
        match rx.recv().await.unwrap() {
            PanelEvent::ConnectionState(state) => return state,
            PanelEvent::Message(_) => {}
        }
    }
}

// =========================================================================
// Session
// =========================================================================

#[tokio::test(start_paused = true)]
async fn session_sends_login_and_listens() {
    let (connector, mut panels) = MockConnector::new();
    let config = test_config().build().unwrap();
    let (tx, _rx) = event_channel(16);

    let session = Session::open(&connector, &config, Arc::new(tx)).await.unwrap();
    let mut panel = panels.recv().await.unwrap();

    assert_eq!(panel.read_frame().await, "\x03LI1234");
    assert_eq!(session.state(), SessionState::Listening);
    assert_eq!(session.addr(), "panel.test:1001");

    session.send("O!0101").await.unwrap();
    assert_eq!(panel.read_frame().await, "\x03O!0101");
}

#[tokio::test(start_paused = true)]
async fn session_close_is_idempotent() {
    let (connector, mut panels) = MockConnector::new();
    let config = test_config().build().unwrap();
    let (tx, _rx) = event_channel(16);

    let session = Session::open(&connector, &config, Arc::new(tx)).await.unwrap();
    let mut panel = panels.recv().await.unwrap();
    panel.read_frame().await;

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);

    // Panel sees EOF once the socket is released
    let mut rest = Vec::new();
    panel.stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let err = session.send("M?").await.unwrap_err();
    assert!(matches!(err, ComfortError::NotConnected), "got {:?}", err);
}

#[tokio::test(start_paused = true)]
async fn session_read_reset_closes() {
    let (connector, mut panels) = MockConnector::new();
    let config = test_config().build().unwrap();
    let (tx, _rx) = event_channel(16);

    let session = Session::open(&connector, &config, Arc::new(tx)).await.unwrap();
    let mut panel = panels.recv().await.unwrap();
    panel.read_frame().await;

    panel.reset().await;
    session.closed().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn session_write_failure_closes() {
    let (connector, mut panels) = MockConnector::new();
    let config = test_config().build().unwrap();
    let (tx, _rx) = event_channel(16);

    let session = Session::open(&connector, &config, Arc::new(tx)).await.unwrap();
    let mut panel = panels.recv().await.unwrap();
    panel.read_frame().await;

    panel.fail_writes();
    let err = session.send("M?").await.unwrap_err();
    assert!(matches!(err, ComfortError::Write(_)), "got {:?}", err);
    assert_eq!(session.state(), SessionState::Closed);

    let err = session.send("M?").await.unwrap_err();
    assert!(matches!(err, ComfortError::NotConnected), "got {:?}", err);
}

#[tokio::test(start_paused = true)]
async fn session_refuses_sends_while_shutting_down() {
    let (connector, mut panels) = MockConnector::new();
    connector.slow_shutdown();
    let config = test_config().build().unwrap();
    let (tx, _rx) = event_channel(16);

    let session = Session::open(&connector, &config, Arc::new(tx)).await.unwrap();
    let mut panel = panels.recv().await.unwrap();
    panel.read_frame().await;

    let before = Instant::now();
    panel.reset().await;
    session.closed().await;
    // Closed as soon as the read fails, not once the socket is shut down
    assert!(before.elapsed() < SLOW_SHUTDOWN, "closed after {:?}", before.elapsed());

    let err = session.send("M?").await.unwrap_err();
    assert!(matches!(err, ComfortError::NotConnected), "got {:?}", err);
    assert!(before.elapsed() < SLOW_SHUTDOWN);

    session.close().await;
    assert!(before.elapsed() >= SLOW_SHUTDOWN);
}

#[tokio::test(start_paused = true)]
async fn session_delivers_nothing_until_listening() {
    let (connector, mut panels) = MockConnector::new();
    let config = test_config().build().unwrap();
    let (tx, mut rx) = event_channel(16);

    let session = Session::connect(&connector, &config, Arc::new(tx)).await.unwrap();
    let mut panel = panels.recv().await.unwrap();
    assert_eq!(panel.read_frame().await, "\x03LI1234");
    panel.write(b"\x03LU01\r").await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());

    session.listen().await;
    assert_eq!(next_message(&mut rx).await.kind(), "user-logged-in");
    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn session_closed_before_listening_stays_silent() {
    let (connector, mut panels) = MockConnector::new();
    let config = test_config().build().unwrap();
    let (tx, mut rx) = event_channel(16);

    let session = Session::connect(&connector, &config, Arc::new(tx)).await.unwrap();
    let mut panel = panels.recv().await.unwrap();
    panel.read_frame().await;
    panel.write(b"\x03LU01\r").await;

    session.close().await;
    session.listen().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(session.state(), SessionState::Closed);
    assert!(rx.try_recv().is_err());

    // Panel sees EOF once the socket is released
    let mut rest = Vec::new();
    panel.stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    drop(session);
    assert_eq!(connector.open_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn read_timeout_sends_keepalive_and_keeps_listening() {
    let (connector, mut panels) = MockConnector::new();
    let config = test_config()
        .read_timeout(Duration::from_secs(30))
        .build()
        .unwrap();
    let (supervisor, _rx) = start(config, &connector);

    let mut panel = panels.recv().await.unwrap();
    assert_eq!(panel.read_frame().await, "\x03LI1234");
    wait_for_state(&supervisor, SupervisorState::Running).await;

    let before = Instant::now();
    assert_eq!(panel.read_frame().await, "\x03cc00");
    assert!(before.elapsed() >= Duration::from_secs(30));

    // Still the same session
    assert_eq!(supervisor.state(), SupervisorState::Running);
    assert_eq!(supervisor.connection_state(), ConnectionState::Up);
    supervisor.dispatcher().query_zones().await.unwrap();
    assert_eq!(panel.read_frame().await, "\x03Z?");
    assert_eq!(connector.attempts(), 1);

    supervisor.stop().await;
}

// =========================================================================
// Event delivery
// =========================================================================

#[tokio::test(start_paused = true)]
async fn frames_delivered_in_order_across_chunks() {
    let (connector, mut panels) = MockConnector::new();
    let (supervisor, mut rx) = start(test_config().build().unwrap(), &connector);

    let mut panel = panels.recv().await.unwrap();
    panel.read_frame().await;

    panel.write(b"\x03LU01\r\x03Z?").await;
    panel.write(b"0580\r\x03M?0").await;
    panel.write(b"1\r\x03IP0101\r").await;

    let login = next_message(&mut rx).await;
    assert_eq!(login.kind(), "user-logged-in");
    assert_eq!(login.fields().get("user").map(String::as_str), Some("1"));

    let zones = next_message(&mut rx).await;
    assert_eq!(zones.kind(), "zone-state");
    assert_eq!(zones.fields().get("active").map(String::as_str), Some("1,3,16"));

    let mode = next_message(&mut rx).await;
    assert_eq!(mode.kind(), "security-mode");
    assert_eq!(mode.fields().get("mode_name").map(String::as_str), Some("away"));

    let raw = next_message(&mut rx).await;
    assert_eq!(raw.kind(), "raw");
    assert_eq!(raw.text, "IP0101");

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn connection_states_reported_to_sink() {
    let (connector, mut panels) = MockConnector::new();
    let (supervisor, mut rx) = start(test_config().build().unwrap(), &connector);

    let mut panel = panels.recv().await.unwrap();
    panel.read_frame().await;

    assert_eq!(next_connection_state(&mut rx).await, ConnectionState::Connecting);
    assert_eq!(next_connection_state(&mut rx).await, ConnectionState::Up);

    supervisor.stop().await;
    assert_eq!(next_connection_state(&mut rx).await, ConnectionState::Down);
}

#[tokio::test(start_paused = true)]
async fn connection_up_reported_before_first_frame() {
    let (connector, mut panels) = MockConnector::new();
    let (supervisor, mut rx) = start(test_config().build().unwrap(), &connector);

    // The panel answers the login before the client has done anything else
    let mut panel = panels.recv().await.unwrap();
    panel.read_frame().await;
    panel.write(b"\x03LU01\r").await;

    let mut seen = Vec::new();
    while seen.len() < 3 {
        seen.push(rx.recv().await.unwrap());
    }
    assert_eq!(seen[0], PanelEvent::ConnectionState(ConnectionState::Connecting));
    assert_eq!(seen[1], PanelEvent::ConnectionState(ConnectionState::Up));
    assert!(
        matches!(&seen[2], PanelEvent::Message(msg) if msg.kind() == "user-logged-in"),
        "got {:?}",
        seen[2]
    );

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn bootstrap_queries_follow_login() {
    let (connector, mut panels) = MockConnector::new();
    let config = test_config().bootstrap_queries(true).build().unwrap();
    let (supervisor, _rx) = start(config, &connector);

    let mut panel = panels.recv().await.unwrap();
    assert_eq!(panel.read_frame().await, "\x03LI1234");
    assert_eq!(panel.read_frame().await, "\x03M?");
    assert_eq!(panel.read_frame().await, "\x03Z?");

    supervisor.stop().await;
}

// =========================================================================
// Reconnect
// =========================================================================

#[tokio::test(start_paused = true)]
async fn reset_triggers_exactly_one_reconnect_after_delay() {
    let (connector, mut panels) = MockConnector::new();
    let (supervisor, _rx) = start(test_config().build().unwrap(), &connector);

    let mut first = panels.recv().await.unwrap();
    first.read_frame().await;
    wait_for_state(&supervisor, SupervisorState::Running).await;

    let before = Instant::now();
    first.reset().await;

    let mut second = panels.recv().await.unwrap();
    let waited = before.elapsed();
    assert!(
        waited >= Duration::from_secs(5) && waited < Duration::from_secs(6),
        "reconnected after {:?}",
        waited
    );
    assert_eq!(second.read_frame().await, "\x03LI1234");
    assert_eq!(connector.attempts(), 2);

    // The old socket is gone and nothing else reconnects
    wait_for_state(&supervisor, SupervisorState::Running).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(connector.open_streams(), 1);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn write_failure_returns_error_and_reconnects_once() {
    let (connector, mut panels) = MockConnector::new();
    let (supervisor, _rx) = start(test_config().build().unwrap(), &connector);

    let mut first = panels.recv().await.unwrap();
    first.read_frame().await;
    wait_for_state(&supervisor, SupervisorState::Running).await;

    first.fail_writes();
    let before = Instant::now();
    let err = supervisor.dispatcher().send_message("M?").await.unwrap_err();
    assert!(matches!(err, ComfortError::Write(_)), "got {:?}", err);
    assert!(err.is_retryable());

    let mut second = panels.recv().await.unwrap();
    let waited = before.elapsed();
    assert!(
        waited >= Duration::from_secs(5) && waited < Duration::from_secs(6),
        "reconnected after {:?}",
        waited
    );
    assert_eq!(second.read_frame().await, "\x03LI1234");

    wait_for_state(&supervisor, SupervisorState::Running).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 2);

    supervisor.dispatcher().query_zones().await.unwrap();
    assert_eq!(second.read_frame().await, "\x03Z?");

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn peer_close_triggers_reconnect() {
    let (connector, mut panels) = MockConnector::new();
    let (supervisor, _rx) = start(test_config().build().unwrap(), &connector);

    let mut first = panels.recv().await.unwrap();
    first.read_frame().await;
    drop(first);

    let mut second = panels.recv().await.unwrap();
    assert_eq!(second.read_frame().await, "\x03LI1234");
    assert_eq!(connector.attempts(), 2);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_connects_back_off() {
    let (connector, mut panels) = MockConnector::new();
    connector.fail_next(3);
    let config = test_config().max_backoff_exponent(2).build().unwrap();

    let before = Instant::now();
    let (supervisor, _rx) = start(config, &connector);

    let mut panel = panels.recv().await.unwrap();
    // 5s + 10s + 20s
    let waited = before.elapsed();
    assert!(
        waited >= Duration::from_secs(35) && waited < Duration::from_secs(36),
        "connected after {:?}",
        waited
    );
    assert_eq!(connector.attempts(), 4);
    assert_eq!(panel.read_frame().await, "\x03LI1234");

    supervisor.stop().await;
}

// =========================================================================
// Stop
// =========================================================================

#[tokio::test(start_paused = true)]
async fn stop_then_close_ends_stopped() {
    let (connector, mut panels) = MockConnector::new();
    let (supervisor, _rx) = start(test_config().build().unwrap(), &connector);

    let mut panel = panels.recv().await.unwrap();
    panel.read_frame().await;
    wait_for_state(&supervisor, SupervisorState::Running).await;

    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(supervisor.connection_state(), ConnectionState::Down);
    assert_eq!(connector.open_streams(), 0);

    // The panel closing afterwards changes nothing
    drop(panel);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn close_then_stop_ends_stopped() {
    let (connector, mut panels) = MockConnector::new();
    let (supervisor, _rx) = start(test_config().build().unwrap(), &connector);

    let mut panel = panels.recv().await.unwrap();
    panel.read_frame().await;
    wait_for_state(&supervisor, SupervisorState::Running).await;

    drop(panel);
    supervisor.stop().await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(connector.attempts(), 1);
    assert_eq!(connector.open_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_retry_delay() {
    let (connector, _panels) = MockConnector::new();
    connector.fail_always();
    let config = test_config()
        .retry_delay(Duration::from_secs(600))
        .build()
        .unwrap();
    let (supervisor, _rx) = start(config, &connector);

    wait_for_state(&supervisor, SupervisorState::Reconnecting).await;

    let before = Instant::now();
    supervisor.stop().await;
    assert!(before.elapsed() < Duration::from_secs(1));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_during_connect_discards_attempt() {
    let (connector, _panels) = MockConnector::new();
    connector.hang();
    let (supervisor, _rx) = start(test_config().build().unwrap(), &connector);

    while connector.attempts() == 0 {
        tokio::task::yield_now().await;
    }

    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(connector.open_streams(), 0);
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn start_twice_and_after_stop_rejected() {
    let (connector, _panels) = MockConnector::new();
    connector.fail_always();
    let (supervisor, _rx) = start(test_config().build().unwrap(), &connector);

    assert!(matches!(supervisor.start(), Err(ComfortError::AlreadyStarted)));
    supervisor.stop().await;
    assert!(matches!(supervisor.start(), Err(ComfortError::Stopped)));
}

#[tokio::test]
async fn invalid_config_rejected_before_connect() {
    let (connector, _panels) = MockConnector::new();
    let config = ConnectionConfig {
        pin: String::new(),
        ..ConnectionConfig::default()
    };
    let (tx, _rx) = event_channel(1);

    let result = Supervisor::new(config, connector.clone(), Arc::new(tx));
    assert!(matches!(result, Err(ComfortError::Config(_))));
    assert_eq!(connector.attempts(), 0);
}

// =========================================================================
// Dispatcher
// =========================================================================

#[tokio::test(start_paused = true)]
async fn dispatcher_rejects_before_start_and_after_stop() {
    let (connector, _panels) = MockConnector::new();
    let (tx, _rx) = event_channel(16);
    let supervisor =
        Supervisor::new(test_config().build().unwrap(), connector.clone(), Arc::new(tx)).unwrap();
    let dispatcher = supervisor.dispatcher();

    let err = dispatcher.send_message("M?").await.unwrap_err();
    assert!(matches!(err, ComfortError::NotConnected), "got {:?}", err);

    supervisor.stop().await;
    let err = dispatcher.send_message("M?").await.unwrap_err();
    assert!(matches!(err, ComfortError::Stopped), "got {:?}", err);
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn dispatcher_rejects_malformed_commands() {
    let (connector, mut panels) = MockConnector::new();
    let (supervisor, _rx) = start(test_config().build().unwrap(), &connector);
    panels.recv().await.unwrap().read_frame().await;
    let dispatcher = supervisor.dispatcher();

    for text in ["", "M?\rLI0000", "\x03Z?"] {
        let err = dispatcher.send_message(text).await.unwrap_err();
        assert!(matches!(err, ComfortError::InvalidCommand { .. }), "got {:?}", err);
    }
    let err = dispatcher
        .send(&Command::Login {
            pin: "0000".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ComfortError::InvalidCommand { .. }), "got {:?}", err);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dispatcher_signals_not_connected_after_wait() {
    let (connector, _panels) = MockConnector::new();
    connector.fail_always();
    let (supervisor, _rx) = start(test_config().build().unwrap(), &connector);
    wait_for_state(&supervisor, SupervisorState::Reconnecting).await;

    let before = Instant::now();
    let err = supervisor.dispatcher().query_security_mode().await.unwrap_err();
    assert!(matches!(err, ComfortError::NotConnected), "got {:?}", err);
    assert!(err.is_retryable());

    let waited = before.elapsed();
    assert!(
        waited >= Duration::from_secs(2) && waited < Duration::from_secs(3),
        "gave up after {:?}",
        waited
    );
    // The waiting command cut the retry delay short once
    assert_eq!(connector.attempts(), 2);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dispatcher_wakes_supervisor_and_sends() {
    let (connector, mut panels) = MockConnector::new();
    connector.fail_next(1);
    let config = test_config()
        .retry_delay(Duration::from_secs(60))
        .command_wait(Duration::from_secs(5))
        .build()
        .unwrap();
    let (supervisor, _rx) = start(config, &connector);
    wait_for_state(&supervisor, SupervisorState::Reconnecting).await;

    let before = Instant::now();
    let dispatcher = supervisor.dispatcher();
    let send = tokio::spawn(async move { dispatcher.query_zones().await });

    let mut panel = panels.recv().await.unwrap();
    assert_eq!(panel.read_frame().await, "\x03LI1234");
    assert_eq!(panel.read_frame().await, "\x03Z?");
    send.await.unwrap().unwrap();

    assert!(before.elapsed() < Duration::from_secs(5));
    assert_eq!(connector.attempts(), 2);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dispatcher_wakes_supervisor_still_tearing_down() {
    let (connector, mut panels) = MockConnector::new();
    connector.slow_shutdown();
    let config = test_config()
        .retry_delay(Duration::from_secs(60))
        .command_wait(Duration::from_secs(5))
        .build()
        .unwrap();
    let (supervisor, _rx) = start(config, &connector);

    let mut first = panels.recv().await.unwrap();
    first.read_frame().await;
    wait_for_state(&supervisor, SupervisorState::Running).await;

    let before = Instant::now();
    first.reset().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    // The dead session is still being shut down
    assert_eq!(supervisor.state(), SupervisorState::Running);

    let dispatcher = supervisor.dispatcher();
    let send = tokio::spawn(async move { dispatcher.query_zones().await });

    let mut second = panels.recv().await.unwrap();
    assert_eq!(second.read_frame().await, "\x03LI1234");
    assert_eq!(second.read_frame().await, "\x03Z?");
    send.await.unwrap().unwrap();

    let waited = before.elapsed();
    assert!(
        waited >= SLOW_SHUTDOWN && waited < Duration::from_secs(2),
        "reconnected after {:?}",
        waited
    );
    assert_eq!(connector.attempts(), 2);

    supervisor.stop().await;
}
