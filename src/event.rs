// MIT License
// Comfort LAN bridge

use std::fmt;

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::protocol::ParsedEvent;

/// Connection state as seen by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// A connect attempt is in flight
    Connecting,
    /// Logged in and listening
    Up,
    /// No live session; a retry is pending or the client is stopped
    Down,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of everything the client observes.
///
/// Both methods are called from the session read loop or the supervisor task
/// and must return promptly: hand work off, do not block.
pub trait EventSink: Send + Sync + 'static {
    /// A frame was received and classified.
    fn on_event(&self, event: &ParsedEvent);

    /// The connection moved to a new state.
    fn on_connection_state(&self, state: ConnectionState);
}

/// Events emitted on the broadcast channel.
///
/// The receiver returned by [`event_channel`] yields these; its sender is the
/// [`EventSink`] handed to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelEvent {
    /// Connection state changed
    ConnectionState(ConnectionState),
    /// A classified frame from the panel
    Message(ParsedEvent),
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<PanelEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<PanelEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}

/// Create an event channel with the default capacity.
pub fn default_event_channel() -> (EventSender, EventReceiver) {
    event_channel(EVENT_CHANNEL_CAPACITY)
}

// Sending on a broadcast channel never blocks; with no subscribers the event is
// simply dropped.
impl EventSink for EventSender {
    fn on_event(&self, event: &ParsedEvent) {
        let _ = self.send(PanelEvent::Message(event.clone()));
    }

    fn on_connection_state(&self, state: ConnectionState) {
        let _ = self.send(PanelEvent::ConnectionState(state));
    }
}
