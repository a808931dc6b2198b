// MIT License
// Comfort LAN bridge

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::constants::{CONTROL, TERMINATOR};
use crate::error::{ComfortError, Result};
use crate::protocol::Command;
use crate::supervisor::{Inner, SupervisorState};
use crate::transport::Session;

/// Sends commands through whichever session the supervisor currently holds.
///
/// Cheap to clone. Commands are never queued: if no session comes up within
/// `command_wait`, the caller gets [`ComfortError::NotConnected`] and decides
/// whether to try again.
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<Inner>,
}

impl CommandDispatcher {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Send a raw command (code plus arguments, no framing).
    pub async fn send_message(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Err(ComfortError::InvalidCommand {
                reason: "command is empty",
            });
        }
        if text.bytes().any(|b| b == TERMINATOR || b == CONTROL) {
            return Err(ComfortError::InvalidCommand {
                reason: "command contains framing bytes",
            });
        }

        let session = self.live_session().await?;
        session.send(text).await
    }

    /// Send a typed command. Login is handled by the session itself and is
    /// refused here.
    pub async fn send(&self, command: &Command) -> Result<()> {
        if let Command::Login { .. } = command {
            return Err(ComfortError::InvalidCommand {
                reason: "login is sent automatically on connect",
            });
        }
        self.send_message(&command.to_wire_string()).await
    }

    /// Ask the panel for its security mode (`M?`).
    pub async fn query_security_mode(&self) -> Result<()> {
        self.send(&Command::SecurityModeQuery).await
    }

    /// Ask the panel for every zone state (`Z?`).
    pub async fn query_zones(&self) -> Result<()> {
        self.send(&Command::ZoneQuery).await
    }

    /// Send a keepalive (`cc00`) now.
    pub async fn keepalive(&self) -> Result<()> {
        self.send(&Command::Keepalive).await
    }

    /// The listening session, waking the supervisor and waiting up to
    /// `command_wait` for one if there is none right now.
    async fn live_session(&self) -> Result<Arc<Session>> {
        if let Some(session) = self.inner.live_session().await {
            return Ok(session);
        }

        let mut rx = self.inner.state.subscribe();
        let state = *rx.borrow_and_update();
        match state {
            SupervisorState::Idle => return Err(ComfortError::NotConnected),
            SupervisorState::Stopped => return Err(ComfortError::Stopped),
            _ if self.inner.is_stopping() => return Err(ComfortError::Stopped),
            _ => {}
        }

        debug!("No live session, waking supervisor");
        let attempts = self.inner.attempts();
        self.inner.wake.notify_waiters();

        let wait = self.inner.config.command_wait;
        let waited = timeout(wait, async {
            loop {
                if let Some(session) = self.inner.live_session().await {
                    return Ok(session);
                }
                let state = *rx.borrow_and_update();
                if state == SupervisorState::Stopped || self.inner.is_stopping() {
                    return Err(ComfortError::Stopped);
                }
                // The supervisor only hears a wake while it sleeps between
                // attempts. Repeat it there until one attempt has started.
                if state == SupervisorState::Reconnecting && self.inner.attempts() == attempts {
                    self.inner.wake.notify_waiters();
                }
                if rx.changed().await.is_err() {
                    return Err(ComfortError::Stopped);
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "No connection to {} after {:.1}s, command not sent",
                    self.inner.config.name,
                    wait.as_secs_f64()
                );
                Err(ComfortError::NotConnected)
            }
        }
    }
}
