// MIT License
// Comfort LAN bridge
//
//! # comfort-lan-bridge
//!
//! Persistent TCP client for Cytech Comfort alarm panels on the local network.
//!
//! The client logs in with a user PIN, turns the panel's carriage-return framed
//! ASCII protocol into typed events, keeps the link alive and reconnects after
//! any failure until it is explicitly stopped. Commands go out through a
//! [`CommandDispatcher`] bound to whichever session is current.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use comfort_lan_bridge::{ConnectionConfig, PanelEvent, Supervisor, default_event_channel};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConnectionConfig::builder()
//!         .host("192.168.1.100")
//!         .pin("1234")
//!         .build()?;
//!
//!     let (events, mut rx) = default_event_channel();
//!     let supervisor = Supervisor::tcp(config, Arc::new(events))?;
//!     supervisor.start()?;
//!
//!     tokio::spawn(async move {
//!         while let Ok(event) = rx.recv().await {
//!             if let PanelEvent::Message(msg) = event {
//!                 println!("{}: {:?}", msg.kind(), msg.fields());
//!             }
//!         }
//!     });
//!
//!     supervisor.dispatcher().query_zones().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     supervisor.stop().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod protocol;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use config::{ConnectionConfig, ConnectionConfigBuilder};
pub use constants::SecurityMode;
pub use dispatcher::CommandDispatcher;
pub use error::{ComfortError, ConfigError, ConnectError, Result};
pub use event::{
    ConnectionState, EventReceiver, EventSender, EventSink, PanelEvent, default_event_channel,
    event_channel,
};
pub use protocol::{Command, PanelMessage, ParsedEvent, classify};
pub use supervisor::{Supervisor, SupervisorState};
pub use transport::{BoxedStream, Connector, Session, SessionState, TcpConnector};
