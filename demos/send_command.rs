//! Example: Send a raw command to a Comfort panel and show the reply.
//!
//! Usage: cargo run --example send_command -- 192.168.1.100 1234 M?

use std::sync::Arc;
use std::time::Duration;

use comfort_lan_bridge::{ConnectionConfig, PanelEvent, Supervisor, event_channel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "192.168.1.100".to_string());
    let pin = args.next().unwrap_or_else(|| "1234".to_string());
    let command = args.next().unwrap_or_else(|| "M?".to_string());

    let config = ConnectionConfig::builder()
        .host(host)
        .pin(pin)
        .bootstrap_queries(false)
        .command_wait(Duration::from_secs(10))
        .build()?;

    let (events, mut rx) = event_channel(64);
    let supervisor = Supervisor::tcp(config, Arc::new(events))?;
    supervisor.start()?;

    // Waits for the first connection before sending
    println!("Sending {command}...");
    match supervisor.dispatcher().send_message(&command).await {
        Ok(()) => println!("Sent"),
        Err(e) => println!("Error sending {command}: {e}"),
    }

    // Print whatever the panel says over the next few seconds
    let listen = tokio::time::sleep(Duration::from_secs(3));
    tokio::pin!(listen);
    loop {
        tokio::select! {
            _ = &mut listen => break,
            event = rx.recv() => match event {
                Ok(PanelEvent::Message(msg)) => println!("{:16} {}", msg.kind(), msg.text),
                Ok(PanelEvent::ConnectionState(_)) => {}
                Err(_) => break,
            },
        }
    }

    supervisor.stop().await;
    Ok(())
}
