//! Example: Connect to a Comfort panel and print everything it reports.

use std::sync::Arc;

use comfort_lan_bridge::{ConnectionConfig, PanelEvent, PanelMessage, Supervisor, event_channel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ConnectionConfig::builder()
        .host("192.168.1.100")
        .port(1001)
        .pin("1234")
        .name("Comfort Alarm")
        .build()?;

    let (events, mut rx) = event_channel(64);
    let supervisor = Supervisor::tcp(config, Arc::new(events))?;

    println!("Connecting to panel...");
    supervisor.start()?;

    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                PanelEvent::ConnectionState(state) => println!("Connection: {state}"),
                PanelEvent::Message(msg) => match &msg.message {
                    PanelMessage::ZoneReport { zones } => {
                        let active: Vec<String> = comfort_lan_bridge::protocol::active_zones(zones)
                            .map(|z| z.to_string())
                            .collect();
                        println!("Zones ({}): active [{}]", zones.len(), active.join(", "));
                    }
                    PanelMessage::KeepaliveAck { .. } => {}
                    _ => println!("{:16} {:?}  ({})", msg.kind(), msg.fields(), msg.text),
                },
            }
        }
    });

    println!("Press Ctrl+C to disconnect...");
    tokio::signal::ctrl_c().await?;
    supervisor.stop().await;
    drop(supervisor);
    let _ = printer.await;
    println!("Disconnected.");

    Ok(())
}
