// MIT License
// MQTT bridge

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use comfort_lan_bridge::{
    ComfortError, CommandDispatcher, ConnectionConfig, ConnectionState, PanelEvent, ParsedEvent,
    Supervisor, default_event_channel,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "comfort2mqtt")]
#[command(about = "Bridge between a Comfort alarm panel and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Config {
    panel: PanelToml,
    mqtt: MqttToml,
}

// No Debug: carries the PIN.
#[derive(Deserialize)]
struct PanelToml {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    pin: String,
    #[serde(default = "default_read_timeout")]
    read_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_secs: u64,
    #[serde(default = "default_retry_delay")]
    retry_delay_secs: u64,
    #[serde(default)]
    max_backoff_exponent: u32,
    #[serde(default = "default_buffer_size")]
    buffer_size: usize,
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_bootstrap_queries")]
    bootstrap_queries: bool,
    #[serde(default = "default_command_wait")]
    command_wait_secs: u64,
}

fn default_host() -> String {
    comfort_lan_bridge::constants::DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    comfort_lan_bridge::constants::DEFAULT_PORT
}
fn default_read_timeout() -> u64 {
    comfort_lan_bridge::constants::DEFAULT_READ_TIMEOUT.as_secs()
}
fn default_connect_timeout() -> u64 {
    comfort_lan_bridge::constants::DEFAULT_CONNECT_TIMEOUT.as_secs()
}
fn default_retry_delay() -> u64 {
    comfort_lan_bridge::constants::DEFAULT_RETRY_DELAY.as_secs()
}
fn default_buffer_size() -> usize {
    comfort_lan_bridge::constants::DEFAULT_BUFFER_SIZE
}
fn default_name() -> String {
    comfort_lan_bridge::constants::DEFAULT_NAME.to_string()
}
fn default_bootstrap_queries() -> bool {
    true
}
fn default_command_wait() -> u64 {
    comfort_lan_bridge::constants::DEFAULT_COMMAND_WAIT.as_secs()
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    /// Defaults to the panel id with spaces replaced.
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default = "default_subscribe_topic")]
    subscribe_topic: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
}

fn default_subscribe_topic() -> String {
    "comfort/cmd".to_string()
}
fn default_publish_topic() -> String {
    "comfort".to_string()
}

fn build_panel_config(toml: &PanelToml) -> Result<ConnectionConfig> {
    ConnectionConfig::builder()
        .host(&toml.host)
        .port(toml.port)
        .pin(&toml.pin)
        .read_timeout(Duration::from_secs(toml.read_timeout_secs))
        .connect_timeout(Duration::from_secs(toml.connect_timeout_secs))
        .retry_delay(Duration::from_secs(toml.retry_delay_secs))
        .max_backoff_exponent(toml.max_backoff_exponent)
        .buffer_size(toml.buffer_size)
        .name(&toml.name)
        .bootstrap_queries(toml.bootstrap_queries)
        .command_wait(Duration::from_secs(toml.command_wait_secs))
        .build()
        .context("Invalid panel configuration")
}

/// Everything the bridge needs from one parse of the config file.
struct Settings {
    panel: ConnectionConfig,
    mqtt_host: String,
    mqtt_port: u16,
    client_id: String,
    subscribe_topic: String,
    publish_topic: String,
}

fn load_settings(path: &str) -> Result<Settings> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    let config: Config = toml::from_str(&text).context("Failed to parse config file")?;

    let panel = build_panel_config(&config.panel)?;
    let (mqtt_host, mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;
    let client_id = config
        .mqtt
        .client_id
        .unwrap_or_else(|| panel.id().replace(char::is_whitespace, "-"));

    Ok(Settings {
        panel,
        mqtt_host,
        mqtt_port,
        client_id,
        subscribe_topic: config.mqtt.subscribe_topic,
        publish_topic: config.mqtt.publish_topic,
    })
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages share a flat {now, op, ...} structure

#[derive(Serialize)]
struct MqttPanelMessage<'a> {
    now: u64,
    op: &'static str,
    kind: &'static str,
    fields: BTreeMap<String, String>,
    message: &'a str,
}

#[derive(Serialize)]
struct MqttConnectionState {
    now: u64,
    op: &'static str,
    state: &'static str,
}

#[derive(Serialize)]
struct MqttCmdAck {
    now: u64,
    op: &'static str,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    op_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// Inbound command (subscribed)
#[derive(Deserialize)]
struct MqttCommand {
    op: String,
    // Echoed in the CMD_ACK so callers can match replies to requests
    #[serde(default)]
    op_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

async fn publish_json(client: &AsyncClient, topic: &str, payload: &impl Serialize, retain: bool) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, retain, json).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        Err(e) => error!("Failed to serialize MQTT payload: {e}"),
    }
}

async fn publish_panel_message(client: &AsyncClient, topic: &str, event: &ParsedEvent) {
    let msg = MqttPanelMessage {
        now: now_epoch_ms(),
        op: "PANEL_MESSAGE",
        kind: event.kind(),
        fields: event.fields(),
        message: &event.text,
    };
    publish_json(client, topic, &msg, false).await;
}

// Retained, so a subscriber arriving later sees whether the panel is up.
async fn publish_connection_state(client: &AsyncClient, topic: &str, state: ConnectionState) {
    let msg = MqttConnectionState {
        now: now_epoch_ms(),
        op: "CONNECTION_STATE",
        state: state.as_str(),
    };
    publish_json(client, topic, &msg, true).await;
}

async fn publish_cmd_ack(
    client: &AsyncClient,
    topic: &str,
    op_id: Option<String>,
    src: Option<serde_json::Value>,
    result: std::result::Result<(), ComfortError>,
) {
    let msg = MqttCmdAck {
        now: now_epoch_ms(),
        op: "CMD_ACK",
        success: result.is_ok(),
        op_id,
        src,
        error: result.err().map(|e| e.to_string()),
    };
    publish_json(client, topic, &msg, false).await;
}

// ---------------------------------------------------------------------------
// Panel event → MQTT
// ---------------------------------------------------------------------------

async fn handle_panel_event(event: PanelEvent, client: &AsyncClient, topic: &str) {
    match event {
        PanelEvent::ConnectionState(state) => {
            info!("Panel connection {state}");
            publish_connection_state(client, topic, state).await;
        }
        PanelEvent::Message(msg) => {
            // Keepalive echoes arrive every idle read timeout; not worth an MQTT message.
            if msg.kind() == "keepalive-ack" {
                debug!("Keepalive acknowledged");
                return;
            }
            publish_panel_message(client, topic, &msg).await;
        }
    }
}

// ---------------------------------------------------------------------------
// MQTT command handler
// ---------------------------------------------------------------------------

async fn handle_command(
    payload_str: &str,
    cmd: MqttCommand,
    client: &AsyncClient,
    topic: &str,
    dispatcher: &CommandDispatcher,
) {
    // Parse the raw payload as a JSON value for the CMD_ACK src field
    let src_json = serde_json::from_str::<serde_json::Value>(payload_str).ok();

    let result = match cmd.op.as_str() {
        "PING" => {
            info!("Command: PING");
            Ok(())
        }
        "SEND_MESSAGE" => match cmd.message.as_deref() {
            Some(text) => {
                info!("Command: SEND_MESSAGE {text}");
                dispatcher.send_message(text).await
            }
            None => {
                warn!("SEND_MESSAGE: missing message");
                Err(ComfortError::InvalidCommand {
                    reason: "missing message",
                })
            }
        },
        "QUERY_MODE" => {
            info!("Command: QUERY_MODE");
            dispatcher.query_security_mode().await
        }
        "QUERY_ZONES" => {
            info!("Command: QUERY_ZONES");
            dispatcher.query_zones().await
        }
        other => {
            warn!("Unknown command: {other}");
            Err(ComfortError::InvalidCommand {
                reason: "unknown op",
            })
        }
    };

    if let Err(e) = &result {
        warn!("{} failed: {e}", cmd.op);
    }
    publish_cmd_ack(client, topic, cmd.op_id, src_json, result).await;
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=comfort_lan_bridge=debug).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let mut settings = load_settings(&cli.config)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        // Start the panel client; it connects and reconnects in the background
        let (events, event_rx) = default_event_channel();
        let supervisor = Supervisor::tcp(settings.panel.clone(), Arc::new(events))?;
        supervisor.start()?;
        let dispatcher = supervisor.dispatcher();

        // Set up MQTT
        let mut mqtt_opts =
            MqttOptions::new(&settings.client_id, &settings.mqtt_host, settings.mqtt_port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

        // Subscribe to command topic
        client
            .subscribe(&settings.subscribe_topic, QoS::AtLeastOnce)
            .await
            .context("Failed to subscribe to MQTT topic")?;
        info!("MQTT: subscribed to {}", settings.subscribe_topic);

        // Task 1: Panel event listener
        let client_events = client.clone();
        let topic_events = settings.publish_topic.clone();
        let shutdown = CancellationToken::new();
        let listener_shutdown = shutdown.clone();
        let event_handle = tokio::spawn(async move {
            let mut rx = event_rx;
            loop {
                let received = tokio::select! {
                    biased;
                    received = rx.recv() => received,
                    _ = listener_shutdown.cancelled() => {
                        // The supervisor has stopped; publish what it left behind.
                        while let Ok(event) = rx.try_recv() {
                            handle_panel_event(event, &client_events, &topic_events).await;
                        }
                        break;
                    }
                };
                match received {
                    Ok(event) => handle_panel_event(event, &client_events, &topic_events).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event receiver lagged, missed {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("Event channel closed");
                        break;
                    }
                }
            }
        });

        // Task 2: MQTT event loop (receives messages, handles commands)
        let client_cmds = client.clone();
        let topic_cmds = settings.publish_topic.clone();
        let sub_topic = settings.subscribe_topic.clone();
        let mut mqtt_handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // (Re)subscribe after every broker connect/reconnect.
                        // rumqttc does not auto-resubscribe.
                        info!("MQTT: connected, subscribing to {sub_topic}");
                        if let Err(e) = client_cmds.subscribe(&sub_topic, QoS::AtLeastOnce).await
                        {
                            error!("Failed to subscribe to {sub_topic}: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        if msg.topic == sub_topic {
                            let payload = String::from_utf8_lossy(&msg.payload);
                            match serde_json::from_str::<MqttCommand>(&payload) {
                                Ok(cmd) => {
                                    if cmd.op == "PING" {
                                        debug!("MQTT command received: {payload}");
                                    } else {
                                        info!("MQTT command received: {payload}");
                                    }
                                    // Commands may wait for a reconnect; don't stall the event loop.
                                    let client = client_cmds.clone();
                                    let topic = topic_cmds.clone();
                                    let dispatcher = dispatcher.clone();
                                    let payload = payload.into_owned();
                                    tokio::spawn(async move {
                                        handle_command(&payload, cmd, &client, &topic, &dispatcher)
                                            .await;
                                    });
                                }
                                Err(e) => {
                                    warn!("Failed to parse MQTT command: {e}");
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        // Wait for a signal
        info!("MQTT bridge running. Send SIGHUP to restart, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                true
            }
        };

        // Stop the panel client first so the final "down" state reaches MQTT
        supervisor.stop().await;
        shutdown.cancel();
        if tokio::time::timeout(Duration::from_secs(2), event_handle).await.is_err() {
            warn!("Event listener did not drain in time");
        }
        if let Err(e) = client.disconnect().await {
            debug!("MQTT disconnect: {e}");
        }
        // Let the event loop flush queued publishes before dropping it
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut mqtt_handle).await;
        mqtt_handle.abort();

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_settings(&cli.config) {
            Ok(new_settings) => {
                settings = new_settings;
                info!("Config reloaded successfully");
            }
            Err(e) => warn!("Failed to reload config, keeping previous: {e:#}"),
        }

        info!("Reconnecting...");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}
