// MIT License
// Comfort LAN bridge

use std::collections::BTreeMap;

use tracing::warn;

use crate::codec::{decode_text, encode_command, encode_login};
use crate::constants::{
    CMD_KEEPALIVE, CMD_LOGIN, CMD_SECURITY_MODE_QUERY, CMD_ZONE_QUERY, CONTROL, SecurityMode,
    TYPE_KEEPALIVE_ACK, TYPE_SECURITY_MODE, TYPE_USER_LOGGED_IN, TYPE_ZONE, TYPE_ZONE_REPORT,
};

/// Commands the bridge sends to the Comfort panel.
///
/// # Connection Handshake
///
/// After TCP connect the client sends `LI<pin>` once. It does not wait for the
/// `LU` reply before reading further: the panel may interleave pushed events
/// with the login acknowledgement.
///
/// # Bootstrap
///
/// `M?` and `Z?` are sent after every successful login so the host sees the
/// current security mode and zone states without waiting for a change.
///
/// # Keepalive
///
/// `cc00` is a no-op the panel echoes as `cc..`. It is sent whenever a read
/// times out, which keeps an idle link open and probes its liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `LI<pin>`: log in with a user PIN.
    Login { pin: String },
    /// `M?`: query the current security mode.
    SecurityModeQuery,
    /// `Z?`: query the state of every zone/input.
    ZoneQuery,
    /// `cc00`: keepalive.
    Keepalive,
    /// Raw command string (code plus arguments, no framing).
    Raw(String),
}

impl Command {
    /// Convert the command to its wire string (without framing bytes).
    pub fn to_wire_string(&self) -> String {
        match self {
            Command::Login { pin } => format!("{}{}", CMD_LOGIN, pin),
            Command::SecurityModeQuery => CMD_SECURITY_MODE_QUERY.to_string(),
            Command::ZoneQuery => CMD_ZONE_QUERY.to_string(),
            Command::Keepalive => CMD_KEEPALIVE.to_string(),
            Command::Raw(s) => s.clone(),
        }
    }

    /// Framed bytes ready for the socket.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Login { pin } => encode_login(pin),
            other => encode_command(&other.to_wire_string()),
        }
    }
}

/// Decoded content of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelMessage {
    /// `LUxx`: user `xx` (hex) logged in; 0 means logged out.
    UserLoggedIn { user: u8 },
    /// `M?xx`: security mode report.
    SecurityMode { mode: u8 },
    /// `Z?<hex>`: zone states, one bit per zone, LSB first.
    ZoneReport { zones: Vec<bool> },
    /// `cc..`: keepalive echo.
    KeepaliveAck { payload: String },
    /// Anything not recognized above.
    Raw,
}

/// A classified frame, as handed to the event sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    /// Frame text with the leading control byte removed.
    pub text: String,
    pub message: PanelMessage,
}

impl ParsedEvent {
    /// Event kind name.
    pub fn kind(&self) -> &'static str {
        match self.message {
            PanelMessage::UserLoggedIn { .. } => "user-logged-in",
            PanelMessage::SecurityMode { .. } => "security-mode",
            PanelMessage::ZoneReport { .. } => "zone-state",
            PanelMessage::KeepaliveAck { .. } => "keepalive-ack",
            PanelMessage::Raw => "raw",
        }
    }

    /// Fields recovered from the frame, as a flat string map.
    pub fn fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        match &self.message {
            PanelMessage::UserLoggedIn { user } => {
                fields.insert("user".to_string(), user.to_string());
            }
            PanelMessage::SecurityMode { mode } => {
                fields.insert("mode".to_string(), mode.to_string());
                let name = SecurityMode::from_u8(*mode).map_or("unknown", |m| m.name());
                fields.insert("mode_name".to_string(), name.to_string());
            }
            PanelMessage::ZoneReport { zones } => {
                let active: Vec<String> = active_zones(zones).map(|z| z.to_string()).collect();
                fields.insert("count".to_string(), zones.len().to_string());
                fields.insert("active".to_string(), active.join(","));
            }
            PanelMessage::KeepaliveAck { payload } => {
                fields.insert("payload".to_string(), payload.clone());
            }
            PanelMessage::Raw => {
                fields.insert("text".to_string(), self.text.clone());
            }
        }
        fields
    }
}

/// 1-based numbers of the zones reported active.
pub fn active_zones(zones: &[bool]) -> impl Iterator<Item = usize> + '_ {
    zones
        .iter()
        .enumerate()
        .filter(|(_, on)| **on)
        .map(|(i, _)| i + 1)
}

/// Classify one frame by its leading type code.
///
/// Unknown codes and known codes with unparseable payloads come back as
/// [`PanelMessage::Raw`] with the full text, so nothing is dropped.
pub fn classify(frame: &[u8]) -> ParsedEvent {
    let decoded = decode_text(frame);
    let text = decoded
        .strip_prefix(char::from(CONTROL))
        .unwrap_or(&decoded)
        .to_string();

    let message = match parse_message(&text) {
        Some(message) => message,
        None => {
            if is_known_type(&text) {
                warn!("Malformed {:?} frame from panel", text);
            } else {
                warn!("Unrecognized frame from panel: {:?}", text);
            }
            PanelMessage::Raw
        }
    };

    ParsedEvent { text, message }
}

fn is_known_type(text: &str) -> bool {
    [
        TYPE_USER_LOGGED_IN,
        TYPE_SECURITY_MODE,
        TYPE_ZONE,
        TYPE_KEEPALIVE_ACK,
    ]
    .iter()
    .any(|code| text.starts_with(code))
}

fn parse_message(text: &str) -> Option<PanelMessage> {
    if let Some(rest) = text.strip_prefix(TYPE_USER_LOGGED_IN) {
        return parse_hex_byte(rest).map(|user| PanelMessage::UserLoggedIn { user });
    }
    if let Some(rest) = text.strip_prefix(TYPE_SECURITY_MODE) {
        return parse_hex_byte(rest).map(|mode| PanelMessage::SecurityMode { mode });
    }
    if let Some(rest) = text.strip_prefix(TYPE_ZONE_REPORT) {
        return parse_zone_bitmap(rest).map(|zones| PanelMessage::ZoneReport { zones });
    }
    if let Some(rest) = text.strip_prefix(TYPE_ZONE) {
        if rest.starts_with(|c: char| c.is_ascii_hexdigit()) {
            return parse_zone_bitmap(rest).map(|zones| PanelMessage::ZoneReport { zones });
        }
        return None;
    }
    if let Some(rest) = text.strip_prefix(TYPE_KEEPALIVE_ACK) {
        return Some(PanelMessage::KeepaliveAck {
            payload: rest.to_string(),
        });
    }
    None
}

/// First two characters as a hex byte. Trailing data is ignored.
fn parse_hex_byte(s: &str) -> Option<u8> {
    let digits = s.get(..2)?;
    u8::from_str_radix(digits, 16).ok()
}

/// Hex bitmap, 8 zones per byte, least significant bit first.
fn parse_zone_bitmap(hex: &str) -> Option<Vec<bool>> {
    if hex.is_empty() || hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    let mut zones = Vec::with_capacity(hex.len() * 4);
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16).ok()?;
        for bit in 0..8 {
            zones.push(byte & (1 << bit) != 0);
        }
    }
    Some(zones)
}
