// MIT License
// Comfort LAN bridge

use std::time::Duration;

/// Protocol framing bytes.
pub const CONTROL: u8 = 0x03; // Leads every outbound frame
pub const TERMINATOR: u8 = b'\r'; // Ends every frame, both directions

/// Two-letter command codes used by the bridge.
pub const CMD_LOGIN: &str = "LI";
pub const CMD_SECURITY_MODE_QUERY: &str = "M?";
pub const CMD_ZONE_QUERY: &str = "Z?";
pub const CMD_KEEPALIVE: &str = "cc00";

/// Type codes of inbound frames the classifier understands.
pub const TYPE_USER_LOGGED_IN: &str = "LU";
pub const TYPE_SECURITY_MODE: &str = "M?";
pub const TYPE_ZONE_REPORT: &str = "Z?";
pub const TYPE_ZONE: &str = "Z";
pub const TYPE_KEEPALIVE_ACK: &str = "cc";

/// Comfort UCM/Ethernet module default listening port.
pub const DEFAULT_PORT: u16 = 1001;
pub const DEFAULT_HOST: &str = "192.168.1.100";
pub const DEFAULT_NAME: &str = "Comfort Alarm";
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_COMMAND_WAIT: Duration = Duration::from_secs(5);
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Upper bound on the retry backoff exponent (delay * 2^10 at most).
pub const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Floor for the unterminated-tail cap; see [`crate::codec::FrameBuffer`].
pub const MIN_PARTIAL_FRAME_LIMIT: usize = 16 * 1024;

/// Capacity of the broadcast channel behind [`crate::event::event_channel`].
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Security modes reported in `M?` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecurityMode {
    Off = 0,
    Away = 1,
    Night = 2,
    Day = 3,
    Vacation = 4,
}

impl SecurityMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Off),
            1 => Some(Self::Away),
            2 => Some(Self::Night),
            3 => Some(Self::Day),
            4 => Some(Self::Vacation),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Away => "away",
            Self::Night => "night",
            Self::Day => "day",
            Self::Vacation => "vacation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_mode_lookup() {
        assert_eq!(SecurityMode::from_u8(0), Some(SecurityMode::Off));
        assert_eq!(SecurityMode::from_u8(4), Some(SecurityMode::Vacation));
        assert_eq!(SecurityMode::from_u8(5), None);
        assert_eq!(SecurityMode::Night.name(), "night");
    }
}
