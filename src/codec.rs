// MIT License
// Comfort LAN bridge

//! Carriage-return framing for the Comfort ASCII protocol.
//!
//! Outbound frames are `0x03` + command + `\r`. Inbound frames are whatever the
//! panel sends up to each `\r`. Everything here is pure: no I/O.

use tracing::warn;

use crate::constants::{CMD_LOGIN, CONTROL, MIN_PARTIAL_FRAME_LIMIT, TERMINATOR};

/// Encode the login frame: `\x03LI<pin>\r`.
///
/// The PIN is sent verbatim; config validation guarantees it carries no `\r`.
pub fn encode_login(pin: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pin.len() + 4);
    frame.push(CONTROL);
    frame.extend_from_slice(CMD_LOGIN.as_bytes());
    frame.extend_from_slice(pin.as_bytes());
    frame.push(TERMINATOR);
    frame
}

/// Encode a command frame: `\x03<body>\r`. The body carries the command code
/// and its arguments.
pub fn encode_command(body: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 2);
    frame.push(CONTROL);
    frame.extend_from_slice(body.as_bytes());
    frame.push(TERMINATOR);
    frame
}

/// Split a buffer on `\r`.
///
/// Returns every complete record with its terminator stripped, in order, plus the
/// unterminated tail (possibly empty) to be fed back in front of the next read.
pub fn split(buffer: &[u8]) -> (Vec<Vec<u8>>, Vec<u8>) {
    let mut frames = Vec::new();
    let mut start = 0;

    for (i, &b) in buffer.iter().enumerate() {
        if b == TERMINATOR {
            frames.push(buffer[start..i].to_vec());
            start = i + 1;
        }
    }

    (frames, buffer[start..].to_vec())
}

/// Decode a frame as text. Invalid UTF-8 is replaced, never rejected: line noise
/// must not take the reader down.
pub fn decode_text(frame: &[u8]) -> String {
    String::from_utf8_lossy(frame).into_owned()
}

/// Per-session accumulation buffer.
///
/// Holds only the unterminated tail of the byte stream; every `\r`-terminated
/// prefix is handed out by [`FrameBuffer::push`] exactly once, in order.
#[derive(Debug)]
pub struct FrameBuffer {
    pending: Vec<u8>,
    limit: usize,
}

impl FrameBuffer {
    /// `buffer_size` is the configured read size; the tail cap scales with it.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            pending: Vec::with_capacity(buffer_size),
            limit: buffer_size.saturating_mul(4).max(MIN_PARTIAL_FRAME_LIMIT),
        }
    }

    /// Append freshly read bytes and return the frames they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(data);
        let (frames, remainder) = split(&self.pending);
        self.pending = remainder;

        if self.pending.len() > self.limit {
            warn!(
                "Discarding {} bytes of unterminated data (limit {})",
                self.pending.len(),
                self.limit
            );
            self.pending.clear();
        }

        frames
    }

    /// Bytes waiting for a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Drop any partial frame. Used when the stream breaks mid-record.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
