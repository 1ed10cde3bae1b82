// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Control packet bodies are status lines of the form `"<code> <text>\n"`
//! with a three-digit code. The 1xx family carries the per-conversation
//! keepalive sub-protocol; 2xx/5xx are used by the service handshake.

use bytes::Bytes;

use crate::wire::frame::FrameError;

/// Keepalive probe.
pub const SC_PROC_KEEPALIVE: u16 = 100;
pub const SS_PROC_KEEPALIVE: &str = "processor keep alive";

/// Probe acknowledgement.
pub const SC_PROC_ALIVE: u16 = 101;
pub const SS_PROC_ALIVE: &str = "processor is alive";

/// The peer declares the conversation closed.
pub const SC_PROC_DEAD: u16 = 102;
pub const SS_PROC_DEAD: &str = "processor is dead";

/// Generic success for the service handshake.
pub const SC_OK: u16 = 200;
pub const SS_OK: &str = "OK";

/// Conversation-initiation named a service nobody registered.
pub const SC_UNKNOWN_SERVICE: u16 = 501;
pub const SS_UNKNOWN_SERVICE: &str = "unknown service";

/// Format a status line body.
pub fn format_status(code: u16, text: &str) -> Bytes {
    Bytes::from(format!("{code:03} {text}\n"))
}

/// Parse a status line body into `(code, text)`. Rejects bodies that do not
/// start with exactly three digits followed by a space.
pub fn parse_status(body: &[u8]) -> Result<(u16, &str), FrameError> {
    if body.len() < 4 || body[3] != b' ' {
        return Err(FrameError::BadStatus);
    }
    let digits = &body[..3];
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::BadStatus);
    }
    let code = digits
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));
    let text = std::str::from_utf8(&body[4..])
        .map_err(|_| FrameError::BadStatus)?
        .trim_end_matches('\n');
    Ok((code, text))
}

/// True when `body` is a status line with the given code.
pub fn is_status(body: &[u8], code: u16) -> bool {
    matches!(parse_status(body), Ok((c, _)) if c == code)
}
