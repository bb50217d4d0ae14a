//! Frame codec used by the forwarding strategies.
//!
//! Requests and responses share one layout: `[u32 LE payload_len][payload]`.
//! The proxy never interprets payloads; it only needs frame boundaries to
//! count requests and match responses to them in order.

use crate::config::MAX_FRAME_LEN;

pub const HEADER_LEN: usize = 4;

/// Result of attempting to parse a frame from a byte buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A full frame is present. `bytes_consumed` includes the header.
    Complete {
        payload_len: usize,
        bytes_consumed: usize,
    },
    /// Need more data. Contains minimum bytes still needed.
    Incomplete(usize),
    /// Length is zero or larger than `MAX_FRAME_LEN`.
    Error(&'static str),
}

pub fn try_parse_frame(buf: &[u8]) -> ParseResult {
    if buf.len() < HEADER_LEN {
        return ParseResult::Incomplete(HEADER_LEN - buf.len());
    }

    let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if payload_len == 0 || payload_len > MAX_FRAME_LEN {
        return ParseResult::Error("frame length out of range");
    }

    let total_size = HEADER_LEN + payload_len;
    if buf.len() < total_size {
        return ParseResult::Incomplete(total_size - buf.len());
    }

    ParseResult::Complete {
        payload_len,
        bytes_consumed: total_size,
    }
}

/// Split `buf` into complete frames. Returns the total bytes they span and how
/// many there were; a trailing partial frame is left for the next read.
pub fn scan_frames(buf: &[u8]) -> Result<(usize, usize), &'static str> {
    let mut consumed = 0;
    let mut frames = 0;
    while consumed < buf.len() {
        match try_parse_frame(&buf[consumed..]) {
            ParseResult::Complete { bytes_consumed, .. } => {
                consumed += bytes_consumed;
                frames += 1;
            }
            ParseResult::Incomplete(_) => break,
            ParseResult::Error(e) => return Err(e),
        }
    }
    Ok((consumed, frames))
}

/// Serialize one frame into the write buffer.
pub fn write_frame(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
}
