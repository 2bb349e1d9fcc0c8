#![forbid(unsafe_code)]

//! Segment request wire format and the server side of one connection.
//!
//! A request is the decimal byte count of the wanted segment followed by a
//! newline. The server answers with exactly that many bytes.

use std::time::Duration;

use thiserror::Error;

pub const REQUEST_DELIMITER: u8 = b'\n';

/// Longest request line accepted, delimiter included. A `u64` needs at most
/// 20 digits.
pub const MAX_REQUEST_LEN: usize = 32;

pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty segment request")]
    Empty,
    #[error("segment request is not a decimal byte count: {0:?}")]
    NotDecimal(String),
    #[error("segment request asks for zero bytes")]
    Zero,
    #[error("segment request of {0} bytes exceeds the line limit")]
    TooLong(usize),
    #[error("new request while {remaining} bytes of the previous one are unsent")]
    Busy { remaining: u64 },
}

pub fn encode_request(bytes: u64) -> Vec<u8> {
    let mut line = bytes.to_string().into_bytes();
    line.push(REQUEST_DELIMITER);
    line
}

/// Parses one request line. Surrounding whitespace and trailing NUL padding
/// are tolerated.
pub fn parse_request(line: &[u8]) -> Result<u64, WireError> {
    if line.len() > MAX_REQUEST_LEN {
        return Err(WireError::TooLong(line.len()));
    }
    let text = String::from_utf8_lossy(line);
    let token = text.trim_end_matches('\0').trim();
    if token.is_empty() {
        return Err(WireError::Empty);
    }
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WireError::NotDecimal(token.to_string()));
    }
    match token.parse::<u64>() {
        Ok(0) => Err(WireError::Zero),
        Ok(bytes) => Ok(bytes),
        Err(_) => Err(WireError::NotDecimal(token.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub len: usize,
    /// Time the chunk should occupy on the wire when the session is rate limited.
    pub pace: Option<Duration>,
}

/// Per-connection response state, owned by the task serving the connection.
#[derive(Debug, Clone)]
pub struct ServeSession {
    chunk_bytes: usize,
    max_kbps: Option<u64>,
    remaining: u64,
    requests_served: u64,
    bytes_served: u64,
}

impl ServeSession {
    pub fn new(chunk_bytes: usize, max_kbps: Option<u64>) -> Self {
        Self {
            chunk_bytes: chunk_bytes.max(1),
            max_kbps: max_kbps.filter(|kbps| *kbps > 0),
            remaining: 0,
            requests_served: 0,
            bytes_served: 0,
        }
    }

    /// Accepts the next request line and returns the byte count to stream.
    pub fn begin(&mut self, line: &[u8]) -> Result<u64, WireError> {
        if self.remaining > 0 {
            return Err(WireError::Busy {
                remaining: self.remaining,
            });
        }
        let bytes = parse_request(line)?;
        self.remaining = bytes;
        self.requests_served += 1;
        Ok(bytes)
    }

    /// Next slice of the current response, or `None` once it is fully sent.
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        if self.remaining == 0 {
            return None;
        }
        let len = self.remaining.min(self.chunk_bytes as u64) as usize;
        self.remaining -= len as u64;
        self.bytes_served += len as u64;
        let pace = self
            .max_kbps
            .map(|kbps| Duration::from_secs_f64(len as f64 * 8.0 / (kbps as f64 * 1_000.0)));
        Some(Chunk { len, pace })
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    pub fn is_idle(&self) -> bool {
        self.remaining == 0
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served
    }
}

impl Default for ServeSession {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_BYTES, None)
    }
}
