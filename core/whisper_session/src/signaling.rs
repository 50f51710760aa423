//! Session request/response messages carried by the messaging transport
//!
//! ```text
//! Offerer                  Messaging transport                 Answerer
//!   │                              │                               │
//!   │─── Request { tid, sdp } ────►│──────────────────────────────►│
//!   │                              │                               │ on_request
//!   │◄─────────────────────────────│◄── Response { tid, status } ──│ reply_request
//! ```
//!
//! Messages are length-prefixed with a 4-byte big-endian length header:
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Payload (bincode-encoded)       │
//! └─────────────┴─────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;
use crate::ice::agent::random_u64;

// ============================================================================
// Constants
// ============================================================================

/// Maximum message payload size
pub const MAX_MESSAGE_SIZE: u32 = 65536;

pub const HEADER_LEN: usize = 4;

/// Status of an accepted request
pub const STATUS_OK: i32 = 0;

/// Status sent when the application declines a request
pub const STATUS_REFUSED: i32 = -1;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Session offer
    Request { tid: u64, sdp: String },
    /// Answer to the request with the same `tid`; `sdp` is present on success
    Response {
        tid: u64,
        status: i32,
        reason: Option<String>,
        sdp: Option<String>,
    },
}

impl SessionMessage {
    pub fn tid(&self) -> u64 {
        match self {
            SessionMessage::Request { tid, .. } | SessionMessage::Response { tid, .. } => *tid,
        }
    }
}

/// Random, non-zero transaction id
pub fn generate_tid() -> u64 {
    loop {
        let tid = random_u64();
        if tid != 0 {
            return tid;
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("incomplete message, need {0} more bytes")]
    Incomplete(usize),
    #[error("message too large: {0} bytes (max {max})", max = MAX_MESSAGE_SIZE)]
    MessageTooLarge(usize),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Protocol(e.to_string())
    }
}

/// Encode as `[4-byte BE length][bincode payload]`
pub fn encode_message(msg: &SessionMessage) -> crate::Result<Vec<u8>> {
    let payload = bincode::serialize(msg).map_err(|e| Error::Protocol(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(Error::InvalidArgument(format!(
            "session message of {} bytes exceeds {}",
            payload.len(),
            MAX_MESSAGE_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode one message, returning it and the number of bytes consumed
pub fn decode_message(buf: &[u8]) -> Result<(SessionMessage, usize), DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Incomplete(HEADER_LEN - buf.len()));
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_MESSAGE_SIZE as usize {
        return Err(DecodeError::MessageTooLarge(length));
    }

    let total_len = HEADER_LEN + length;
    if buf.len() < total_len {
        return Err(DecodeError::Incomplete(total_len - buf.len()));
    }

    let msg = bincode::deserialize(&buf[HEADER_LEN..total_len])
        .map_err(|e| DecodeError::Deserialization(e.to_string()))?;
    Ok((msg, total_len))
}
