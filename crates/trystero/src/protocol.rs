//! Wire protocol for action frames on the shared data channel
//!
//! Compatible with the Trystero wire format (fixed 15 byte header):
//! - `[0..12)`  action type, UTF-8, zero padded
//! - `[12]`     nonce (per-action message counter)
//! - `[13]`     flags: bit0 last chunk, bit1 meta, bit2 binary, bit3 json
//! - `[14]`     progress (255 for a complete single chunk)
//! - `[15..]`   payload
//!
//! Multi-chunk reassembly is not implemented; the chunk flags are kept
//! intact so frames can be forwarded or inspected unchanged.

use serde::Serialize;
use thiserror::Error;

/// Maximum action type length in bytes
pub const TYPE_BYTE_LIMIT: usize = 12;
pub const NONCE_INDEX: usize = TYPE_BYTE_LIMIT;
pub const FLAGS_INDEX: usize = NONCE_INDEX + 1;
pub const PROGRESS_INDEX: usize = FLAGS_INDEX + 1;
pub const PAYLOAD_INDEX: usize = PROGRESS_INDEX + 1;

/// Progress byte of a complete message
pub const PROGRESS_COMPLETE: u8 = u8::MAX;

const FLAG_LAST: u8 = 1;
const FLAG_META: u8 = 1 << 1;
const FLAG_BINARY: u8 = 1 << 2;
const FLAG_JSON: u8 = 1 << 3;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("action type must not be empty")]
    EmptyType,
    #[error("action type is {0} bytes, limit is {}", TYPE_BYTE_LIMIT)]
    TypeTooLong(usize),
    #[error("action type is not valid UTF-8")]
    InvalidType,
    #[error("action type contains a NUL byte")]
    NulInType,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("text payload is not valid UTF-8")]
    InvalidText,
}

/// Header flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags {
    pub is_last: bool,
    pub is_meta: bool,
    pub is_binary: bool,
    pub is_json: bool,
}

impl FrameFlags {
    pub fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.is_last {
            b |= FLAG_LAST;
        }
        if self.is_meta {
            b |= FLAG_META;
        }
        if self.is_binary {
            b |= FLAG_BINARY;
        }
        if self.is_json {
            b |= FLAG_JSON;
        }
        b
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            is_last: b & FLAG_LAST != 0,
            is_meta: b & FLAG_META != 0,
            is_binary: b & FLAG_BINARY != 0,
            is_json: b & FLAG_JSON != 0,
        }
    }
}

/// Application payload carried by one action message
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Binary(Vec<u8>),
    Text(String),
}

impl Payload {
    /// Serialize any value as a JSON payload
    pub fn json<T: Serialize>(value: &T) -> Result<Self, FrameError> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    fn bytes(&self) -> Result<Vec<u8>, FrameError> {
        Ok(match self {
            Payload::Json(v) => serde_json::to_vec(v)?,
            Payload::Binary(b) => b.clone(),
            Payload::Text(s) => s.as_bytes().to_vec(),
        })
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

/// Decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub action: String,
    pub nonce: u8,
    pub flags: FrameFlags,
    pub progress: u8,
    pub payload: Payload,
}

/// Result of decoding bytes from the data channel
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(Frame),
    /// Too short to carry a header; passed through untouched
    Raw(Vec<u8>),
}

/// Check an action name fits the type field
pub fn validate_type(action: &str) -> Result<(), FrameError> {
    if action.is_empty() {
        return Err(FrameError::EmptyType);
    }
    if action.len() > TYPE_BYTE_LIMIT {
        return Err(FrameError::TypeTooLong(action.len()));
    }
    // The receiver cuts the name at the first NUL
    if action.as_bytes().contains(&0) {
        return Err(FrameError::NulInType);
    }
    Ok(())
}

/// Encode a complete single-chunk message
pub fn encode_message(action: &str, nonce: u8, payload: &Payload) -> Result<Vec<u8>, FrameError> {
    let flags = FrameFlags {
        is_last: true,
        is_meta: false,
        is_binary: false,
        is_json: false,
    };
    encode_frame(action, nonce, flags, PROGRESS_COMPLETE, payload)
}

/// Encode a frame with explicit chunk flags.
/// The binary/json bits are always derived from the payload.
pub fn encode_frame(
    action: &str,
    nonce: u8,
    flags: FrameFlags,
    progress: u8,
    payload: &Payload,
) -> Result<Vec<u8>, FrameError> {
    validate_type(action)?;

    let flags = FrameFlags {
        is_binary: matches!(payload, Payload::Binary(_)),
        is_json: matches!(payload, Payload::Json(_)),
        ..flags
    };
    let body = payload.bytes()?;

    let mut out = Vec::with_capacity(PAYLOAD_INDEX + body.len());
    out.extend_from_slice(action.as_bytes());
    out.resize(TYPE_BYTE_LIMIT, 0);
    out.push(nonce);
    out.push(flags.to_byte());
    out.push(progress);
    out.extend(body);
    Ok(out)
}

/// Decode bytes received on the data channel
pub fn decode_frame(data: &[u8]) -> Result<Inbound, FrameError> {
    if data.len() < PAYLOAD_INDEX {
        return Ok(Inbound::Raw(data.to_vec()));
    }

    let type_bytes = &data[..TYPE_BYTE_LIMIT];
    let type_end = type_bytes
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(TYPE_BYTE_LIMIT);
    let action = std::str::from_utf8(&type_bytes[..type_end])
        .map_err(|_| FrameError::InvalidType)?
        .to_string();

    let nonce = data[NONCE_INDEX];
    let flags = FrameFlags::from_byte(data[FLAGS_INDEX]);
    let progress = data[PROGRESS_INDEX];
    let body = &data[PAYLOAD_INDEX..];

    let payload = if flags.is_json {
        Payload::Json(serde_json::from_slice(body)?)
    } else if flags.is_binary {
        Payload::Binary(body.to_vec())
    } else {
        Payload::Text(
            std::str::from_utf8(body)
                .map_err(|_| FrameError::InvalidText)?
                .to_string(),
        )
    };

    Ok(Inbound::Frame(Frame {
        action,
        nonce,
        flags,
        progress,
        payload,
    }))
}
