//! Signaling messages exchanged over the relay network
//!
//! Emitted formats (field order is part of the wire contract):
//! - Presence:  `{"peerId":".."}`
//! - Offer:     `{"peerId":"..","offer":{"type":"offer","sdp":".."}}`
//! - Answer:    `{"peerId":"..","answer":{"type":"answer","sdp":".."}}`
//! - Candidate: `{"type":"candidate","peerId":"..","candidate":"..","sdpMid":"..","sdpMLineIndex":0}`
//! - Bye:       `{"type":"bye","peerId":".."}`
//!
//! The decoder also accepts the legacy flat forms: `{"type":"offer","sdp":..}`,
//! a candidate given as a nested object, and a bare `{"candidate":..}`.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::crypto::{self, CryptoError, SignalKey};
use crate::types::{IceCandidate, SdpType};

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown signal type: {0}")]
    UnknownType(String),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Encrypted SDP but no room password")]
    NoPassword,
}

/// A signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Presence { peer_id: String },
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
    Bye,
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Presence { .. } => "presence",
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate(_) => "candidate",
            Signal::Bye => "bye",
        }
    }
}

/// A decoded signal with the sender id it carried, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub peer_id: Option<String>,
    pub signal: Signal,
}

#[derive(Serialize)]
struct PresenceWire<'a> {
    #[serde(rename = "peerId")]
    peer_id: &'a str,
}

#[derive(Serialize)]
struct DescriptionWire<'a> {
    #[serde(rename = "type")]
    sdp_type: &'a str,
    sdp: &'a str,
}

#[derive(Serialize)]
struct OfferWire<'a> {
    #[serde(rename = "peerId")]
    peer_id: &'a str,
    offer: DescriptionWire<'a>,
}

#[derive(Serialize)]
struct AnswerWire<'a> {
    #[serde(rename = "peerId")]
    peer_id: &'a str,
    answer: DescriptionWire<'a>,
}

#[derive(Serialize)]
struct CandidateWire<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(rename = "peerId")]
    peer_id: &'a str,
    candidate: &'a str,
    #[serde(rename = "sdpMid")]
    sdp_mid: Option<&'a str>,
    #[serde(rename = "sdpMLineIndex")]
    sdp_m_line_index: Option<u16>,
}

#[derive(Serialize)]
struct ByeWire<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(rename = "peerId")]
    peer_id: &'a str,
}

/// Encode a signal sent by `self_id`.
/// Offer and answer SDPs are encrypted when a key is given.
pub fn encode(signal: &Signal, self_id: &str, key: Option<&SignalKey>) -> Result<String, SignalError> {
    let text = match signal {
        Signal::Presence { peer_id } => serde_json::to_string(&PresenceWire { peer_id })?,
        Signal::Offer { sdp } => {
            let sdp = seal(sdp, key)?;
            serde_json::to_string(&OfferWire {
                peer_id: self_id,
                offer: DescriptionWire {
                    sdp_type: SdpType::Offer.as_str(),
                    sdp: &sdp,
                },
            })?
        }
        Signal::Answer { sdp } => {
            let sdp = seal(sdp, key)?;
            serde_json::to_string(&AnswerWire {
                peer_id: self_id,
                answer: DescriptionWire {
                    sdp_type: SdpType::Answer.as_str(),
                    sdp: &sdp,
                },
            })?
        }
        Signal::Candidate(c) => serde_json::to_string(&CandidateWire {
            kind: "candidate",
            peer_id: self_id,
            candidate: &c.candidate,
            sdp_mid: c.sdp_mid.as_deref(),
            sdp_m_line_index: c.sdp_m_line_index,
        })?,
        Signal::Bye => serde_json::to_string(&ByeWire {
            kind: "bye",
            peer_id: self_id,
        })?,
    };
    Ok(text)
}

/// Decode a signal in either the wrapped or the flat format
pub fn decode(text: &str, key: Option<&SignalKey>) -> Result<Envelope, SignalError> {
    let value: Value = serde_json::from_str(text)?;
    let obj = value
        .as_object()
        .ok_or_else(|| SignalError::UnknownType("non-object".to_string()))?;

    let peer_id = obj.get("peerId").and_then(Value::as_str).map(str::to_string);

    // Wrapped session descriptions
    if let Some(desc) = obj.get("offer").and_then(Value::as_object) {
        let sdp = open(description_sdp(desc)?, key)?;
        return Ok(Envelope {
            peer_id,
            signal: Signal::Offer { sdp },
        });
    }
    if let Some(desc) = obj.get("answer").and_then(Value::as_object) {
        let sdp = open(description_sdp(desc)?, key)?;
        return Ok(Envelope {
            peer_id,
            signal: Signal::Answer { sdp },
        });
    }

    let signal = match obj.get("type").and_then(Value::as_str) {
        Some("offer") => Signal::Offer {
            sdp: open(description_sdp(obj)?, key)?,
        },
        Some("answer") => Signal::Answer {
            sdp: open(description_sdp(obj)?, key)?,
        },
        Some("candidate") => Signal::Candidate(parse_candidate(obj)?),
        Some("bye") => Signal::Bye,
        Some(other) => return Err(SignalError::UnknownType(other.to_string())),
        None if obj.contains_key("candidate") => Signal::Candidate(parse_candidate(obj)?),
        None => {
            let id = peer_id.clone().ok_or(SignalError::MissingField("peerId"))?;
            Signal::Presence { peer_id: id }
        }
    };

    Ok(Envelope { peer_id, signal })
}

fn description_sdp(obj: &Map<String, Value>) -> Result<&str, SignalError> {
    obj.get("sdp")
        .and_then(Value::as_str)
        .ok_or(SignalError::MissingField("sdp"))
}

fn parse_candidate(obj: &Map<String, Value>) -> Result<IceCandidate, SignalError> {
    match obj.get("candidate") {
        Some(Value::String(candidate)) => Ok(IceCandidate {
            candidate: candidate.clone(),
            sdp_mid: obj.get("sdpMid").and_then(Value::as_str).map(str::to_string),
            sdp_m_line_index: obj
                .get("sdpMLineIndex")
                .and_then(Value::as_u64)
                .and_then(|n| u16::try_from(n).ok()),
        }),
        // Older senders nest the RTCIceCandidateInit object
        Some(Value::Object(inner)) => match inner.get("candidate") {
            Some(Value::String(_)) => parse_candidate(inner),
            _ => Err(SignalError::MissingField("candidate")),
        },
        _ => Err(SignalError::MissingField("candidate")),
    }
}

fn seal(sdp: &str, key: Option<&SignalKey>) -> Result<String, SignalError> {
    match key {
        Some(key) => Ok(crypto::encrypt(key, sdp)?),
        None => Ok(sdp.to_string()),
    }
}

fn open(sdp: &str, key: Option<&SignalKey>) -> Result<String, SignalError> {
    match key {
        Some(key) => Ok(crypto::decrypt(key, sdp)?),
        None if crypto::looks_encrypted(sdp) => Err(SignalError::NoPassword),
        None => Ok(sdp.to_string()),
    }
}
