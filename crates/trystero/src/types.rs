//! Core types shared by the room, signaling and peer layers
//!
//! Identity of the local room member, negotiation roles and states,
//! and the ICE candidate shape exchanged over signaling.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Library name prefixed to every topic path (compatibility constant)
pub const LIB_NAME: &str = "Trystero";

/// Length of a generated self id
pub const SELF_ID_LEN: usize = 20;

/// Data channel label shared with counterpart implementations
pub const DATA_CHANNEL_LABEL: &str = "data";

/// Generate a fresh base62 self id
pub fn generate_self_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SELF_ID_LEN)
        .map(char::from)
        .collect()
}

/// Who we are inside a room. Fixed for the lifetime of a Room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomIdentity {
    pub app_id: String,
    pub room_name: String,
    pub self_id: String,
}

impl RoomIdentity {
    pub fn new(app_id: impl Into<String>, room_name: impl Into<String>) -> Self {
        Self::with_self_id(app_id, room_name, generate_self_id())
    }

    pub fn with_self_id(
        app_id: impl Into<String>,
        room_name: impl Into<String>,
        self_id: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            room_name: room_name.into(),
            self_id: self_id.into(),
        }
    }

    /// Topic path of the room-wide channel: `Trystero@<appId>@<roomName>`
    pub fn root_topic(&self) -> String {
        topic_path(&[LIB_NAME, &self.app_id, &self.room_name])
    }

    /// Topic path of a member's private channel: `<root>@<peerId>`
    pub fn peer_topic(&self, peer_id: &str) -> String {
        topic_path(&[&self.root_topic(), peer_id])
    }
}

/// Join topic parts with `@`
pub fn topic_path(parts: &[&str]) -> String {
    parts.join("@")
}

/// Which side of a pair creates the first offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Resolve our role towards a remote peer.
    /// The lexicographically smaller id initiates.
    pub fn resolve(self_id: &str, peer_id: &str) -> Self {
        if self_id < peer_id {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Perfect-negotiation state of a single link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    MakingOffer,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::Stable => "stable",
            NegotiationState::MakingOffer => "making-offer",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

/// A session description handed to the transport engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for WebRTC connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

/// Shorten an id for log lines
pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_self_id() {
        let a = generate_self_id();
        let b = generate_self_id();
        assert_eq!(a.len(), SELF_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_topic_paths() {
        let identity = RoomIdentity::with_self_id("demo", "lobby", "p1");
        assert_eq!(identity.root_topic(), "Trystero@demo@lobby");
        assert_eq!(identity.peer_topic("p2"), "Trystero@demo@lobby@p2");
    }

    #[test]
    fn test_role_resolution() {
        assert_eq!(Role::resolve("p1", "p2"), Role::Initiator);
        assert_eq!(Role::resolve("p2", "p1"), Role::Responder);
        // Uppercase sorts before lowercase in byte order
        assert_eq!(Role::resolve("Zeta", "alpha"), Role::Initiator);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("abcdefghijkl"), "abcdefgh");
        assert_eq!(short_id("abc"), "abc");
    }
}
