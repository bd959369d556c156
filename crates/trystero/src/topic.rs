//! Topic derivation for relay channels
//!
//! Wire compatible with the JavaScript Trystero implementation:
//! 1. digest = SHA-1(topic path)
//! 2. topic hash = concat of every digest byte in base 36 (no padding)
//! 3. event kind = 20000 + (sum of topic hash char codes mod 10000)
//!
//! The topic hash travels as the `x` tag of every relay event; the event
//! kind only narrows the relay-side filter, so collisions are expected.

use sha1::{Digest, Sha1};

/// Tag key carrying the topic hash on relay events
pub const TOPIC_TAG: &str = "x";

/// Lowest event kind in the derived range
pub const EVENT_KIND_BASE: u16 = 20_000;

/// Width of the derived kind range
pub const EVENT_KIND_SPAN: u32 = 10_000;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A logical pub/sub channel on the relay network
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    pub topic_hash: String,
    pub event_kind: u16,
}

impl Channel {
    /// Whether a relay event addressed by `(kind, tag)` belongs to this channel
    pub fn matches(&self, event_kind: u16, topic_hash: &str) -> bool {
        self.event_kind == event_kind && self.topic_hash == topic_hash
    }
}

/// Derive the channel for a topic path
pub fn derive_channel(input: &str) -> Channel {
    let topic_hash = topic_hash(input);
    let event_kind = event_kind(&topic_hash);
    Channel {
        topic_hash,
        event_kind,
    }
}

/// SHA-1 of the input rendered byte-by-byte in base 36
pub fn topic_hash(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        push_base36(&mut out, *byte);
    }
    out
}

/// Map a topic hash into the relay kind range
pub fn event_kind(topic_hash: &str) -> u16 {
    let sum: u32 = topic_hash.encode_utf16().map(u32::from).sum();
    EVENT_KIND_BASE + (sum % EVENT_KIND_SPAN) as u16
}

/// Sum of character codes modulo `limit`, used for deterministic offsets
pub fn str_to_num(s: &str, limit: u32) -> u32 {
    let sum: u64 = s.encode_utf16().map(u64::from).sum();
    (sum % u64::from(limit.max(1))) as u32
}

fn push_base36(out: &mut String, byte: u8) {
    let mut n = byte;
    let mut digits = [0u8; 2];
    let mut len = 0;
    loop {
        digits[len] = BASE36_DIGITS[(n % 36) as usize];
        len += 1;
        n /= 36;
        if n == 0 {
            break;
        }
    }
    for d in digits[..len].iter().rev() {
        out.push(*d as char);
    }
}
