//! Serverless WebRTC rooms
//!
//! Peers meet in a named room on public Nostr relays, negotiate direct
//! WebRTC connections with perfect negotiation, and exchange named actions
//! over one multiplexed data channel. Topics, signal messages and data
//! frames are wire compatible with Trystero's Nostr strategy.
//!
//! # Overview
//!
//! - **Discovery**: presence announcements on the room's relay channel
//! - **Signaling**: offers, answers and ICE candidates on per-peer channels,
//!   SDP optionally encrypted with the room password
//! - **Data**: actions framed with a 15-byte header on the `data` channel
//!
//! # Example
//!
//! ```rust,no_run
//! use trystero::{Payload, Room, RoomConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let room = Room::with_nostr(RoomConfig::new("my-app"), "lobby")?;
//!     room.on_peer_join(|peer| println!("{} joined", peer));
//!     room.join().await?;
//!
//!     let chat = room.make_action("chat")?;
//!     chat.on_receive(|payload, peer| {
//!         if let Payload::Text(text) = payload {
//!             println!("{}: {}", peer, text);
//!         }
//!     });
//!     chat.send("hello", None).await?;
//!
//!     room.leave().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod mock;
pub mod nostr;
pub mod peer;
pub mod protocol;
pub mod real_factory;
pub mod room;
pub mod signal;
pub mod signaling;
pub mod topic;
pub mod transport;
pub mod types;

pub use config::{RoomConfig, DEFAULT_ICE_SERVERS, DEFAULT_RELAYS};
pub use crypto::{CryptoError, SignalKey};
pub use mock::{MockEngine, MockEngineFactory, MockNetwork, MockRelay, MockRelayTransport};
pub use nostr::NostrRelayTransport;
pub use peer::{LinkEvent, LinkUpdate, PeerCommand, PeerError, PeerLink};
pub use protocol::{
    decode_frame, encode_frame, encode_message, Frame, FrameError, FrameFlags, Inbound, Payload,
    TYPE_BYTE_LIMIT,
};
pub use real_factory::{WebRtcEngine, WebRtcEngineFactory};
pub use room::{Action, ActionHandler, PeerHandler, Room, RoomError};
pub use signal::{Envelope, Signal, SignalError};
pub use signaling::{BusError, BusEvent, SignalBus};
pub use topic::{derive_channel, event_kind, str_to_num, topic_hash, Channel};
pub use transport::{
    EngineEvent, EngineFactory, IceConnectionState, RelayEvent, RelayTransport, TransportEngine,
    TransportError,
};
pub use types::{
    generate_self_id, IceCandidate, NegotiationState, Role, RoomIdentity, SdpType,
    SessionDescription, DATA_CHANNEL_LABEL, LIB_NAME,
};
