//! Transport abstractions
//!
//! Two capabilities are consumed by the room: a relay transport that carries
//! small signaling events between strangers, and a transport engine that
//! turns session descriptions and ICE candidates into a direct data link.
//! Both are implemented for production (Nostr + WebRTC) and in memory.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::topic::Channel;
use crate::types::{IceCandidate, Role, SessionDescription};

/// Errors from relay or engine operations
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Timeout")]
    Timeout,
    #[error("Disconnected")]
    Disconnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Closed")]
    Closed,
}

/// An event as delivered by the relay network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub kind: u16,
    pub tags: Vec<(String, String)>,
    pub content: String,
    /// Relay-level identity of the publisher (e.g. a Nostr pubkey)
    pub identity: String,
}

impl RelayEvent {
    /// First value of a tag
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Relay transport for signaling messages
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Connect to relays
    async fn connect(&self, relays: &[String]) -> Result<(), TransportError>;

    /// Disconnect from relays
    async fn disconnect(&self);

    /// Start receiving events on the given channels
    async fn subscribe(&self, channels: &[Channel]) -> Result<(), TransportError>;

    /// Publish content on a channel
    async fn publish(&self, channel: &Channel, content: String) -> Result<(), TransportError>;

    /// Receive the next event from a subscribed channel
    async fn recv(&self) -> Option<RelayEvent>;

    /// Our relay-level identity
    fn identity(&self) -> &str;
}

/// ICE connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications from a transport engine to its link
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    IceConnectionState(IceConnectionState),
    IceCandidate(IceCandidate),
    DataChannelOpen,
    Data(Vec<u8>),
    NegotiationNeeded,
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// A single peer connection
#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn create_offer(&self) -> Result<String, TransportError>;

    async fn create_answer(&self) -> Result<String, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Discard an outstanding local offer
    async fn rollback(&self) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Send bytes on the data channel
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Creates one engine per remote peer
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Create an engine towards `remote_peer_id`. The initiator owns the
    /// data channel; the responder receives it from the remote side.
    async fn create(
        &self,
        remote_peer_id: &str,
        role: Role,
        events: EngineEventSender,
    ) -> Result<Arc<dyn TransportEngine>, TransportError>;
}

// Blanket implementations for Arc<T> to allow calling trait methods on Arc-wrapped transports

#[async_trait]
impl<T: RelayTransport + ?Sized> RelayTransport for Arc<T> {
    async fn connect(&self, relays: &[String]) -> Result<(), TransportError> {
        (**self).connect(relays).await
    }

    async fn disconnect(&self) {
        (**self).disconnect().await
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<(), TransportError> {
        (**self).subscribe(channels).await
    }

    async fn publish(&self, channel: &Channel, content: String) -> Result<(), TransportError> {
        (**self).publish(channel, content).await
    }

    async fn recv(&self) -> Option<RelayEvent> {
        (**self).recv().await
    }

    fn identity(&self) -> &str {
        (**self).identity()
    }
}

#[async_trait]
impl<T: EngineFactory + ?Sized> EngineFactory for Arc<T> {
    async fn create(
        &self,
        remote_peer_id: &str,
        role: Role,
        events: EngineEventSender,
    ) -> Result<Arc<dyn TransportEngine>, TransportError> {
        (**self).create(remote_peer_id, role, events).await
    }
}
