//! Signal bus: room signaling over the relay network
//!
//! Presence announcements go to the room's root channel. Directed signals
//! (offer, answer, candidate, bye) go to the recipient's own channel
//! `<root>@<peerId>`. The bus subscribes to both and maps room peer ids to
//! the relay identities they publish under.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{RoomConfig, DEFAULT_RELAYS};
use crate::crypto::SignalKey;
use crate::signal::{self, Signal, SignalError};
use crate::topic::{derive_channel, str_to_num, Channel, TOPIC_TAG};
use crate::transport::{RelayEvent, RelayTransport, TransportError};
use crate::types::{short_id, RoomIdentity};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Unknown peer: {0}")]
    PeerUnknown(String),
    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// What an incoming relay event means to the room
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    PeerDiscovered(String),
    Signal { peer_id: String, signal: Signal },
}

/// Pick relay endpoints. Explicit URLs win; otherwise rotate the default
/// list by the app id so peers of the same app share relays.
pub fn select_relays(config: &RoomConfig) -> Vec<String> {
    let count = config.relay_redundancy.max(1);
    if !config.relay_urls.is_empty() {
        return config.relay_urls.iter().take(count).cloned().collect();
    }
    let len = DEFAULT_RELAYS.len();
    let offset = str_to_num(&config.app_id, len as u32) as usize;
    (0..count.min(len))
        .map(|i| DEFAULT_RELAYS[(offset + i) % len].to_string())
        .collect()
}

pub struct SignalBus {
    identity: RoomIdentity,
    relay: Arc<dyn RelayTransport>,
    relays: Vec<String>,
    key: Option<SignalKey>,
    root: Channel,
    self_channel: Channel,
    announce_interval: Duration,
    announce_jitter_ms: u64,
    /// peer id -> relay identity
    peers: HashMap<String, String>,
    /// relay identity -> peer id
    identities: HashMap<String, String>,
    tasks: Vec<JoinHandle<()>>,
    connected: bool,
}

impl SignalBus {
    pub fn new(identity: RoomIdentity, config: &RoomConfig, relay: Arc<dyn RelayTransport>) -> Self {
        let root = derive_channel(&identity.root_topic());
        let self_channel = derive_channel(&identity.peer_topic(&identity.self_id));
        let key = config
            .password
            .as_deref()
            .map(|p| SignalKey::derive(p, &identity.app_id, &identity.room_name));
        Self {
            relays: select_relays(config),
            identity,
            relay,
            key,
            root,
            self_channel,
            announce_interval: Duration::from_millis(config.announce_interval_ms.max(1)),
            announce_jitter_ms: config.announce_jitter_ms,
            peers: HashMap::new(),
            identities: HashMap::new(),
            tasks: Vec::new(),
            connected: false,
        }
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    pub fn root_channel(&self) -> &Channel {
        &self.root
    }

    pub fn self_channel(&self) -> &Channel {
        &self.self_channel
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Relay identity a peer was last seen under
    pub fn relay_identity(&self, peer_id: &str) -> Option<&str> {
        self.peers.get(peer_id).map(String::as_str)
    }

    /// Connect, subscribe, and start reading and announcing.
    /// Incoming events are forwarded to `events` unfiltered; pass them back
    /// through `on_incoming` on the owning task.
    pub async fn connect(&mut self, events: mpsc::UnboundedSender<RelayEvent>) -> Result<(), BusError> {
        if self.connected {
            return Ok(());
        }
        self.relay.connect(&self.relays).await?;
        self.relay
            .subscribe(&[self.root.clone(), self.self_channel.clone()])
            .await?;
        self.connected = true;
        info!(
            "[SignalBus] {} connected to {} relays, root kind={}",
            short_id(&self.identity.self_id),
            self.relays.len(),
            self.root.event_kind
        );

        let relay = self.relay.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = relay.recv().await {
                if events.send(event).is_err() {
                    break;
                }
            }
            debug!("[SignalBus] reader stopped");
        }));

        let presence = signal::encode(
            &Signal::Presence {
                peer_id: self.identity.self_id.clone(),
            },
            &self.identity.self_id,
            None,
        )?;
        let relay = self.relay.clone();
        let root = self.root.clone();
        let interval = self.announce_interval;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=self.announce_jitter_ms));
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(jitter).await;
            loop {
                match relay.publish(&root, presence.clone()).await {
                    Ok(()) => debug!("[SignalBus] announced presence"),
                    Err(e) => warn!("[SignalBus] presence announcement failed: {}", e),
                }
                tokio::time::sleep(interval).await;
            }
        }));

        Ok(())
    }

    /// Interpret a relay event. Returns None for anything not meant for us.
    pub fn on_incoming(&mut self, event: RelayEvent) -> Option<BusEvent> {
        let topic_hash = event.tag(TOPIC_TAG)?;
        let on_root = self.root.matches(event.kind, topic_hash);
        let on_self = self.self_channel.matches(event.kind, topic_hash);
        if !on_root && !on_self {
            return None;
        }
        if event.identity == self.relay.identity() {
            return None;
        }

        let envelope = match signal::decode(&event.content, self.key.as_ref()) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("[SignalBus] dropped signal from {}: {}", short_id(&event.identity), e);
                return None;
            }
        };

        if let Signal::Presence { peer_id } = envelope.signal {
            if peer_id == self.identity.self_id {
                return None;
            }
            self.remember(&peer_id, &event.identity);
            return Some(BusEvent::PeerDiscovered(peer_id));
        }

        if !on_self {
            debug!(
                "[SignalBus] ignoring {} on root channel from {}",
                envelope.signal.kind(),
                short_id(&event.identity)
            );
            return None;
        }

        let peer_id = match envelope.peer_id {
            Some(id) => id,
            None => match self.identities.get(&event.identity) {
                Some(id) => id.clone(),
                None => {
                    debug!(
                        "[SignalBus] {} from unmapped identity {}",
                        envelope.signal.kind(),
                        short_id(&event.identity)
                    );
                    return None;
                }
            },
        };
        if peer_id == self.identity.self_id {
            return None;
        }
        self.remember(&peer_id, &event.identity);

        Some(BusEvent::Signal {
            peer_id,
            signal: envelope.signal,
        })
    }

    fn remember(&mut self, peer_id: &str, relay_identity: &str) {
        if let Some(old) = self.peers.insert(peer_id.to_string(), relay_identity.to_string()) {
            if old != relay_identity {
                self.identities.remove(&old);
            }
        }
        self.identities
            .insert(relay_identity.to_string(), peer_id.to_string());
    }

    /// Drop the identity mapping of a peer the room no longer tracks
    pub fn forget(&mut self, peer_id: &str) {
        if let Some(identity) = self.peers.remove(peer_id) {
            if self.identities.get(&identity).map(String::as_str) == Some(peer_id) {
                self.identities.remove(&identity);
            }
        }
    }

    /// Publish a signal to one peer without waiting for the relay.
    /// The returned handle completes when the publish does.
    pub fn send(&self, signal: &Signal, to: &str) -> Result<JoinHandle<()>, BusError> {
        if !self.peers.contains_key(to) {
            return Err(BusError::PeerUnknown(to.to_string()));
        }
        let content = signal::encode(signal, &self.identity.self_id, self.key.as_ref())?;
        let channel = derive_channel(&self.identity.peer_topic(to));
        let relay = self.relay.clone();
        let kind = signal.kind();
        let target = to.to_string();
        Ok(tokio::spawn(async move {
            if let Err(e) = relay.publish(&channel, content).await {
                warn!("[SignalBus] {} to {} failed: {}", kind, short_id(&target), e);
            }
        }))
    }

    /// Stop announcing and close relay connections.
    /// In-flight publishes are left to finish or fail on their own.
    pub async fn disconnect(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if self.connected {
            self.relay.disconnect().await;
            self.connected = false;
        }
        self.peers.clear();
        self.identities.clear();
        info!("[SignalBus] {} disconnected", short_id(&self.identity.self_id));
    }
}

impl Drop for SignalBus {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRelay;
    use crate::types::IceCandidate;

    fn config() -> RoomConfig {
        let mut config = RoomConfig::new("demo");
        config.announce_interval_ms = 50;
        config.announce_jitter_ms = 0;
        config
    }

    fn bus(relay: &Arc<MockRelay>, self_id: &str, config: &RoomConfig) -> SignalBus {
        let transport: Arc<dyn RelayTransport> =
            Arc::new(relay.create_transport(format!("id-{}", self_id)));
        SignalBus::new(
            RoomIdentity::with_self_id("demo", "lobby", self_id),
            config,
            transport,
        )
    }

    fn event(channel: &Channel, content: &str, identity: &str) -> RelayEvent {
        RelayEvent {
            kind: channel.event_kind,
            tags: vec![(TOPIC_TAG.to_string(), channel.topic_hash.clone())],
            content: content.to_string(),
            identity: identity.to_string(),
        }
    }

    #[test]
    fn test_select_default_relays() {
        let config = RoomConfig::new("demo");
        let relays = select_relays(&config);
        assert_eq!(relays.len(), 5);
        // "demo" sums to 421, 421 % 16 = 5
        assert_eq!(relays[0], DEFAULT_RELAYS[5]);
        assert_eq!(relays[4], DEFAULT_RELAYS[9]);
        assert_eq!(relays, select_relays(&RoomConfig::new("demo")));
    }

    #[test]
    fn test_select_wraps_around() {
        let mut config = RoomConfig::new("demo");
        config.relay_redundancy = 14;
        let relays = select_relays(&config);
        assert_eq!(relays.len(), 14);
        assert_eq!(relays[11], DEFAULT_RELAYS[0]);

        config.relay_redundancy = 100;
        assert_eq!(select_relays(&config).len(), DEFAULT_RELAYS.len());
    }

    #[test]
    fn test_select_explicit_relays() {
        let mut config = RoomConfig::new("demo").with_relays(vec![
            "wss://a".to_string(),
            "wss://b".to_string(),
            "wss://c".to_string(),
        ]);
        config.relay_redundancy = 2;
        assert_eq!(select_relays(&config), vec!["wss://a", "wss://b"]);
    }

    #[tokio::test]
    async fn test_channels() {
        let relay = MockRelay::new();
        let bus = bus(&relay, "p1", &config());
        assert_eq!(bus.root_channel().topic_hash, "u614m215m2j512i2m1s126394t4e4zh2w6z");
        assert_eq!(bus.root_channel().event_kind, 22583);
        assert_eq!(
            bus.self_channel().topic_hash,
            "192hf62184j3854662v1a2c1l412c2e2664c1i"
        );
        assert_eq!(bus.self_channel().event_kind, 22533);
    }

    #[tokio::test]
    async fn test_presence_discovery_and_mapping() {
        let relay = MockRelay::new();
        let mut bus = bus(&relay, "p1", &config());
        let root = bus.root_channel().clone();

        let found = bus.on_incoming(event(&root, r#"{"peerId":"p2"}"#, "id-p2"));
        assert_eq!(found, Some(BusEvent::PeerDiscovered("p2".to_string())));
        assert_eq!(bus.relay_identity("p2"), Some("id-p2"));

        // Own presence echoed back by the relay
        assert_eq!(bus.on_incoming(event(&root, r#"{"peerId":"p1"}"#, "id-p1")), None);
        // Other rooms
        let other = derive_channel("Trystero@demo@other");
        assert_eq!(bus.on_incoming(event(&other, r#"{"peerId":"p3"}"#, "id-p3")), None);
        // Garbage never breaks the path
        assert_eq!(bus.on_incoming(event(&root, "{oops", "id-p4")), None);
        assert_eq!(bus.on_incoming(event(&root, r#"{"type":"dance"}"#, "id-p4")), None);
    }

    #[tokio::test]
    async fn test_directed_signals() {
        let relay = MockRelay::new();
        let mut bus = bus(&relay, "p1", &config());
        let own = bus.self_channel().clone();
        let root = bus.root_channel().clone();

        let offer = r#"{"peerId":"p2","offer":{"type":"offer","sdp":"v=0"}}"#;
        assert_eq!(
            bus.on_incoming(event(&own, offer, "id-p2")),
            Some(BusEvent::Signal {
                peer_id: "p2".to_string(),
                signal: Signal::Offer { sdp: "v=0".to_string() }
            })
        );
        // First contact created the mapping
        assert_eq!(bus.relay_identity("p2"), Some("id-p2"));

        // Legacy flat candidate resolves the sender from the mapping
        let flat = r#"{"candidate":"candidate:1","sdpMid":"0","sdpMLineIndex":0}"#;
        assert_eq!(
            bus.on_incoming(event(&own, flat, "id-p2")),
            Some(BusEvent::Signal {
                peer_id: "p2".to_string(),
                signal: Signal::Candidate(IceCandidate {
                    candidate: "candidate:1".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                })
            })
        );
        // Unmapped identity without a peer id
        assert_eq!(bus.on_incoming(event(&own, flat, "id-stranger")), None);
        // Directed signals are not read from the root channel
        assert_eq!(bus.on_incoming(event(&root, offer, "id-p2")), None);
    }

    #[tokio::test]
    async fn test_forget_drops_mapping() {
        let relay = MockRelay::new();
        let mut bus = bus(&relay, "p1", &config());
        let root = bus.root_channel().clone();
        let own = bus.self_channel().clone();

        bus.on_incoming(event(&root, r#"{"peerId":"p2"}"#, "id-p2"));
        bus.on_incoming(event(&root, r#"{"peerId":"p3"}"#, "id-p3"));
        bus.forget("p2");
        assert_eq!(bus.relay_identity("p2"), None);
        assert_eq!(bus.relay_identity("p3"), Some("id-p3"));
        assert!(matches!(bus.send(&Signal::Bye, "p2"), Err(BusError::PeerUnknown(_))));

        // Bare candidates from the forgotten identity no longer resolve
        let flat = r#"{"candidate":"candidate:1","sdpMid":"0","sdpMLineIndex":0}"#;
        assert_eq!(bus.on_incoming(event(&own, flat, "id-p2")), None);
        bus.forget("unknown");
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let relay = MockRelay::new();
        let bus = bus(&relay, "p1", &config());
        assert!(matches!(
            bus.send(&Signal::Bye, "unknown-peer"),
            Err(BusError::PeerUnknown(id)) if id == "unknown-peer"
        ));
    }

    #[tokio::test]
    async fn test_two_buses_exchange() {
        let relay = MockRelay::new();
        let config = config();
        let mut a = bus(&relay, "p1", &config);
        let mut b = bus(&relay, "p2", &config);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        a.connect(tx_a).await.unwrap();
        b.connect(tx_b).await.unwrap();

        // b hears a's presence
        let discovered = loop {
            let ev = rx_b.recv().await.unwrap();
            if let Some(BusEvent::PeerDiscovered(id)) = b.on_incoming(ev) {
                break id;
            }
        };
        assert_eq!(discovered, "p1");

        // b sends a directed bye; a must have mapped b first
        b.send(&Signal::Bye, "p1").unwrap().await.unwrap();
        let got = loop {
            let ev = rx_a.recv().await.unwrap();
            if let Some(BusEvent::Signal { peer_id, signal }) = a.on_incoming(ev) {
                break (peer_id, signal);
            }
        };
        assert_eq!(got, ("p2".to_string(), Signal::Bye));

        a.disconnect().await;
        b.disconnect().await;
        assert!(!a.is_connected());
    }

    #[tokio::test]
    async fn test_password_protected_signals() {
        let relay = MockRelay::new();
        let config = config().with_password("secret");
        let mut a = bus(&relay, "p1", &config);
        let own = a.self_channel().clone();

        let key = SignalKey::derive("secret", "demo", "lobby");
        let content = signal::encode(&Signal::Offer { sdp: "v=0".into() }, "p2", Some(&key)).unwrap();
        assert!(matches!(
            a.on_incoming(event(&own, &content, "id-p2")),
            Some(BusEvent::Signal { signal: Signal::Offer { .. }, .. })
        ));

        let wrong = SignalKey::derive("nope", "demo", "lobby");
        let content = signal::encode(&Signal::Offer { sdp: "v=0".into() }, "p2", Some(&wrong)).unwrap();
        assert_eq!(a.on_incoming(event(&own, &content, "id-p2")), None);
    }
}
