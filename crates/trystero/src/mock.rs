//! Mock implementations for testing and simulation
//!
//! Provides an in-memory relay network and an in-memory transport engine
//! that use channels instead of real Nostr relays and WebRTC.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::topic::{Channel, TOPIC_TAG};
use crate::transport::{
    EngineEvent, EngineEventSender, EngineFactory, IceConnectionState, RelayEvent,
    RelayTransport, TransportEngine, TransportError,
};
use crate::types::{IceCandidate, Role, SdpType, SessionDescription};

// ============================================================================
// Mock Relay Transport
// ============================================================================

/// Mock relay for in-memory signaling.
/// Every published event is delivered to every transport; each transport
/// filters by its own subscriptions, like a real relay would.
pub struct MockRelay {
    tx: broadcast::Sender<RelayEvent>,
    published: AtomicUsize,
}

impl MockRelay {
    /// Create a new mock relay
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport connected to this relay
    pub fn create_transport(self: &Arc<Self>, identity: impl Into<String>) -> MockRelayTransport {
        MockRelayTransport {
            identity: identity.into(),
            relay: self.clone(),
            rx: Mutex::new(None),
            channels: RwLock::new(Vec::new()),
            connected: AtomicBool::new(false),
        }
    }

    /// Deliver a raw event as if some third party had published it
    pub fn inject(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of events published through this relay
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for MockRelay {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self {
            tx,
            published: AtomicUsize::new(0),
        }
    }
}

/// Mock relay transport using broadcast channels.
/// Like a relay filter with `since: now`, it sees only events published
/// after its first subscription.
pub struct MockRelayTransport {
    identity: String,
    relay: Arc<MockRelay>,
    rx: Mutex<Option<broadcast::Receiver<RelayEvent>>>,
    channels: RwLock<Vec<Channel>>,
    connected: AtomicBool,
}

impl MockRelayTransport {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn wants(&self, event: &RelayEvent) -> bool {
        let Some(topic_hash) = event.tag(TOPIC_TAG) else {
            return false;
        };
        self.channels
            .read()
            .await
            .iter()
            .any(|c| c.matches(event.kind, topic_hash))
    }
}

#[async_trait]
impl RelayTransport for MockRelayTransport {
    async fn connect(&self, _relays: &[String]) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.channels.write().await.clear();
        *self.rx.lock().await = None;
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        {
            let mut subscribed = self.channels.write().await;
            for channel in channels {
                if !subscribed.contains(channel) {
                    subscribed.push(channel.clone());
                }
            }
        }
        let mut rx = self.rx.lock().await;
        if rx.is_none() {
            *rx = Some(self.relay.tx.subscribe());
        }
        Ok(())
    }

    async fn publish(&self, channel: &Channel, content: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let event = RelayEvent {
            kind: channel.event_kind,
            tags: vec![(TOPIC_TAG.to_string(), channel.topic_hash.clone())],
            content,
            identity: self.identity.clone(),
        };
        self.relay.published.fetch_add(1, Ordering::Relaxed);
        self.relay
            .tx
            .send(event)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Option<RelayEvent> {
        let mut guard = self.rx.lock().await;
        let rx = guard.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if self.is_connected() && self.wants(&event).await {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    fn identity(&self) -> &str {
        &self.identity
    }
}

// ============================================================================
// Mock Transport Engine
// ============================================================================

const SDP_PREFIX: &str = "mock";

/// In-memory network that routes data between mock engines.
/// Session descriptions are opaque tokens `mock:<engine id>:<type>:<n>`
/// that tell each side which engine is on the other end.
pub struct MockNetwork {
    state: Mutex<NetworkState>,
}

struct NetworkState {
    next_id: u64,
    endpoints: HashMap<String, EngineEventSender>,
    /// When false engines negotiate but never connect
    connectivity: bool,
    fail_offers: bool,
    latency_ms: u64,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetworkState {
                next_id: 0,
                endpoints: HashMap::new(),
                connectivity: true,
                fail_offers: false,
                latency_ms: 0,
            }),
        })
    }

    pub async fn set_connectivity(&self, enabled: bool) {
        self.state.lock().await.connectivity = enabled;
    }

    /// Make every subsequent `create_offer` fail
    pub async fn set_fail_offers(&self, fail: bool) {
        self.state.lock().await.fail_offers = fail;
    }

    /// Simulated latency per data message (ms)
    pub async fn set_latency(&self, latency_ms: u64) {
        self.state.lock().await.latency_ms = latency_ms;
    }

    /// Engine factory backed by this network
    pub fn factory(self: &Arc<Self>) -> MockEngineFactory {
        MockEngineFactory {
            network: self.clone(),
        }
    }

    /// Create a standalone engine on this network
    pub async fn engine(self: &Arc<Self>, events: EngineEventSender) -> Arc<MockEngine> {
        let id = {
            let mut state = self.state.lock().await;
            state.next_id += 1;
            let id = format!("e{}", state.next_id);
            state.endpoints.insert(id.clone(), events.clone());
            id
        };
        Arc::new(MockEngine {
            id,
            network: self.clone(),
            events,
            state: Mutex::new(EngineState::default()),
        })
    }

    pub async fn engine_count(&self) -> usize {
        self.state.lock().await.endpoints.len()
    }

    async fn deliver(&self, to: &str, event: EngineEvent) -> bool {
        let (sender, latency_ms) = {
            let state = self.state.lock().await;
            (state.endpoints.get(to).cloned(), state.latency_ms)
        };
        let Some(sender) = sender else {
            return false;
        };
        if latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency_ms)).await;
        }
        sender.send(event).is_ok()
    }

    async fn unregister(&self, id: &str) {
        self.state.lock().await.endpoints.remove(id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Default)]
struct EngineState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_engine: Option<String>,
    counter: u64,
    applied_candidates: Vec<IceCandidate>,
    connected: bool,
    closed: bool,
}

impl EngineState {
    fn is_stable(&self) -> bool {
        self.signaling == SignalingState::Stable && self.local.is_some() && self.remote.is_some()
    }
}

/// In-memory transport engine
pub struct MockEngine {
    id: String,
    network: Arc<MockNetwork>,
    events: EngineEventSender,
    state: Mutex<EngineState>,
}

impl MockEngine {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Candidates accepted so far, in order
    pub async fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().await.applied_candidates.clone()
    }

    pub async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().await.local.clone()
    }

    pub async fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().await.remote.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn token(&self, sdp_type: SdpType, n: u64) -> String {
        format!("{}:{}:{}:{}", SDP_PREFIX, self.id, sdp_type.as_str(), n)
    }

    fn local_candidate(&self, n: u64) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 10.0.0.1 {} typ host",
                self.id,
                50_000 + n
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    async fn maybe_connect(&self, state: &mut EngineState) {
        if state.connected || !state.is_stable() {
            return;
        }
        if !self.network.state.lock().await.connectivity {
            return;
        }
        state.connected = true;
        self.emit(EngineEvent::IceConnectionState(IceConnectionState::Checking));
        self.emit(EngineEvent::IceConnectionState(IceConnectionState::Connected));
        self.emit(EngineEvent::DataChannelOpen);
    }
}

fn parse_token(sdp: &str) -> Result<(String, SdpType), TransportError> {
    let mut parts = sdp.split(':');
    let (Some(SDP_PREFIX), Some(id), Some(kind)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(TransportError::Negotiation(format!("bad mock sdp: {}", sdp)));
    };
    let kind = match kind {
        "offer" => SdpType::Offer,
        "answer" => SdpType::Answer,
        other => return Err(TransportError::Negotiation(format!("bad sdp type: {}", other))),
    };
    Ok((id.to_string(), kind))
}

#[async_trait]
impl TransportEngine for MockEngine {
    async fn create_offer(&self) -> Result<String, TransportError> {
        if self.network.state.lock().await.fail_offers {
            return Err(TransportError::Negotiation("offer creation failed".to_string()));
        }
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.counter += 1;
        Ok(self.token(SdpType::Offer, state.counter))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(TransportError::Negotiation("no remote offer".to_string()));
        }
        state.counter += 1;
        Ok(self.token(SdpType::Answer, state.counter))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.signaling = match (desc.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::HaveRemoteOffer) => {
                return Err(TransportError::Negotiation("have remote offer".to_string()));
            }
            (SdpType::Offer, _) => SignalingState::HaveLocalOffer,
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (SdpType::Answer, _) => {
                return Err(TransportError::Negotiation("no remote offer to answer".to_string()));
            }
        };
        state.local = Some(desc);
        let candidate = self.local_candidate(state.counter);
        self.emit(EngineEvent::IceCandidate(candidate));
        self.maybe_connect(&mut state).await;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let (remote_id, token_type) = parse_token(&desc.sdp)?;
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        if token_type != desc.sdp_type {
            return Err(TransportError::Negotiation("sdp type mismatch".to_string()));
        }
        state.signaling = match (desc.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::HaveLocalOffer) => {
                return Err(TransportError::Negotiation(
                    "offer collision without rollback".to_string(),
                ));
            }
            (SdpType::Offer, _) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (SdpType::Answer, _) => {
                return Err(TransportError::Negotiation("no local offer".to_string()));
            }
        };
        state.remote_engine = Some(remote_id);
        state.remote = Some(desc);
        self.maybe_connect(&mut state).await;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.signaling == SignalingState::HaveLocalOffer {
            state.signaling = SignalingState::Stable;
            state.local = None;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.remote.is_none() {
            return Err(TransportError::Negotiation("remote description not set".to_string()));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        let remote = {
            let state = self.state.lock().await;
            if state.closed {
                return Err(TransportError::Closed);
            }
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.remote_engine.clone()
        };
        let remote = remote.ok_or(TransportError::NotConnected)?;
        if self.network.deliver(&remote, EngineEvent::Data(data)).await {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    async fn close(&self) {
        let remote = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            let remote = if state.connected {
                state.remote_engine.clone()
            } else {
                None
            };
            state.connected = false;
            remote
        };
        self.network.unregister(&self.id).await;
        if let Some(remote) = remote {
            self.network
                .deliver(
                    &remote,
                    EngineEvent::IceConnectionState(IceConnectionState::Disconnected),
                )
                .await;
        }
    }
}

/// Mock engine factory
pub struct MockEngineFactory {
    network: Arc<MockNetwork>,
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(
        &self,
        _remote_peer_id: &str,
        _role: Role,
        events: EngineEventSender,
    ) -> Result<Arc<dyn TransportEngine>, TransportError> {
        let engine: Arc<dyn TransportEngine> = self.network.engine(events).await;
        Ok(engine)
    }
}
