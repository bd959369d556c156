//! Per-peer negotiation state machine
//!
//! Implements perfect negotiation over a `TransportEngine`:
//! - the initiator's offer always wins a collision; the responder rolls
//!   back its own offer and answers instead
//! - remote candidates are buffered until a remote description is applied
//! - the link reports `Joined` once ICE is connected and the data channel is open
//!
//! Each link runs in its own task (`run_link`) fed by a FIFO command queue,
//! so signals for one peer are handled strictly in arrival order and a slow
//! engine never stalls other peers.

use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{decode_frame, Frame, Inbound};
use crate::signal::Signal;
use crate::transport::{
    EngineEvent, EngineFactory, IceConnectionState, TransportEngine, TransportError,
};
use crate::types::{short_id, IceCandidate, NegotiationState, Role, SessionDescription};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Peer not ready")]
    NotReady,
    #[error("Link closed")]
    Closed,
}

/// What a link reports back to its room
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Signal to deliver to the remote peer
    Signal(Signal),
    Joined,
    Frame(Frame),
    Closed,
}

/// A link event tagged with the link it came from.
/// `generation` distinguishes successive links to the same peer id.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkUpdate {
    pub peer_id: String,
    pub generation: u64,
    pub event: LinkEvent,
}

/// Commands accepted by a running link
#[derive(Debug)]
pub enum PeerCommand {
    Signal(Signal),
    Send(Vec<u8>),
    Close,
}

pub type LinkUpdateSender = mpsc::UnboundedSender<LinkUpdate>;

/// Negotiation state for one remote peer
pub struct PeerLink {
    peer_id: String,
    generation: u64,
    role: Role,
    state: NegotiationState,
    engine: Arc<dyn TransportEngine>,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    ice_connected: bool,
    channel_open: bool,
    joined: bool,
    updates: LinkUpdateSender,
}

impl PeerLink {
    pub fn new(
        peer_id: impl Into<String>,
        generation: u64,
        role: Role,
        engine: Arc<dyn TransportEngine>,
        updates: LinkUpdateSender,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            role,
            state: NegotiationState::Stable,
            engine,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            ice_connected: false,
            channel_open: false,
            joined: false,
            updates,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    fn notify(&self, event: LinkEvent) {
        let _ = self.updates.send(LinkUpdate {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }

    /// Create and send a local offer. No-op unless stable.
    pub async fn initiate(&mut self) {
        if self.state != NegotiationState::Stable {
            debug!(
                "[PeerLink] {} initiate skipped in state {}",
                short_id(&self.peer_id),
                self.state
            );
            return;
        }
        self.state = NegotiationState::MakingOffer;
        match self.make_offer().await {
            Ok(sdp) => {
                self.state = NegotiationState::HaveLocalOffer;
                debug!("[PeerLink] {} sent offer", short_id(&self.peer_id));
                self.notify(LinkEvent::Signal(Signal::Offer { sdp }));
            }
            Err(e) => {
                warn!("[PeerLink] {} offer failed: {}", short_id(&self.peer_id), e);
                self.close().await;
            }
        }
    }

    async fn make_offer(&self) -> Result<String, TransportError> {
        let sdp = self.engine.create_offer().await?;
        self.engine
            .set_local_description(SessionDescription::offer(sdp.clone()))
            .await?;
        Ok(sdp)
    }

    /// Handle a signal from the remote peer
    pub async fn on_signal(&mut self, signal: Signal) {
        if self.is_closed() {
            return;
        }
        match signal {
            Signal::Offer { sdp } => self.on_offer(sdp).await,
            Signal::Answer { sdp } => self.on_answer(sdp).await,
            Signal::Candidate(candidate) => self.on_candidate(candidate).await,
            Signal::Bye => {
                info!("[PeerLink] {} said bye", short_id(&self.peer_id));
                self.close().await;
            }
            Signal::Presence { .. } => {}
        }
    }

    async fn on_offer(&mut self, sdp: String) {
        let collision = self.state != NegotiationState::Stable;
        if collision && self.role == Role::Initiator {
            debug!(
                "[PeerLink] {} ignoring colliding offer in state {}",
                short_id(&self.peer_id),
                self.state
            );
            return;
        }

        match self.answer_offer(sdp, collision).await {
            Ok(answer) => {
                self.state = NegotiationState::Stable;
                debug!("[PeerLink] {} sent answer", short_id(&self.peer_id));
                self.notify(LinkEvent::Signal(Signal::Answer { sdp: answer }));
            }
            Err(e) => {
                warn!("[PeerLink] {} answering failed: {}", short_id(&self.peer_id), e);
                self.close().await;
            }
        }
    }

    async fn answer_offer(&mut self, sdp: String, rollback: bool) -> Result<String, TransportError> {
        if rollback {
            debug!("[PeerLink] {} rolling back local offer", short_id(&self.peer_id));
            self.engine.rollback().await?;
            self.state = NegotiationState::Stable;
        }
        self.engine
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.state = NegotiationState::HaveRemoteOffer;
        self.remote_description_set = true;
        self.flush_candidates().await;

        let answer = self.engine.create_answer().await?;
        self.engine
            .set_local_description(SessionDescription::answer(answer.clone()))
            .await?;
        Ok(answer)
    }

    async fn on_answer(&mut self, sdp: String) {
        if self.state != NegotiationState::HaveLocalOffer {
            debug!(
                "[PeerLink] {} ignoring answer in state {}",
                short_id(&self.peer_id),
                self.state
            );
            return;
        }
        match self
            .engine
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            Ok(()) => {
                self.state = NegotiationState::Stable;
                self.remote_description_set = true;
                self.flush_candidates().await;
            }
            Err(e) => {
                warn!("[PeerLink] {} applying answer failed: {}", short_id(&self.peer_id), e);
                self.close().await;
            }
        }
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_description_set {
            self.pending_candidates.push_back(candidate);
            return;
        }
        self.add_candidate(candidate).await;
    }

    async fn add_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.engine.add_ice_candidate(candidate).await {
            warn!("[PeerLink] {} candidate rejected: {}", short_id(&self.peer_id), e);
        }
    }

    async fn flush_candidates(&mut self) {
        if !self.remote_description_set {
            return;
        }
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.add_candidate(candidate).await;
        }
    }

    /// Handle a notification from the transport engine
    pub async fn on_engine_event(&mut self, event: EngineEvent) {
        if self.is_closed() {
            return;
        }
        match event {
            EngineEvent::IceCandidate(candidate) => {
                self.notify(LinkEvent::Signal(Signal::Candidate(candidate)));
            }
            EngineEvent::IceConnectionState(state) => self.on_ice_state(state).await,
            EngineEvent::DataChannelOpen => {
                self.channel_open = true;
                self.maybe_join();
            }
            EngineEvent::Data(data) => self.on_data(&data),
            EngineEvent::NegotiationNeeded => {
                // The initial offer is driven by role; only renegotiate once up
                if self.joined {
                    self.initiate().await;
                }
            }
        }
    }

    async fn on_ice_state(&mut self, state: IceConnectionState) {
        debug!("[PeerLink] {} ICE state {:?}", short_id(&self.peer_id), state);
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                self.ice_connected = true;
                self.flush_candidates().await;
                self.maybe_join();
            }
            IceConnectionState::Failed | IceConnectionState::Closed => {
                info!("[PeerLink] {} connection {:?}", short_id(&self.peer_id), state);
                self.close().await;
            }
            // Transient; may recover on its own
            IceConnectionState::Disconnected => {}
            IceConnectionState::New | IceConnectionState::Checking => {}
        }
    }

    fn maybe_join(&mut self) {
        if self.joined || !self.ice_connected || !self.channel_open {
            return;
        }
        self.joined = true;
        info!("[PeerLink] {} joined ({})", short_id(&self.peer_id), self.role);
        self.notify(LinkEvent::Joined);
    }

    fn on_data(&self, data: &[u8]) {
        match decode_frame(data) {
            Ok(Inbound::Frame(frame)) => self.notify(LinkEvent::Frame(frame)),
            Ok(Inbound::Raw(raw)) => {
                debug!(
                    "[PeerLink] {} dropped {} byte message without header",
                    short_id(&self.peer_id),
                    raw.len()
                );
            }
            Err(e) => {
                debug!("[PeerLink] {} dropped bad frame: {}", short_id(&self.peer_id), e);
            }
        }
    }

    /// Send bytes on the data channel
    pub async fn send(&self, data: Vec<u8>) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        if !self.joined {
            return Err(PeerError::NotReady);
        }
        self.engine.send(data).await?;
        Ok(())
    }

    /// Close the link. Idempotent; notifies the room exactly once.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
        self.engine.close().await;
        debug!("[PeerLink] {} closed", short_id(&self.peer_id));
        self.notify(LinkEvent::Closed);
    }
}

/// Everything needed to start a link task
pub struct LinkSetup {
    pub peer_id: String,
    pub generation: u64,
    pub role: Role,
    pub factory: Arc<dyn EngineFactory>,
    pub updates: LinkUpdateSender,
}

/// Spawn a link task. Commands queue up while the engine is being created.
pub fn spawn_link(setup: LinkSetup) -> mpsc::UnboundedSender<PeerCommand> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_link(setup, command_rx));
    command_tx
}

/// Drive one link until it closes or its command queue is dropped
pub async fn run_link(setup: LinkSetup, mut commands: mpsc::UnboundedReceiver<PeerCommand>) {
    let (engine_tx, mut engine_rx) = mpsc::unbounded_channel();
    let engine = match setup.factory.create(&setup.peer_id, setup.role, engine_tx).await {
        Ok(engine) => engine,
        Err(e) => {
            warn!("[PeerLink] {} engine creation failed: {}", short_id(&setup.peer_id), e);
            let _ = setup.updates.send(LinkUpdate {
                peer_id: setup.peer_id,
                generation: setup.generation,
                event: LinkEvent::Closed,
            });
            return;
        }
    };

    let mut link = PeerLink::new(setup.peer_id, setup.generation, setup.role, engine, setup.updates);
    if link.role() == Role::Initiator {
        link.initiate().await;
    }

    while !link.is_closed() {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::Signal(signal)) => link.on_signal(signal).await,
                Some(PeerCommand::Send(data)) => {
                    if let Err(e) = link.send(data).await {
                        warn!("[PeerLink] {} send failed: {}", short_id(link.peer_id()), e);
                    }
                }
                Some(PeerCommand::Close) | None => link.close().await,
            },
            Some(event) = engine_rx.recv() => link.on_engine_event(event).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockEngine, MockNetwork};
    use crate::protocol::{encode_message, Payload};

    struct TestLink {
        link: PeerLink,
        engine: Arc<MockEngine>,
        engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
        updates: mpsc::UnboundedReceiver<LinkUpdate>,
    }

    impl TestLink {
        async fn new(network: &Arc<MockNetwork>, peer_id: &str, role: Role) -> Self {
            let (engine_tx, engine_rx) = mpsc::unbounded_channel();
            let (update_tx, updates) = mpsc::unbounded_channel();
            let engine = network.engine(engine_tx).await;
            let dyn_engine: Arc<dyn TransportEngine> = engine.clone();
            Self {
                link: PeerLink::new(peer_id, 1, role, dyn_engine, update_tx),
                engine,
                engine_rx,
                updates,
            }
        }

        /// Feed every queued engine event to the link
        async fn pump_engine(&mut self) {
            while let Ok(event) = self.engine_rx.try_recv() {
                self.link.on_engine_event(event).await;
            }
        }

        fn drain(&mut self) -> Vec<LinkEvent> {
            let mut events = Vec::new();
            while let Ok(update) = self.updates.try_recv() {
                events.push(update.event);
            }
            events
        }

        fn signals(&mut self) -> Vec<Signal> {
            self.drain()
                .into_iter()
                .filter_map(|e| match e {
                    LinkEvent::Signal(s) => Some(s),
                    _ => None,
                })
                .collect()
        }
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 1 10.0.0.2 {} typ host", n, 6000 + n),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    fn offer_of(signals: &[Signal]) -> Signal {
        signals
            .iter()
            .find(|s| matches!(s, Signal::Offer { .. }))
            .cloned()
            .expect("offer")
    }

    fn answer_of(signals: &[Signal]) -> Signal {
        signals
            .iter()
            .find(|s| matches!(s, Signal::Answer { .. }))
            .cloned()
            .expect("answer")
    }

    #[tokio::test]
    async fn test_offer_answer_reaches_join() {
        let network = MockNetwork::new();
        let mut a = TestLink::new(&network, "p2", Role::Initiator).await;
        let mut b = TestLink::new(&network, "p1", Role::Responder).await;

        a.link.initiate().await;
        assert_eq!(a.link.state(), NegotiationState::HaveLocalOffer);
        let offer = offer_of(&a.signals());

        b.link.on_signal(offer).await;
        assert_eq!(b.link.state(), NegotiationState::Stable);
        let answer = answer_of(&b.signals());

        a.link.on_signal(answer).await;
        assert_eq!(a.link.state(), NegotiationState::Stable);

        a.pump_engine().await;
        b.pump_engine().await;
        assert!(a.link.is_joined());
        assert!(b.link.is_joined());
        assert!(a.drain().contains(&LinkEvent::Joined));
        assert!(b.drain().contains(&LinkEvent::Joined));
    }

    #[tokio::test]
    async fn test_glare_initiator_wins() {
        let network = MockNetwork::new();
        let mut a = TestLink::new(&network, "p2", Role::Initiator).await;
        let mut b = TestLink::new(&network, "p1", Role::Responder).await;

        // Both sides offer at once
        a.link.initiate().await;
        b.link.initiate().await;
        let offer_a = offer_of(&a.signals());
        let offer_b = offer_of(&b.signals());

        // Initiator ignores the responder's offer
        a.link.on_signal(offer_b).await;
        assert_eq!(a.link.state(), NegotiationState::HaveLocalOffer);
        assert!(a.signals().is_empty());

        // Responder rolls back and answers
        b.link.on_signal(offer_a).await;
        assert_eq!(b.link.state(), NegotiationState::Stable);
        let answer = answer_of(&b.signals());

        a.link.on_signal(answer).await;
        assert_eq!(a.link.state(), NegotiationState::Stable);

        // Descriptions agree: a's offer is b's remote, b's answer is a's remote
        let a_local = a.engine.local_description().await.unwrap();
        let b_remote = b.engine.remote_description().await.unwrap();
        assert_eq!(a_local, b_remote);
        let b_local = b.engine.local_description().await.unwrap();
        let a_remote = a.engine.remote_description().await.unwrap();
        assert_eq!(b_local, a_remote);

        a.pump_engine().await;
        b.pump_engine().await;
        assert!(a.link.is_joined() && b.link.is_joined());
    }

    #[tokio::test]
    async fn test_renegotiation_after_join() {
        let network = MockNetwork::new();
        let mut a = TestLink::new(&network, "p2", Role::Initiator).await;
        let mut b = TestLink::new(&network, "p1", Role::Responder).await;

        // Ignored until the link is up
        b.link.on_engine_event(EngineEvent::NegotiationNeeded).await;
        assert_eq!(b.link.state(), NegotiationState::Stable);
        assert!(b.signals().is_empty());

        a.link.initiate().await;
        let offer = offer_of(&a.signals());
        b.link.on_signal(offer).await;
        let answer = answer_of(&b.signals());
        a.link.on_signal(answer).await;
        a.pump_engine().await;
        b.pump_engine().await;
        assert!(a.link.is_joined() && b.link.is_joined());
        a.drain();
        b.drain();

        // Either role may renegotiate once joined
        b.link.on_engine_event(EngineEvent::NegotiationNeeded).await;
        assert_eq!(b.link.state(), NegotiationState::HaveLocalOffer);
        let offer = offer_of(&b.signals());

        a.link.on_signal(offer).await;
        assert_eq!(a.link.state(), NegotiationState::Stable);
        let answer = answer_of(&a.signals());

        b.link.on_signal(answer).await;
        assert_eq!(b.link.state(), NegotiationState::Stable);
        assert!(!a.link.is_closed() && !b.link.is_closed());
        assert_eq!(
            a.engine.remote_description().await,
            b.engine.local_description().await
        );
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let network = MockNetwork::new();
        let mut a = TestLink::new(&network, "p2", Role::Initiator).await;
        let mut b = TestLink::new(&network, "p1", Role::Responder).await;

        a.link.initiate().await;
        let offer = offer_of(&a.signals());

        for n in 0..3 {
            b.link.on_signal(Signal::Candidate(candidate(n))).await;
        }
        assert_eq!(b.link.pending_candidates(), 3);
        assert!(b.engine.applied_candidates().await.is_empty());

        b.link.on_signal(offer).await;
        assert_eq!(b.link.pending_candidates(), 0);
        assert_eq!(
            b.engine.applied_candidates().await,
            vec![candidate(0), candidate(1), candidate(2)]
        );

        // Later candidates go straight through
        b.link.on_signal(Signal::Candidate(candidate(3))).await;
        assert_eq!(b.engine.applied_candidates().await.len(), 4);
    }

    #[tokio::test]
    async fn test_local_candidates_are_signaled() {
        let network = MockNetwork::new();
        let mut a = TestLink::new(&network, "p2", Role::Initiator).await;
        a.link.initiate().await;
        a.pump_engine().await;
        let signals = a.signals();
        assert!(signals.iter().any(|s| matches!(s, Signal::Candidate(_))));
    }

    #[tokio::test]
    async fn test_late_answer_ignored() {
        let network = MockNetwork::new();
        let mut a = TestLink::new(&network, "p2", Role::Initiator).await;
        a.link
            .on_signal(Signal::Answer {
                sdp: "mock:e9:answer:1".to_string(),
            })
            .await;
        assert_eq!(a.link.state(), NegotiationState::Stable);
        assert!(!a.link.is_closed());
    }

    #[tokio::test]
    async fn test_failed_offer_closes_link() {
        let network = MockNetwork::new();
        network.set_fail_offers(true).await;
        let mut a = TestLink::new(&network, "p2", Role::Initiator).await;
        a.link.initiate().await;
        assert!(a.link.is_closed());
        assert_eq!(a.drain(), vec![LinkEvent::Closed]);
    }

    #[tokio::test]
    async fn test_bad_offer_closes_link() {
        let network = MockNetwork::new();
        let mut b = TestLink::new(&network, "p1", Role::Responder).await;
        b.link
            .on_signal(Signal::Offer {
                sdp: "garbage".to_string(),
            })
            .await;
        assert!(b.link.is_closed());
    }

    #[tokio::test]
    async fn test_bye_and_close_once() {
        let network = MockNetwork::new();
        let mut a = TestLink::new(&network, "p2", Role::Initiator).await;
        a.link.on_signal(Signal::Bye).await;
        a.link.close().await;
        a.link
            .on_engine_event(EngineEvent::IceConnectionState(IceConnectionState::Failed))
            .await;
        assert!(a.link.is_closed());
        assert!(a.engine.is_closed().await);
        assert_eq!(a.drain(), vec![LinkEvent::Closed]);
    }

    #[tokio::test]
    async fn test_disconnected_is_transient() {
        let network = MockNetwork::new();
        let mut a = TestLink::new(&network, "p2", Role::Initiator).await;
        a.link
            .on_engine_event(EngineEvent::IceConnectionState(IceConnectionState::Disconnected))
            .await;
        assert!(!a.link.is_closed());
        a.link
            .on_engine_event(EngineEvent::IceConnectionState(IceConnectionState::Failed))
            .await;
        assert!(a.link.is_closed());
    }

    #[tokio::test]
    async fn test_send_requires_join() {
        let network = MockNetwork::new();
        let a = TestLink::new(&network, "p2", Role::Initiator).await;
        assert!(matches!(a.link.send(vec![1]).await, Err(PeerError::NotReady)));
    }

    #[tokio::test]
    async fn test_data_decoded_into_frames() {
        let network = MockNetwork::new();
        let mut a = TestLink::new(&network, "p2", Role::Initiator).await;
        let bytes = encode_message("chat", 0, &Payload::Text("hi".to_string())).unwrap();
        a.link.on_engine_event(EngineEvent::Data(bytes)).await;
        a.link.on_engine_event(EngineEvent::Data(vec![1, 2])).await;

        let events = a.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            LinkEvent::Frame(frame) => {
                assert_eq!(frame.action, "chat");
                assert_eq!(frame.payload, Payload::Text("hi".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_link_tasks_connect() {
        let network = MockNetwork::new();
        let factory: Arc<dyn EngineFactory> = Arc::new(network.factory());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let cmd_a = spawn_link(LinkSetup {
            peer_id: "p2".to_string(),
            generation: 1,
            role: Role::Initiator,
            factory: factory.clone(),
            updates: tx_a,
        });
        let cmd_b = spawn_link(LinkSetup {
            peer_id: "p1".to_string(),
            generation: 1,
            role: Role::Responder,
            factory,
            updates: tx_b,
        });

        let mut joined = (false, false);
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !(joined.0 && joined.1) {
            tokio::select! {
                Some(update) = rx_a.recv() => match update.event {
                    LinkEvent::Signal(s) => cmd_b.send(PeerCommand::Signal(s)).unwrap(),
                    LinkEvent::Joined => joined.0 = true,
                    _ => {}
                },
                Some(update) = rx_b.recv() => match update.event {
                    LinkEvent::Signal(s) => cmd_a.send(PeerCommand::Signal(s)).unwrap(),
                    LinkEvent::Joined => joined.1 = true,
                    _ => {}
                },
                _ = tokio::time::sleep_until(deadline) => panic!("links did not join"),
            }
        }

        cmd_a.send(PeerCommand::Close).unwrap();
        loop {
            let update = rx_a.recv().await.unwrap();
            if update.event == LinkEvent::Closed {
                assert_eq!(update.peer_id, "p2");
                break;
            }
        }
    }
}
