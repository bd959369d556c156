//! Room: the public surface and the actor behind it
//!
//! A `Room` is a cheap handle. All mutable state (peer records, action
//! registry, signal bus) lives in one spawned actor task; the handle and
//! every `Action` talk to it over a command channel. Per-peer negotiation
//! runs in separate link tasks that report back over an update channel.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RoomConfig;
use crate::peer::{spawn_link, LinkEvent, LinkSetup, LinkUpdate, PeerCommand};
use crate::protocol::{encode_message, validate_type, Frame, FrameError, Payload};
use crate::signal::Signal;
use crate::signaling::{BusError, BusEvent, SignalBus};
use crate::transport::{EngineFactory, RelayEvent, RelayTransport, TransportError};
use crate::types::{short_id, Role, RoomIdentity};

/// How long `leave` waits for goodbye messages to reach the relays
const BYE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Unknown peer: {0}")]
    PeerUnknown(String),
    #[error("Peer not ready: {0}")]
    PeerNotReady(String),
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Invalid action: {0}")]
    InvalidAction(#[from] FrameError),
    #[error("Identity error: {0}")]
    Identity(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Room closed")]
    Closed,
}

impl From<BusError> for RoomError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::PeerUnknown(id) => RoomError::PeerUnknown(id),
            BusError::Transport(e) => RoomError::Transport(e),
            BusError::Signal(e) => RoomError::Transport(TransportError::SendFailed(e.to_string())),
        }
    }
}

/// Called with the peer id on join / leave
pub type PeerHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Called with the payload and the sending peer id
pub type ActionHandler = Arc<dyn Fn(Payload, &str) + Send + Sync>;

enum RoomCommand {
    Join(oneshot::Sender<Result<(), RoomError>>),
    Leave(oneshot::Sender<()>),
    RegisterAction(String),
    SetActionHandler(String, ActionHandler),
    Send {
        action: String,
        data: Vec<u8>,
        target: Option<String>,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    OnPeerJoin(PeerHandler),
    OnPeerLeave(PeerHandler),
    GetPeers(oneshot::Sender<Vec<String>>),
}

/// A room on the relay network
pub struct Room {
    identity: RoomIdentity,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl Room {
    /// Create a room over the given relay transport and engine factory.
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: RoomConfig,
        room_name: impl Into<String>,
        relay: Arc<dyn RelayTransport>,
        engines: Arc<dyn EngineFactory>,
    ) -> Result<Self, RoomError> {
        let identity = RoomIdentity::new(config.app_id.clone(), room_name);
        Self::with_identity(config, identity, relay, engines)
    }

    /// Create a room with a fixed self id
    pub fn with_self_id(
        config: RoomConfig,
        room_name: impl Into<String>,
        self_id: impl Into<String>,
        relay: Arc<dyn RelayTransport>,
        engines: Arc<dyn EngineFactory>,
    ) -> Result<Self, RoomError> {
        let identity = RoomIdentity::with_self_id(config.app_id.clone(), room_name, self_id);
        Self::with_identity(config, identity, relay, engines)
    }

    /// Create a room over Nostr relays and WebRTC
    pub fn with_nostr(config: RoomConfig, room_name: impl Into<String>) -> Result<Self, RoomError> {
        let keys = match config.secret_key.as_deref() {
            Some(secret) => nostr_sdk::Keys::parse(secret)
                .map_err(|e| RoomError::Identity(e.to_string()))?,
            None => nostr_sdk::Keys::generate(),
        };
        let relay: Arc<dyn RelayTransport> = Arc::new(crate::nostr::NostrRelayTransport::new(keys));
        let engines: Arc<dyn EngineFactory> = Arc::new(
            crate::real_factory::WebRtcEngineFactory::new(config.ice_servers.clone()),
        );
        Self::new(config, room_name, relay, engines)
    }

    fn with_identity(
        config: RoomConfig,
        identity: RoomIdentity,
        relay: Arc<dyn RelayTransport>,
        engines: Arc<dyn EngineFactory>,
    ) -> Result<Self, RoomError> {
        config
            .validate()
            .map_err(|e| RoomError::Config(e.to_string()))?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let actor = RoomActor::new(config, identity.clone(), relay, engines);
        tokio::spawn(actor.run(command_rx));

        info!(
            "[Room] created {}@{} as {}",
            identity.app_id,
            identity.room_name,
            short_id(&identity.self_id)
        );
        Ok(Self { identity, commands })
    }

    pub fn self_id(&self) -> &str {
        &self.identity.self_id
    }

    pub fn identity(&self) -> &RoomIdentity {
        &self.identity
    }

    /// Connect to relays and start announcing. No-op when already joined.
    pub async fn join(&self) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RoomCommand::Join(tx))
            .map_err(|_| RoomError::Closed)?;
        rx.await.map_err(|_| RoomError::Closed)?
    }

    /// Say goodbye, close every link and disconnect. No-op when not joined.
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(RoomCommand::Leave(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Register a named action. Names are 1 to 12 bytes.
    pub fn make_action(&self, name: &str) -> Result<Action, RoomError> {
        validate_type(name)?;
        self.commands
            .send(RoomCommand::RegisterAction(name.to_string()))
            .map_err(|_| RoomError::Closed)?;
        Ok(Action {
            name: name.to_string(),
            nonce: Arc::new(AtomicU8::new(0)),
            commands: self.commands.clone(),
        })
    }

    pub fn on_peer_join(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        let _ = self.commands.send(RoomCommand::OnPeerJoin(Arc::new(handler)));
    }

    pub fn on_peer_leave(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        let _ = self.commands.send(RoomCommand::OnPeerLeave(Arc::new(handler)));
    }

    /// Peers with an open data channel
    pub async fn get_peers(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(RoomCommand::GetPeers(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// A named logical channel multiplexed over every peer's data channel
#[derive(Clone)]
pub struct Action {
    name: String,
    nonce: Arc<AtomicU8>,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl Action {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send to one peer, or to every connected peer when `target` is None
    pub async fn send(&self, payload: impl Into<Payload>, target: Option<&str>) -> Result<(), RoomError> {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let data = encode_message(&self.name, nonce, &payload.into())?;
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RoomCommand::Send {
                action: self.name.clone(),
                data,
                target: target.map(str::to_string),
                reply: tx,
            })
            .map_err(|_| RoomError::Closed)?;
        rx.await.map_err(|_| RoomError::Closed)?
    }

    /// Handle incoming messages of this action. Replaces any previous handler.
    pub fn on_receive(&self, handler: impl Fn(Payload, &str) + Send + Sync + 'static) {
        let _ = self
            .commands
            .send(RoomCommand::SetActionHandler(self.name.clone(), Arc::new(handler)));
    }
}

struct PeerRecord {
    role: Role,
    generation: u64,
    commands: mpsc::UnboundedSender<PeerCommand>,
    joined: bool,
    watchdog: JoinHandle<()>,
}

struct RoomActor {
    identity: RoomIdentity,
    config: RoomConfig,
    engines: Arc<dyn EngineFactory>,
    bus: SignalBus,
    joined: bool,
    peers: HashMap<String, PeerRecord>,
    actions: HashMap<String, Option<ActionHandler>>,
    on_join: Option<PeerHandler>,
    on_leave: Option<PeerHandler>,
    next_generation: u64,
    relay_tx: mpsc::UnboundedSender<RelayEvent>,
    relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    link_tx: mpsc::UnboundedSender<LinkUpdate>,
    link_rx: mpsc::UnboundedReceiver<LinkUpdate>,
    timeout_tx: mpsc::UnboundedSender<(String, u64)>,
    timeout_rx: mpsc::UnboundedReceiver<(String, u64)>,
}

impl RoomActor {
    fn new(
        config: RoomConfig,
        identity: RoomIdentity,
        relay: Arc<dyn RelayTransport>,
        engines: Arc<dyn EngineFactory>,
    ) -> Self {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        Self {
            bus: SignalBus::new(identity.clone(), &config, relay),
            identity,
            config,
            engines,
            joined: false,
            peers: HashMap::new(),
            actions: HashMap::new(),
            on_join: None,
            on_leave: None,
            next_generation: 0,
            relay_tx,
            relay_rx,
            link_tx,
            link_rx,
            timeout_tx,
            timeout_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RoomCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.relay_rx.recv() => self.handle_relay_event(event),
                Some(update) = self.link_rx.recv() => self.handle_link_update(update),
                Some((peer_id, generation)) = self.timeout_rx.recv() => {
                    self.handle_timeout(&peer_id, generation)
                }
            }
        }
        // Every handle is gone
        self.leave().await;
        debug!("[Room] {} actor stopped", short_id(&self.identity.self_id));
    }

    async fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join(reply) => {
                let _ = reply.send(self.join().await);
            }
            RoomCommand::Leave(reply) => {
                self.leave().await;
                let _ = reply.send(());
            }
            RoomCommand::RegisterAction(name) => {
                self.actions.entry(name).or_insert(None);
            }
            RoomCommand::SetActionHandler(name, handler) => {
                self.actions.insert(name, Some(handler));
            }
            RoomCommand::Send {
                action,
                data,
                target,
                reply,
            } => {
                let _ = reply.send(self.send(&action, data, target.as_deref()));
            }
            RoomCommand::OnPeerJoin(handler) => self.on_join = Some(handler),
            RoomCommand::OnPeerLeave(handler) => self.on_leave = Some(handler),
            RoomCommand::GetPeers(reply) => {
                let mut peers: Vec<String> = self
                    .peers
                    .iter()
                    .filter(|(_, record)| record.joined)
                    .map(|(id, _)| id.clone())
                    .collect();
                peers.sort();
                let _ = reply.send(peers);
            }
        }
    }

    async fn join(&mut self) -> Result<(), RoomError> {
        if self.joined {
            return Ok(());
        }
        self.bus.connect(self.relay_tx.clone()).await?;
        self.joined = true;
        info!(
            "[Room] {} joined {}@{}",
            short_id(&self.identity.self_id),
            self.identity.app_id,
            self.identity.room_name
        );
        Ok(())
    }

    async fn leave(&mut self) {
        if !self.joined {
            return;
        }
        self.joined = false;

        let byes: Vec<JoinHandle<()>> = self
            .peers
            .keys()
            .filter_map(|peer_id| self.bus.send(&Signal::Bye, peer_id).ok())
            .collect();
        if !byes.is_empty()
            && tokio::time::timeout(BYE_FLUSH_TIMEOUT, join_all(byes))
                .await
                .is_err()
        {
            debug!("[Room] goodbye messages still in flight");
        }

        for (_, record) in self.peers.drain() {
            record.watchdog.abort();
            let _ = record.commands.send(PeerCommand::Close);
        }
        self.bus.disconnect().await;
        self.actions.clear();

        // Anything already queued belongs to the previous session
        while self.relay_rx.try_recv().is_ok() {}
        while self.link_rx.try_recv().is_ok() {}
        while self.timeout_rx.try_recv().is_ok() {}

        info!("[Room] {} left", short_id(&self.identity.self_id));
    }

    fn send(&mut self, action: &str, data: Vec<u8>, target: Option<&str>) -> Result<(), RoomError> {
        if !self.actions.contains_key(action) {
            return Err(RoomError::UnknownAction(action.to_string()));
        }
        match target {
            Some(peer_id) => {
                let record = self
                    .peers
                    .get(peer_id)
                    .ok_or_else(|| RoomError::PeerUnknown(peer_id.to_string()))?;
                if !record.joined {
                    return Err(RoomError::PeerNotReady(peer_id.to_string()));
                }
                record
                    .commands
                    .send(PeerCommand::Send(data))
                    .map_err(|_| RoomError::PeerNotReady(peer_id.to_string()))
            }
            None => {
                for record in self.peers.values().filter(|r| r.joined) {
                    let _ = record.commands.send(PeerCommand::Send(data.clone()));
                }
                Ok(())
            }
        }
    }

    fn handle_relay_event(&mut self, event: RelayEvent) {
        if !self.joined {
            return;
        }
        match self.bus.on_incoming(event) {
            Some(BusEvent::PeerDiscovered(peer_id)) => {
                let known = self.peers.contains_key(&peer_id);
                let role = self.ensure_peer(&peer_id).map(|record| record.role);
                // The initiator would otherwise wait for our next announcement
                if !known && role == Some(Role::Responder) {
                    self.announce_to(&peer_id);
                }
            }
            Some(BusEvent::Signal { peer_id, signal }) => {
                if signal == Signal::Bye && !self.peers.contains_key(&peer_id) {
                    return;
                }
                if let Some(record) = self.ensure_peer(&peer_id) {
                    let _ = record.commands.send(PeerCommand::Signal(signal));
                }
            }
            None => {}
        }
    }

    fn announce_to(&self, peer_id: &str) {
        let presence = Signal::Presence {
            peer_id: self.identity.self_id.clone(),
        };
        match self.bus.send(&presence, peer_id) {
            Ok(_) => debug!("[Room] announced to {}", short_id(peer_id)),
            Err(e) => debug!("[Room] cannot announce to {}: {}", short_id(peer_id), e),
        }
    }

    /// Look up or create the record for a peer. Creation happens only here,
    /// on the actor, so there is never more than one record per id.
    fn ensure_peer(&mut self, peer_id: &str) -> Option<&PeerRecord> {
        if peer_id == self.identity.self_id {
            return None;
        }
        if !self.peers.contains_key(peer_id) {
            self.next_generation += 1;
            let generation = self.next_generation;
            let role = Role::resolve(&self.identity.self_id, peer_id);

            let commands = spawn_link(LinkSetup {
                peer_id: peer_id.to_string(),
                generation,
                role,
                factory: self.engines.clone(),
                updates: self.link_tx.clone(),
            });

            let timeout = Duration::from_millis(self.config.connect_timeout_ms);
            let timeout_tx = self.timeout_tx.clone();
            let id = peer_id.to_string();
            let watchdog = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = timeout_tx.send((id, generation));
            });

            debug!(
                "[Room] new peer {} as {} (gen {})",
                short_id(peer_id),
                role,
                generation
            );
            self.peers.insert(
                peer_id.to_string(),
                PeerRecord {
                    role,
                    generation,
                    commands,
                    joined: false,
                    watchdog,
                },
            );
        }
        self.peers.get(peer_id)
    }

    fn handle_link_update(&mut self, update: LinkUpdate) {
        let current = self
            .peers
            .get(&update.peer_id)
            .map(|r| r.generation == update.generation)
            .unwrap_or(false);
        if !current {
            debug!(
                "[Room] stale update from {} (gen {})",
                short_id(&update.peer_id),
                update.generation
            );
            return;
        }

        match update.event {
            LinkEvent::Signal(signal) => {
                if let Err(e) = self.bus.send(&signal, &update.peer_id) {
                    warn!("[Room] cannot signal {}: {}", short_id(&update.peer_id), e);
                }
            }
            LinkEvent::Joined => {
                if let Some(record) = self.peers.get_mut(&update.peer_id) {
                    record.joined = true;
                    record.watchdog.abort();
                    info!(
                        "[Room] peer {} joined as {}",
                        short_id(&update.peer_id),
                        record.role
                    );
                }
                if let Some(handler) = &self.on_join {
                    handler(&update.peer_id);
                }
            }
            LinkEvent::Frame(frame) => self.dispatch(frame, &update.peer_id),
            LinkEvent::Closed => {
                if let Some(record) = self.peers.remove(&update.peer_id) {
                    record.watchdog.abort();
                    self.bus.forget(&update.peer_id);
                    info!("[Room] peer {} left", short_id(&update.peer_id));
                    if record.joined {
                        if let Some(handler) = &self.on_leave {
                            handler(&update.peer_id);
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame, peer_id: &str) {
        if !frame.flags.is_last || frame.flags.is_meta {
            debug!(
                "[Room] dropped chunked frame for {} from {}",
                frame.action,
                short_id(peer_id)
            );
            return;
        }
        match self.actions.get(&frame.action) {
            Some(Some(handler)) => handler(frame.payload, peer_id),
            Some(None) => debug!("[Room] no handler for action {}", frame.action),
            None => debug!(
                "[Room] frame for unregistered action {} from {}",
                frame.action,
                short_id(peer_id)
            ),
        }
    }

    fn handle_timeout(&mut self, peer_id: &str, generation: u64) {
        let expired = self
            .peers
            .get(peer_id)
            .map(|r| r.generation == generation && !r.joined)
            .unwrap_or(false);
        if !expired {
            return;
        }
        if let Some(record) = self.peers.remove(peer_id) {
            self.bus.forget(peer_id);
            warn!(
                "[Room] peer {} did not connect within {}ms",
                short_id(peer_id),
                self.config.connect_timeout_ms
            );
            let _ = record.commands.send(PeerCommand::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockNetwork, MockRelay};

    fn room(relay: &Arc<MockRelay>, network: &Arc<MockNetwork>, self_id: &str) -> Room {
        let mut config = RoomConfig::new("demo");
        config.announce_interval_ms = 100;
        config.announce_jitter_ms = 10;
        Room::with_self_id(
            config,
            "lobby",
            self_id,
            Arc::new(relay.create_transport(format!("id-{}", self_id))),
            Arc::new(network.factory()),
        )
        .unwrap()
    }

    #[test]
    fn test_bus_error_mapping() {
        assert!(matches!(
            RoomError::from(BusError::PeerUnknown("x".to_string())),
            RoomError::PeerUnknown(id) if id == "x"
        ));
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let relay = MockRelay::new();
        let network = MockNetwork::new();
        let result = Room::new(
            RoomConfig::new(""),
            "lobby",
            Arc::new(relay.create_transport("a")),
            Arc::new(network.factory()),
        );
        assert!(matches!(result, Err(RoomError::Config(_))));
    }

    #[tokio::test]
    async fn test_bad_secret_key_is_fatal() {
        let mut config = RoomConfig::new("demo");
        config.secret_key = Some("not a key".to_string());
        assert!(matches!(
            Room::with_nostr(config, "lobby"),
            Err(RoomError::Identity(_))
        ));
    }

    #[tokio::test]
    async fn test_action_name_limits() {
        let relay = MockRelay::new();
        let network = MockNetwork::new();
        let room = room(&relay, &network, "p1");
        assert!(room.make_action("chat").is_ok());
        assert!(matches!(
            room.make_action("much-too-long-name"),
            Err(RoomError::InvalidAction(FrameError::TypeTooLong(18)))
        ));
        assert!(matches!(
            room.make_action(""),
            Err(RoomError::InvalidAction(FrameError::EmptyType))
        ));
        assert!(matches!(
            room.make_action("a\0b"),
            Err(RoomError::InvalidAction(FrameError::NulInType))
        ));
    }

    #[tokio::test]
    async fn test_join_and_leave_are_idempotent() {
        let relay = MockRelay::new();
        let network = MockNetwork::new();
        let room = room(&relay, &network, "p1");
        room.join().await.unwrap();
        room.join().await.unwrap();
        room.leave().await;
        room.leave().await;
        assert!(room.get_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let relay = MockRelay::new();
        let network = MockNetwork::new();
        let room = room(&relay, &network, "p1");
        room.join().await.unwrap();
        let chat = room.make_action("chat").unwrap();
        assert!(matches!(
            chat.send("hi", Some("unknown-peer")).await,
            Err(RoomError::PeerUnknown(id)) if id == "unknown-peer"
        ));
        // Broadcast with nobody around is fine
        chat.send("hi", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_actions_cleared_on_leave() {
        let relay = MockRelay::new();
        let network = MockNetwork::new();
        let room = room(&relay, &network, "p1");
        room.join().await.unwrap();
        let chat = room.make_action("chat").unwrap();
        room.leave().await;
        assert!(matches!(
            chat.send("hi", None).await,
            Err(RoomError::UnknownAction(_))
        ));
    }
}
