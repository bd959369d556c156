//! Real WebRTC transport engine
//!
//! Wraps the webrtc crate to implement TransportEngine for production use.
//! Callbacks from the peer connection are mapped onto `EngineEvent`s.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::transport::{
    EngineEvent, EngineEventSender, EngineFactory, IceConnectionState, TransportEngine,
    TransportError,
};
use crate::types::{IceCandidate, Role, SdpType, SessionDescription, DATA_CHANNEL_LABEL};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

fn negotiation_err(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

/// Transport engine over one RTCPeerConnection
pub struct WebRtcEngine {
    connection: Arc<RTCPeerConnection>,
    data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
}

impl WebRtcEngine {
    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(negotiation_err)
    }

    /// Wire open/message callbacks of the shared data channel
    async fn attach_channel(
        dc: Arc<RTCDataChannel>,
        slot: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
        events: EngineEventSender,
    ) {
        let open_events = events.clone();
        dc.on_open(Box::new(move || {
            let events = open_events.clone();
            Box::pin(async move {
                let _ = events.send(EngineEvent::DataChannelOpen);
            })
        }));

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(EngineEvent::Data(msg.data.to_vec()));
            })
        }));

        *slot.write().await = Some(dc);
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(negotiation_err)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(negotiation_err)?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.connection
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(negotiation_err)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.connection
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(negotiation_err)
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.connection
            .set_local_description(rollback)
            .await
            .map_err(negotiation_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(negotiation_err)
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        let dc = self
            .data_channel
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        dc.send(&bytes::Bytes::from(data))
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) {
        if let Some(dc) = self.data_channel.write().await.take() {
            let _ = dc.close().await;
        }
        if let Err(e) = self.connection.close().await {
            debug!("[WebRtcEngine] close error: {}", e);
        }
    }
}

/// Creates WebRTC engines with a shared ICE server list
pub struct WebRtcEngineFactory {
    ice_servers: Vec<String>,
}

impl WebRtcEngineFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    async fn create_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        remote_peer_id: &str,
        role: Role,
        events: EngineEventSender,
    ) -> Result<Arc<dyn TransportEngine>, TransportError> {
        let connection = self.create_connection().await?;
        let data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));

        let candidate_events = events.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(EngineEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("[WebRtcEngine] candidate serialization failed: {}", e),
                }
            })
        }));

        let state_events = events.clone();
        connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                let _ = events.send(EngineEvent::IceConnectionState(map_ice_state(state)));
            })
        }));

        let negotiation_events = events.clone();
        connection.on_negotiation_needed(Box::new(move || {
            let events = negotiation_events.clone();
            Box::pin(async move {
                let _ = events.send(EngineEvent::NegotiationNeeded);
            })
        }));

        match role {
            Role::Initiator => {
                let dc = connection
                    .create_data_channel(DATA_CHANNEL_LABEL, None)
                    .await
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
                WebRtcEngine::attach_channel(dc, data_channel.clone(), events).await;
            }
            Role::Responder => {
                let slot = data_channel.clone();
                connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = slot.clone();
                    let events = events.clone();
                    Box::pin(async move {
                        if dc.label() == DATA_CHANNEL_LABEL {
                            WebRtcEngine::attach_channel(dc, slot, events).await;
                        }
                    })
                }));
            }
        }

        debug!("[WebRtcEngine] created {} engine for {}", role, remote_peer_id);
        Ok(Arc::new(WebRtcEngine {
            connection,
            data_channel,
        }))
    }
}
