//! webrtc-rs backed peer transports.

use crate::config::IceServer;
use crate::error::TransportError;
use crate::media::LocalTrack;
use crate::transport::{
    IceCandidate, IceState, PeerTransport, RemoteStream, SessionDescription, TransportEvents,
    TransportFactory,
};
use crate::types::ParticipantId;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// G.711 µ-law, the one codec both ends of every call agree on.
pub fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: 8000,
        channels: 1,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

pub struct WebrtcTransportFactory {
    api: API,
}

impl WebrtcTransportFactory {
    pub fn new() -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: pcmu_capability(),
                payload_type: 0,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl TransportFactory for WebrtcTransportFactory {
    async fn create(
        &self,
        participant: &ParticipantId,
        ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(self.api.new_peer_connection(config).await.map_err(rtc_error)?);

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match encode_candidate(&candidate) {
                    Ok(candidate) => events.local_candidate(candidate),
                    Err(e) => log::warn!(
                        "Could not encode ICE candidate for {}: {}",
                        events.participant(),
                        e
                    ),
                }
            })
        }));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    let stream = RemoteStream::new(track.stream_id(), track.id(), track);
                    events.remote_stream(stream);
                })
            },
        ));

        let state_events = events;
        peer_connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                if let Some(state) = ice_state(state) {
                    events.ice_state(state);
                }
            })
        }));

        log::debug!("Created webrtc peer connection for {}", participant);
        Ok(Arc::new(WebrtcPeer { peer_connection }))
    }
}

pub struct WebrtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebrtcPeer {
    async fn local_description(&self) -> Result<SessionDescription, TransportError> {
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| TransportError::msg("no local description after setting one"))?;
        let json = serde_json::to_string(&local).map_err(|e| TransportError(e.into()))?;
        SessionDescription::from_json(&json).map_err(|e| TransportError(e.into()))
    }
}

#[async_trait]
impl PeerTransport for WebrtcPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let sample_track = track.media::<TrackLocalStaticSample>().ok_or_else(|| {
            TransportError::msg(format!("track {} is not a sample track", track.id()))
        })?;
        let sender = self
            .peer_connection
            .add_track(sample_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_error)?;

        // Interceptors only run while RTCP is being read.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.peer_connection.create_offer(None).await.map_err(rtc_error)?;
        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(rtc_error)?;
        self.local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.peer_connection.create_answer(None).await.map_err(rtc_error)?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(rtc_error)?;
        self.local_description().await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc: RTCSessionDescription =
            serde_json::from_str(desc.as_json()).map_err(|e| TransportError(e.into()))?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(rtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let candidate: RTCIceCandidateInit =
            serde_json::from_str(candidate.as_json()).map_err(|e| TransportError(e.into()))?;
        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .map_err(rtc_error)
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            log::warn!("Error closing peer connection: {}", e);
        }
    }
}

fn rtc_error(err: webrtc::Error) -> TransportError {
    TransportError(err.into())
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn encode_candidate(candidate: &RTCIceCandidate) -> anyhow::Result<IceCandidate> {
    let init = candidate.to_json()?;
    Ok(IceCandidate::from_json(&serde_json::to_string(&init)?)?)
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    match state {
        RTCIceConnectionState::New => Some(IceState::New),
        RTCIceConnectionState::Checking => Some(IceState::Checking),
        RTCIceConnectionState::Connected => Some(IceState::Connected),
        RTCIceConnectionState::Completed => Some(IceState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceState::Failed),
        RTCIceConnectionState::Closed => Some(IceState::Closed),
        RTCIceConnectionState::Unspecified => None,
    }
}
