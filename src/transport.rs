//! Seam between the mesh and whatever real-time transport backs a peer.
//!
//! Session descriptions and ICE candidates are opaque JSON: the mesh only
//! peeks at the `type` of a description, everything else is forwarded as the
//! exact text the relay delivered.

use crate::config::IceServer;
use crate::error::TransportError;
use crate::media::LocalTrack;
use crate::mesh::MeshEvent;
use crate::types::ParticipantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
    Other,
}

#[derive(Deserialize)]
struct SdpTypeProbe {
    #[serde(rename = "type")]
    kind: String,
}

/// A session description exactly as produced by the local transport or
/// received from a peer, e.g. `{"type":"offer","sdp":"v=0..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(Box<RawValue>);

impl SessionDescription {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        RawValue::from_string(json.to_owned()).map(Self)
    }

    pub fn from_raw(raw: Box<RawValue>) -> Self {
        Self(raw)
    }

    pub fn as_json(&self) -> &str {
        self.0.get()
    }

    pub fn raw(&self) -> &RawValue {
        &self.0
    }

    pub fn sdp_type(&self) -> SdpType {
        match serde_json::from_str::<SdpTypeProbe>(self.0.get()) {
            Ok(probe) if probe.kind == "offer" => SdpType::Offer,
            Ok(probe) if probe.kind == "answer" => SdpType::Answer,
            _ => SdpType::Other,
        }
    }
}

impl PartialEq for SessionDescription {
    fn eq(&self, other: &Self) -> bool {
        self.as_json() == other.as_json()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(Box<RawValue>);

impl IceCandidate {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        RawValue::from_string(json.to_owned()).map(Self)
    }

    pub fn from_raw(raw: Box<RawValue>) -> Self {
        Self(raw)
    }

    pub fn as_json(&self) -> &str {
        self.0.get()
    }

    pub fn raw(&self) -> &RawValue {
        &self.0
    }
}

impl PartialEq for IceCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.as_json() == other.as_json()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IceState::New => "new",
            IceState::Checking => "checking",
            IceState::Connected => "connected",
            IceState::Completed => "completed",
            IceState::Disconnected => "disconnected",
            IceState::Failed => "failed",
            IceState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Inbound media produced by a peer connection. The concrete media object
/// depends on the transport and is recovered with [`RemoteStream::media`].
#[derive(Clone)]
pub struct RemoteStream {
    stream_id: String,
    track_id: String,
    media: Arc<dyn Any + Send + Sync>,
}

impl RemoteStream {
    pub fn new<T: Any + Send + Sync>(
        stream_id: impl Into<String>,
        track_id: impl Into<String>,
        media: Arc<T>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            track_id: track_id.into(),
            media,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn media<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.media.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .finish()
    }
}

#[derive(Debug)]
pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    RemoteStream(RemoteStream),
    IceStateChanged(IceState),
}

#[derive(Debug)]
pub struct TransportEvent {
    pub participant: ParticipantId,
    pub generation: u64,
    pub kind: TransportEventKind,
}

/// Callback sink handed to a transport at creation. Every event is tagged
/// with the connection's generation so the mesh can drop late events from a
/// connection it already closed.
#[derive(Clone)]
pub struct TransportEvents {
    participant: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl TransportEvents {
    pub(crate) fn new(
        participant: ParticipantId,
        generation: u64,
        tx: mpsc::UnboundedSender<MeshEvent>,
    ) -> Self {
        Self {
            participant,
            generation,
            tx,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(TransportEventKind::LocalCandidate(candidate));
    }

    pub fn remote_stream(&self, stream: RemoteStream) {
        self.emit(TransportEventKind::RemoteStream(stream));
    }

    pub fn ice_state(&self, state: IceState) {
        self.emit(TransportEventKind::IceStateChanged(state));
    }

    fn emit(&self, kind: TransportEventKind) {
        // The session may already be gone; nothing to deliver to then.
        let _ = self.tx.send(MeshEvent::Transport(TransportEvent {
            participant: self.participant.clone(),
            generation: self.generation,
            kind,
        }));
    }
}

/// One real-time connection to one remote participant.
///
/// `create_offer` and `create_answer` also install the result as the local
/// description before returning it.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError>;
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        participant: &ParticipantId,
        ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_type_is_read_without_touching_the_text() {
        let json = r#"{"type":"offer", "sdp":"v=0\r\n"}"#;
        let desc = SessionDescription::from_json(json).unwrap();
        assert_eq!(desc.sdp_type(), SdpType::Offer);
        assert_eq!(desc.as_json(), json);

        let answer = SessionDescription::from_json(r#"{"sdp":"v=0","type":"answer"}"#).unwrap();
        assert_eq!(answer.sdp_type(), SdpType::Answer);

        let odd = SessionDescription::from_json(r#"{"type":"rollback"}"#).unwrap();
        assert_eq!(odd.sdp_type(), SdpType::Other);
    }

    #[test]
    fn remote_stream_media_downcasts_to_its_concrete_type() {
        let stream = RemoteStream::new("s1", "t1", Arc::new(42u32));
        assert_eq!(stream.media::<u32>().as_deref(), Some(&42));
        assert!(stream.media::<String>().is_none());
    }
}
