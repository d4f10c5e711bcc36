use crate::error::CallError;
use crate::transport::{IceCandidate, SdpType, SessionDescription};
use crate::types::{ParticipantId, RoomId};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const CHANNEL_CAPACITY: usize = 100;

/// The `data` of a `signal` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer(_) => "offer",
            SignalPayload::Answer(_) => "answer",
            SignalPayload::Candidate(_) => "ice-candidate",
        }
    }

    fn to_data(&self) -> SignalData<'_> {
        match self {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => SignalData {
                sdp: Some(desc.raw()),
                candidate: None,
            },
            SignalPayload::Candidate(candidate) => SignalData {
                sdp: None,
                candidate: Some(candidate.raw()),
            },
        }
    }

    fn from_data(data: OwnedSignalData) -> Result<Self, FrameError> {
        match (data.sdp, data.candidate) {
            (Some(sdp), _) => {
                let desc = SessionDescription::from_raw(sdp);
                match desc.sdp_type() {
                    SdpType::Offer => Ok(SignalPayload::Offer(desc)),
                    SdpType::Answer => Ok(SignalPayload::Answer(desc)),
                    SdpType::Other => Err(FrameError::UnsupportedSignal),
                }
            }
            (None, Some(candidate)) => Ok(SignalPayload::Candidate(IceCandidate::from_raw(candidate))),
            (None, None) => Err(FrameError::UnsupportedSignal),
        }
    }
}

#[derive(Serialize)]
struct SignalData<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    sdp: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate: Option<&'a RawValue>,
}

#[derive(Deserialize)]
struct OwnedSignalData {
    #[serde(default)]
    sdp: Option<Box<RawValue>>,
    #[serde(default)]
    candidate: Option<Box<RawValue>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Join(RoomId),
    Leave(RoomId),
    Signal {
        to: ParticipantId,
        payload: SignalPayload,
    },
}

#[derive(Serialize)]
struct OutgoingFrame<'a, T: Serialize> {
    event: &'a str,
    data: T,
}

#[derive(Serialize)]
struct OutgoingSignal<'a> {
    to: &'a ParticipantId,
    data: SignalData<'a>,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            ClientMessage::Join(room) => serde_json::to_string(&OutgoingFrame {
                event: "join",
                data: room,
            }),
            ClientMessage::Leave(room) => serde_json::to_string(&OutgoingFrame {
                event: "leave",
                data: room,
            }),
            ClientMessage::Signal { to, payload } => serde_json::to_string(&OutgoingFrame {
                event: "signal",
                data: OutgoingSignal {
                    to,
                    data: payload.to_data(),
                },
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Welcome(ParticipantId),
    RosterSnapshot(Vec<ParticipantId>),
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId),
    Signal {
        from: ParticipantId,
        payload: SignalPayload,
    },
    PresenceCount(u32),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event {0} carries no data")]
    MissingData(String),
    #[error("signal data is neither an offer, an answer nor a candidate")]
    UnsupportedSignal,
}

#[derive(Deserialize)]
struct IncomingFrame {
    event: String,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

#[derive(Deserialize)]
struct IncomingSignal {
    from: ParticipantId,
    data: OwnedSignalData,
}

impl RelayEvent {
    /// Decodes one frame. Unknown events decode to `None`.
    pub fn decode(text: &str) -> Result<Option<Self>, FrameError> {
        let frame: IncomingFrame = serde_json::from_str(text)?;
        let data = match frame.data {
            Some(data) => data,
            None => return Err(FrameError::MissingData(frame.event)),
        };
        let data = data.get();

        let event = match frame.event.as_str() {
            "welcome" => RelayEvent::Welcome(serde_json::from_str(data)?),
            "all-users" => RelayEvent::RosterSnapshot(serde_json::from_str(data)?),
            "user-joined" => RelayEvent::ParticipantJoined(serde_json::from_str(data)?),
            "user-left" => RelayEvent::ParticipantLeft(serde_json::from_str(data)?),
            "user-count" => RelayEvent::PresenceCount(serde_json::from_str(data)?),
            "signal" => {
                let signal: IncomingSignal = serde_json::from_str(data)?;
                RelayEvent::Signal {
                    from: signal.from,
                    payload: SignalPayload::from_data(signal.data)?,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Raw text frames to and from a relay.
pub struct RelayChannel {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn open(&self, url: &str) -> anyhow::Result<RelayChannel>;
}

/// Relay over a WebSocket, one JSON text frame per message.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn open(&self, url: &str) -> anyhow::Result<RelayChannel> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    log::warn!("Relay write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if incoming_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        log::info!("Relay closed the connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Relay read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(RelayChannel {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

/// Cloneable sending half of a signaling connection.
#[derive(Clone)]
pub struct RelaySender {
    tx: mpsc::Sender<String>,
}

impl RelaySender {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, msg: &ClientMessage) -> Result<(), CallError> {
        let json = msg
            .encode()
            .map_err(|e| CallError::SignalingDisconnected(format!("failed to encode message: {}", e)))?;
        self.tx
            .send(json)
            .await
            .map_err(|_| CallError::SignalingDisconnected("relay connection closed".to_owned()))
    }

    pub async fn send_signal(&self, to: &ParticipantId, payload: SignalPayload) -> Result<(), CallError> {
        log::debug!("Sending {} to {}", payload.kind(), to);
        self.send(&ClientMessage::Signal {
            to: to.clone(),
            payload,
        })
        .await
    }
}

/// A live relay connection bound to the participant id the relay issued.
pub struct SignalingClient {
    local_id: ParticipantId,
    sender: RelaySender,
    rx: mpsc::Receiver<String>,
}

impl SignalingClient {
    /// Opens the relay channel and waits for the `welcome` frame.
    pub async fn connect(
        connector: &dyn RelayConnector,
        url: &str,
        handshake_timeout: Duration,
    ) -> Result<Self, CallError> {
        let channel = connector
            .open(url)
            .await
            .map_err(|e| CallError::SignalingDisconnected(format!("failed to reach {}: {}", url, e)))?;
        let mut rx = channel.incoming;

        let local_id = tokio::time::timeout(handshake_timeout, wait_for_welcome(&mut rx))
            .await
            .map_err(|_| CallError::SignalingDisconnected("relay sent no welcome".to_owned()))??;
        log::info!("Connected to relay {} as {}", url, local_id);

        Ok(Self {
            local_id,
            sender: RelaySender::new(channel.outgoing),
            rx,
        })
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn sender(&self) -> RelaySender {
        self.sender.clone()
    }

    pub async fn join_room(&self, room: &RoomId) -> Result<(), CallError> {
        log::info!("Joining room {}", room);
        self.sender.send(&ClientMessage::Join(room.clone())).await
    }

    pub async fn leave_room(&self, room: &RoomId) -> Result<(), CallError> {
        self.sender.send(&ClientMessage::Leave(room.clone())).await
    }

    pub async fn send_signal(&self, to: &ParticipantId, payload: SignalPayload) -> Result<(), CallError> {
        self.sender.send_signal(to, payload).await
    }

    /// Next room event, or `None` once the relay connection is gone.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        loop {
            let text = self.rx.recv().await?;
            match RelayEvent::decode(&text) {
                Ok(Some(RelayEvent::Welcome(id))) => {
                    log::debug!("Ignoring repeated welcome for {}", id);
                }
                Ok(Some(event)) => return Some(event),
                Ok(None) => log::debug!("Ignoring unknown relay frame: {}", text),
                Err(e) => log::warn!("Dropping relay frame: {}", e),
            }
        }
    }
}

async fn wait_for_welcome(rx: &mut mpsc::Receiver<String>) -> Result<ParticipantId, CallError> {
    while let Some(text) = rx.recv().await {
        match RelayEvent::decode(&text) {
            Ok(Some(RelayEvent::Welcome(id))) => return Ok(id),
            Ok(_) => log::warn!("Frame before welcome ignored: {}", text),
            Err(e) => log::warn!("Dropping relay frame: {}", e),
        }
    }
    Err(CallError::SignalingDisconnected(
        "relay closed during handshake".to_owned(),
    ))
}
