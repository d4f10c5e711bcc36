use crate::config::CallConfig;
use crate::connection::ConnectionState;
use crate::error::{CallError, Result};
use crate::media::{LocalMediaSource, MediaDevice};
use crate::mesh::{MeshEvent, PeerConnectionMesh};
use crate::signaling::{RelayConnector, RelayEvent, SignalingClient};
use crate::transport::{RemoteStream, TransportFactory};
use crate::types::{ParticipantId, RoomId};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotJoined,
    Joining,
    Joined,
    Leaving,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::NotJoined => write!(f, "NotJoined"),
            SessionState::Joining => write!(f, "Joining"),
            SessionState::Joined => write!(f, "Joined"),
            SessionState::Leaving => write!(f, "Leaving"),
        }
    }
}

/// Everything the host renders.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(SessionState),
    RemoteStream {
        participant: ParticipantId,
        stream: RemoteStream,
    },
    RemoteStreamRemoved(ParticipantId),
    PresenceCount(u32),
    /// Room members, self first.
    RosterChanged(Vec<ParticipantId>),
    PeerConnectionState {
        participant: ParticipantId,
        state: ConnectionState,
    },
    Error(CallError),
}

/// The outside world a session talks to.
#[derive(Clone)]
pub struct Backends {
    pub media: Arc<dyn MediaDevice>,
    pub relay: Arc<dyn RelayConnector>,
    pub transports: Arc<dyn TransportFactory>,
}

#[derive(Debug)]
pub enum LoopEvent {
    /// `None` when the relay connection is gone.
    Relay(Option<RelayEvent>),
    Mesh(MeshEvent),
}

struct ActiveCall {
    room: RoomId,
    signaling: SignalingClient,
    mesh: PeerConnectionMesh,
    mesh_rx: mpsc::UnboundedReceiver<MeshEvent>,
    roster: Vec<ParticipantId>,
}

impl ActiveCall {
    fn merge_snapshot(&mut self, ids: &[ParticipantId]) -> bool {
        let mut changed = false;
        for id in ids {
            if !self.roster.contains(id) {
                self.roster.push(id.clone());
                changed = true;
            }
        }
        changed
    }

    fn add(&mut self, id: &ParticipantId) -> bool {
        if self.roster.contains(id) {
            return false;
        }
        self.roster.push(id.clone());
        true
    }

    fn remove(&mut self, id: &ParticipantId) -> bool {
        let before = self.roster.len();
        self.roster.retain(|member| member != id);
        self.roster.len() != before
    }
}

/// Join/leave lifecycle of one voice call.
///
/// The controller is driven by a single loop: `next_event` yields the next
/// relay or mesh event and `handle` applies it. Nothing else mutates it.
pub struct CallSessionController {
    config: CallConfig,
    relay: Arc<dyn RelayConnector>,
    transports: Arc<dyn TransportFactory>,
    media: LocalMediaSource,
    state: SessionState,
    active: Option<ActiveCall>,
    outputs: mpsc::UnboundedSender<CallEvent>,
}

impl CallSessionController {
    pub fn new(
        config: CallConfig,
        backends: Backends,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (outputs, events) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            relay: backends.relay,
            transports: backends.transports,
            media: LocalMediaSource::new(backends.media),
            state: SessionState::NotJoined,
            active: None,
            outputs,
        };
        (controller, events)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.active.as_ref().map(|a| &a.room)
    }

    pub fn local_id(&self) -> Option<&ParticipantId> {
        self.active.as_ref().map(|a| a.signaling.local_id())
    }

    pub fn roster(&self) -> &[ParticipantId] {
        self.active.as_ref().map_or(&[], |a| a.roster.as_slice())
    }

    pub fn mesh(&self) -> Option<&PeerConnectionMesh> {
        self.active.as_ref().map(|a| &a.mesh)
    }

    pub fn connection_count(&self) -> usize {
        self.mesh().map_or(0, |m| m.len())
    }

    pub fn media(&self) -> &LocalMediaSource {
        &self.media
    }

    /// Acquires the microphone, connects to the relay and asks to join.
    /// The session becomes `Joined` once the first roster snapshot arrives.
    pub async fn join(&mut self, room: &str) -> Result<()> {
        match self.state {
            SessionState::NotJoined => {}
            SessionState::Joining => return Err(CallError::AlreadyJoining),
            SessionState::Joined | SessionState::Leaving => return Err(CallError::AlreadyJoined),
        }

        let room = RoomId::new(room);
        self.set_state(SessionState::Joining);
        match self.start(&room).await {
            Ok(active) => {
                self.active = Some(active);
                Ok(())
            }
            Err(e) => {
                log::error!("Joining room {} failed: {}", room, e);
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Closes every connection, releases the microphone and drops the relay.
    /// Safe in any state, including halfway through a join.
    pub async fn leave(&mut self) {
        if self.state == SessionState::NotJoined
            && self.active.is_none()
            && !self.media.is_acquired()
        {
            return;
        }
        if let Some(room) = self.room() {
            log::info!("Leaving room {}", room);
        }
        self.set_state(SessionState::Leaving);
        self.teardown().await;
    }

    /// Waits for the next event of the active call; `None` when there is none.
    pub async fn next_event(&mut self) -> Option<LoopEvent> {
        let active = self.active.as_mut()?;
        tokio::select! {
            event = active.signaling.recv() => Some(LoopEvent::Relay(event)),
            Some(event) = active.mesh_rx.recv() => Some(LoopEvent::Mesh(event)),
        }
    }

    pub async fn handle(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Relay(Some(event)) => self.on_relay_event(event).await,
            LoopEvent::Relay(None) => {
                self.fail(CallError::SignalingDisconnected(
                    "relay connection lost".to_owned(),
                ))
                .await
            }
            LoopEvent::Mesh(event) => {
                if let Some(active) = self.active.as_mut() {
                    active.mesh.handle_event(event).await;
                }
            }
        }
    }

    async fn start(&mut self, room: &RoomId) -> Result<ActiveCall> {
        let stream = self.media.acquire().await?;
        let signaling = SignalingClient::connect(
            self.relay.as_ref(),
            &self.config.relay_url,
            self.config.handshake_timeout,
        )
        .await?;
        signaling.join_room(room).await?;

        let local_id = signaling.local_id().clone();
        let (mesh, mesh_rx) = PeerConnectionMesh::new(
            local_id.clone(),
            stream,
            self.transports.clone(),
            signaling.sender(),
            &self.config,
            self.outputs.clone(),
        );
        Ok(ActiveCall {
            room: room.clone(),
            signaling,
            mesh,
            mesh_rx,
            roster: vec![local_id],
        })
    }

    async fn on_relay_event(&mut self, event: RelayEvent) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        match event {
            RelayEvent::RosterSnapshot(ids) => {
                log::info!("All users in room {}: {:?}", active.room, ids);
                if active.merge_snapshot(&ids) {
                    let _ = self.outputs.send(CallEvent::RosterChanged(active.roster.clone()));
                }
                active.mesh.on_roster_snapshot(&ids).await;
                if self.state == SessionState::Joining {
                    self.set_state(SessionState::Joined);
                }
            }
            RelayEvent::ParticipantJoined(id) => {
                log::info!("User joined: {}", id);
                if active.add(&id) {
                    let _ = self.outputs.send(CallEvent::RosterChanged(active.roster.clone()));
                }
                active.mesh.on_participant_joined(&id).await;
            }
            RelayEvent::ParticipantLeft(id) => {
                log::info!("User left: {}", id);
                if active.remove(&id) {
                    let _ = self.outputs.send(CallEvent::RosterChanged(active.roster.clone()));
                }
                active.mesh.on_participant_left(&id).await;
            }
            RelayEvent::Signal { from, payload } => {
                active.mesh.on_signal(&from, payload).await;
            }
            RelayEvent::PresenceCount(count) => {
                let _ = self.outputs.send(CallEvent::PresenceCount(count));
            }
            RelayEvent::Welcome(id) => {
                log::debug!("Ignoring welcome for {} mid-session", id);
            }
        }
    }

    async fn fail(&mut self, error: CallError) {
        log::error!("Session failed: {}", error);
        let _ = self.outputs.send(CallEvent::Error(error));
        self.leave().await;
    }

    async fn teardown(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.mesh.close_all().await;
            if let Err(e) = active.signaling.leave_room(&active.room).await {
                log::debug!("Could not announce leaving {}: {}", active.room, e);
            }
        }
        self.media.release();
        self.set_state(SessionState::NotJoined);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        log::info!("Session state {} -> {}", self.state, state);
        self.state = state;
        let _ = self.outputs.send(CallEvent::StateChanged(state));
    }
}

impl Drop for CallSessionController {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            log::warn!(
                "Session dropped while in room {}; closing connections",
                active.room
            );
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let mut active = active;
                    active.mesh.close_all().await;
                });
            }
        }
        self.media.release();
    }
}
