//! One transport per remote participant, and the negotiation that drives it.
//!
//! All mutation happens on the session loop. Transport work (creating
//! offers and answers, applying descriptions and candidates) runs in spawned
//! continuations whose results come back as [`MeshEvent::Completed`], tagged
//! with the generation of the connection that started them. A result whose
//! generation no longer matches the live connection for that participant is
//! dropped: the connection it belonged to was closed in the meantime.

use crate::config::{CallConfig, IceServer};
use crate::connection::{ConnectionMonitor, ConnectionStatus};
use crate::controller::CallEvent;
use crate::error::{CallError, TransportError};
use crate::media::LocalStream;
use crate::negotiation::{Negotiation, NegotiationState, OfferDecision};
use crate::signaling::{RelaySender, SignalPayload};
use crate::transport::{
    IceCandidate, IceState, PeerTransport, RemoteStream, SessionDescription, TransportEvent,
    TransportEventKind, TransportEvents, TransportFactory,
};
use crate::types::{ParticipantId, Role};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug)]
pub enum MeshEvent {
    Transport(TransportEvent),
    Completed(Outcome),
    NegotiationTimeout {
        participant: ParticipantId,
        generation: u64,
    },
}

#[derive(Debug)]
pub struct Outcome {
    pub participant: ParticipantId,
    pub generation: u64,
    pub kind: OutcomeKind,
}

#[derive(Debug)]
pub enum OutcomeKind {
    OfferCreated(Result<SessionDescription, TransportError>),
    AnswerCreated(Result<SessionDescription, TransportError>),
    AnswerApplied(Result<(), TransportError>),
    CandidateApplied(Result<(), TransportError>),
}

impl OutcomeKind {
    fn name(&self) -> &'static str {
        match self {
            OutcomeKind::OfferCreated(_) => "offer",
            OutcomeKind::AnswerCreated(_) => "answer",
            OutcomeKind::AnswerApplied(_) => "remote answer",
            OutcomeKind::CandidateApplied(_) => "candidate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    Existing,
    Created,
}

/// Read-only view of one mesh entry.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub role: Role,
    pub negotiation: NegotiationState,
    pub generation: u64,
    pub has_remote_stream: bool,
}

struct PeerEntry {
    transport: Arc<dyn PeerTransport>,
    generation: u64,
    negotiation: Negotiation,
    remote_stream: Option<RemoteStream>,
    monitor: ConnectionMonitor,
}

pub struct PeerConnectionMesh {
    local_id: ParticipantId,
    local_stream: Arc<LocalStream>,
    factory: Arc<dyn TransportFactory>,
    relay: RelaySender,
    ice_servers: Vec<IceServer>,
    negotiation_timeout: Duration,
    max_attempts: u8,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
    outputs: mpsc::UnboundedSender<CallEvent>,
    peers: HashMap<ParticipantId, PeerEntry>,
    failures: HashMap<ParticipantId, u8>,
    next_generation: u64,
}

impl PeerConnectionMesh {
    pub fn new(
        local_id: ParticipantId,
        local_stream: Arc<LocalStream>,
        factory: Arc<dyn TransportFactory>,
        relay: RelaySender,
        config: &CallConfig,
        outputs: mpsc::UnboundedSender<CallEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mesh = Self {
            local_id,
            local_stream,
            factory,
            relay,
            ice_servers: config.ice_servers.clone(),
            negotiation_timeout: config.negotiation_timeout,
            max_attempts: config.max_negotiation_attempts.max(1),
            events_tx,
            outputs,
            peers: HashMap::new(),
            failures: HashMap::new(),
            next_generation: 0,
        };
        (mesh, events_rx)
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.peers.contains_key(id)
    }

    /// Connected participant ids in sorted order.
    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn summary(&self, id: &ParticipantId) -> Option<PeerSummary> {
        self.peers.get(id).map(|entry| PeerSummary {
            role: entry.negotiation.role(),
            negotiation: entry.negotiation.state(),
            generation: entry.generation,
            has_remote_stream: entry.remote_stream.is_some(),
        })
    }

    pub fn status(&self, id: &ParticipantId) -> Option<ConnectionStatus> {
        self.peers.get(id).map(|entry| entry.monitor.current())
    }

    pub fn subscribe(&self, id: &ParticipantId) -> Option<watch::Receiver<ConnectionStatus>> {
        self.peers.get(id).map(|entry| entry.monitor.subscribe())
    }

    /// Returns the live connection for `id` or creates one carrying every
    /// local track. An initiator starts its offer right away.
    pub async fn ensure_connection(
        &mut self,
        id: &ParticipantId,
        role: Role,
    ) -> Result<Ensured, TransportError> {
        if self.peers.contains_key(id) {
            return Ok(Ensured::Existing);
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let events = TransportEvents::new(id.clone(), generation, self.events_tx.clone());
        let transport = self.factory.create(id, &self.ice_servers, events).await?;
        for track in self.local_stream.tracks() {
            if let Err(e) = transport.add_track(track).await {
                transport.close().await;
                return Err(e);
            }
        }

        let mut entry = PeerEntry {
            transport,
            generation,
            negotiation: Negotiation::new(role),
            remote_stream: None,
            monitor: ConnectionMonitor::new(),
        };
        log::info!(
            "Creating peer connection for {} as {} (generation {})",
            id,
            role,
            generation
        );

        if role == Role::Initiator && entry.negotiation.start_offer().is_ok() {
            entry.monitor.update_negotiation(entry.negotiation.state());
            let transport = entry.transport.clone();
            spawn_continuation(&self.events_tx, id.clone(), generation, async move {
                OutcomeKind::OfferCreated(transport.create_offer().await)
            });
        }
        self.arm_timeout(id, generation);
        self.peers.insert(id.clone(), entry);
        Ok(Ensured::Created)
    }

    /// Closes and forgets the connection for `id`. Unknown ids are a no-op.
    pub async fn close_connection(&mut self, id: &ParticipantId) -> bool {
        self.failures.remove(id);
        self.teardown(id).await
    }

    pub async fn close_all(&mut self) {
        let ids: Vec<_> = self.peers.keys().cloned().collect();
        for id in ids {
            self.teardown(&id).await;
        }
        self.failures.clear();
    }

    /// The receiver of a snapshot is the newcomer: it initiates to everyone
    /// already present.
    pub async fn on_roster_snapshot(&mut self, ids: &[ParticipantId]) {
        for id in ids {
            if *id == self.local_id || self.peers.contains_key(id) {
                continue;
            }
            self.connect_peer(id, Role::Initiator).await;
        }
    }

    /// Existing members wait for the newcomer's offer.
    pub async fn on_participant_joined(&mut self, id: &ParticipantId) {
        if *id == self.local_id {
            return;
        }
        self.connect_peer(id, Role::Responder).await;
    }

    pub async fn on_participant_left(&mut self, id: &ParticipantId) {
        if !self.close_connection(id).await {
            log::debug!("{} left without a connection", id);
        }
    }

    pub async fn on_signal(&mut self, from: &ParticipantId, payload: SignalPayload) {
        if *from == self.local_id {
            log::warn!("Ignoring {} addressed from ourselves", payload.kind());
            return;
        }
        log::debug!("Signal received from {}: {}", from, payload.kind());
        match payload {
            SignalPayload::Offer(desc) => self.on_offer(from, desc).await,
            SignalPayload::Answer(desc) => self.on_answer(from, desc),
            SignalPayload::Candidate(candidate) => self.on_remote_candidate(from, candidate),
        }
    }

    pub async fn handle_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::Transport(event) => self.on_transport_event(event).await,
            MeshEvent::Completed(outcome) => self.on_outcome(outcome).await,
            MeshEvent::NegotiationTimeout {
                participant,
                generation,
            } => self.on_timeout(&participant, generation).await,
        }
    }

    async fn connect_peer(&mut self, id: &ParticipantId, role: Role) {
        let mut role = role;
        loop {
            match self.ensure_connection(id, role).await {
                Ok(Ensured::Existing) => {
                    log::debug!("Connection to {} already exists", id);
                    return;
                }
                Ok(Ensured::Created) => return,
                Err(e) => {
                    log::warn!("Failed to create connection to {}: {}", id, e);
                    if !self.note_failure(id) {
                        return;
                    }
                    role = Role::Initiator;
                }
            }
        }
    }

    async fn on_offer(&mut self, from: &ParticipantId, offer: SessionDescription) {
        if !self.peers.contains_key(from) {
            self.connect_peer(from, Role::Responder).await;
        }

        let (decision, state) = match self.peers.get(from) {
            Some(entry) => (
                entry.negotiation.classify_offer(&self.local_id, from),
                entry.negotiation.state(),
            ),
            None => {
                log::warn!("Dropping offer from {}: no connection", from);
                return;
            }
        };

        match decision {
            OfferDecision::Accept => {}
            OfferDecision::KeepLocalOffer => {
                log::warn!(
                    "{}",
                    CallError::ProtocolViolation {
                        participant: from.clone(),
                        detail: "offer crossed ours; keeping the local offer".to_owned(),
                    }
                );
                return;
            }
            OfferDecision::Reset => {
                log::warn!(
                    "{}",
                    CallError::ProtocolViolation {
                        participant: from.clone(),
                        detail: format!("offer received while {}; recreating connection", state),
                    }
                );
                let carried = self
                    .peers
                    .get_mut(from)
                    .map(|entry| entry.negotiation.take_pending_candidates())
                    .unwrap_or_default();
                self.teardown(from).await;
                self.connect_peer(from, Role::Responder).await;
                if let Some(entry) = self.peers.get_mut(from) {
                    for candidate in carried {
                        entry.negotiation.offer_candidate(candidate);
                    }
                }
            }
        }

        let Some(entry) = self.peers.get_mut(from) else {
            return;
        };
        if let Err(e) = entry.negotiation.accept_offer() {
            log::warn!("Dropping offer from {}: {}", from, e);
            return;
        }
        entry.monitor.update_negotiation(entry.negotiation.state());

        let transport = entry.transport.clone();
        spawn_continuation(&self.events_tx, from.clone(), entry.generation, async move {
            let answer = match transport.set_remote_description(offer).await {
                Ok(()) => transport.create_answer().await,
                Err(e) => Err(e),
            };
            OutcomeKind::AnswerCreated(answer)
        });
    }

    fn on_answer(&mut self, from: &ParticipantId, answer: SessionDescription) {
        let Some(entry) = self.peers.get_mut(from) else {
            log::warn!("Ignoring answer from {}: no connection", from);
            return;
        };
        if !entry.negotiation.accept_answer() {
            log::warn!(
                "Skipping answer from {}: negotiation is {}, expected offer-sent",
                from,
                entry.negotiation.state()
            );
            return;
        }
        entry.monitor.update_negotiation(entry.negotiation.state());

        let transport = entry.transport.clone();
        spawn_continuation(&self.events_tx, from.clone(), entry.generation, async move {
            OutcomeKind::AnswerApplied(transport.set_remote_description(answer).await)
        });
    }

    fn on_remote_candidate(&mut self, from: &ParticipantId, candidate: IceCandidate) {
        let Some(entry) = self.peers.get_mut(from) else {
            log::debug!("Ignoring ICE candidate from {}: no connection", from);
            return;
        };
        match entry.negotiation.offer_candidate(candidate) {
            Some(candidate) => apply_candidates(
                &self.events_tx,
                from,
                entry.generation,
                &entry.transport,
                vec![candidate],
            ),
            None => log::debug!("Queued ICE candidate from {} until the remote description is set", from),
        }
    }

    async fn on_outcome(&mut self, outcome: Outcome) {
        let Outcome {
            participant: id,
            generation,
            kind,
        } = outcome;
        if !self.is_current(&id, generation) {
            log::debug!(
                "Dropping stale {} result for {} (generation {})",
                kind.name(),
                id,
                generation
            );
            return;
        }

        match kind {
            OutcomeKind::OfferCreated(Ok(offer)) => {
                let Some(entry) = self.peers.get_mut(&id) else {
                    return;
                };
                if !entry.negotiation.offer_produced() {
                    log::debug!("Offer for {} no longer needed", id);
                    return;
                }
                log::info!("Sending offer to {}", id);
                self.send(&id, SignalPayload::Offer(offer)).await;
                self.flush_local_candidates(&id).await;
            }
            OutcomeKind::AnswerCreated(Ok(answer)) => {
                let Some(entry) = self.peers.get_mut(&id) else {
                    return;
                };
                match entry.negotiation.answer_produced() {
                    Ok(pending) => {
                        entry.monitor.update_negotiation(entry.negotiation.state());
                        apply_candidates(&self.events_tx, &id, generation, &entry.transport, pending);
                    }
                    Err(e) => {
                        log::debug!("Answer for {} no longer needed: {}", id, e);
                        return;
                    }
                }
                log::info!("Sending answer to {}", id);
                self.send(&id, SignalPayload::Answer(answer)).await;
                self.flush_local_candidates(&id).await;
            }
            OutcomeKind::AnswerApplied(Ok(())) => {
                if let Some(entry) = self.peers.get_mut(&id) {
                    let pending = entry.negotiation.remote_description_applied();
                    apply_candidates(&self.events_tx, &id, generation, &entry.transport, pending);
                    log::info!("Negotiation with {} complete", id);
                }
            }
            OutcomeKind::CandidateApplied(Ok(())) => {}
            OutcomeKind::CandidateApplied(Err(e)) => {
                log::warn!("Error adding ICE candidate from {}: {}", id, e);
            }
            OutcomeKind::OfferCreated(Err(e))
            | OutcomeKind::AnswerCreated(Err(e))
            | OutcomeKind::AnswerApplied(Err(e)) => {
                self.fail_connection(&id, &e.to_string()).await;
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let TransportEvent {
            participant: id,
            generation,
            kind,
        } = event;
        if !self.is_current(&id, generation) {
            log::debug!("Dropping transport event for closed connection to {}", id);
            return;
        }

        match kind {
            TransportEventKind::LocalCandidate(candidate) => {
                let Some(entry) = self.peers.get_mut(&id) else {
                    return;
                };
                match entry.negotiation.hold_local_candidate(candidate) {
                    Some(candidate) => {
                        log::debug!("Sending ICE candidate to {}", id);
                        self.send(&id, SignalPayload::Candidate(candidate)).await;
                    }
                    None => log::debug!("Holding ICE candidate for {} until our description is sent", id),
                }
            }
            TransportEventKind::RemoteStream(stream) => {
                let Some(entry) = self.peers.get_mut(&id) else {
                    return;
                };
                log::info!("Received remote stream {} from {}", stream.stream_id(), id);
                entry.remote_stream = Some(stream.clone());
                let _ = self.outputs.send(CallEvent::RemoteStream {
                    participant: id,
                    stream,
                });
            }
            TransportEventKind::IceStateChanged(state) => {
                log::info!("ICE connection state for {}: {}", id, state);
                let changed = match self.peers.get(&id) {
                    Some(entry) => entry.monitor.update_ice_state(state),
                    None => return,
                };
                if let Some(connection) = changed {
                    let _ = self.outputs.send(CallEvent::PeerConnectionState {
                        participant: id.clone(),
                        state: connection,
                    });
                }
                match state {
                    IceState::Connected | IceState::Completed => {
                        self.failures.remove(&id);
                    }
                    IceState::Failed => self.fail_connection(&id, "ICE connection failed").await,
                    _ => {}
                }
            }
        }
    }

    async fn on_timeout(&mut self, id: &ParticipantId, generation: u64) {
        if !self.is_current(id, generation) {
            return;
        }
        let connected = self
            .peers
            .get(id)
            .map_or(true, |entry| entry.negotiation.is_connected());
        if !connected {
            self.fail_connection(id, "negotiation timed out").await;
        }
    }

    /// Closes a failing connection and retries once as initiator. Past the
    /// attempt budget the participant is dropped and reported unreachable.
    async fn fail_connection(&mut self, id: &ParticipantId, reason: &str) {
        log::warn!("Connection to {} failed: {}", id, reason);
        if let Some(entry) = self.peers.get(id) {
            entry.monitor.set_error(reason.to_owned());
        }
        self.teardown(id).await;
        if self.note_failure(id) {
            log::info!("Retrying {} with the peer as responder", id);
            self.connect_peer(id, Role::Initiator).await;
        }
    }

    /// Counts a failure. Returns false, and reports the peer unreachable,
    /// once the attempt budget is spent.
    fn note_failure(&mut self, id: &ParticipantId) -> bool {
        let count = {
            let count = self.failures.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if count < self.max_attempts {
            return true;
        }
        self.failures.remove(id);
        log::error!("Giving up on {} after {} attempt(s)", id, count);
        let _ = self
            .outputs
            .send(CallEvent::Error(CallError::PeerUnreachable(id.clone())));
        false
    }

    async fn teardown(&mut self, id: &ParticipantId) -> bool {
        let Some(entry) = self.peers.remove(id) else {
            return false;
        };
        entry.monitor.close();
        entry.transport.close().await;
        if entry.remote_stream.is_some() {
            let _ = self.outputs.send(CallEvent::RemoteStreamRemoved(id.clone()));
        }
        log::info!(
            "Closed connection to {} (generation {})",
            id,
            entry.generation
        );
        true
    }

    /// Sends the local candidates gathered before our offer or answer went out.
    async fn flush_local_candidates(&mut self, id: &ParticipantId) {
        let held = match self.peers.get_mut(id) {
            Some(entry) => entry.negotiation.local_description_sent(),
            None => return,
        };
        for candidate in held {
            log::debug!("Sending held ICE candidate to {}", id);
            self.send(id, SignalPayload::Candidate(candidate)).await;
        }
    }

    fn is_current(&self, id: &ParticipantId, generation: u64) -> bool {
        self.peers
            .get(id)
            .map_or(false, |entry| entry.generation == generation)
    }

    fn arm_timeout(&self, id: &ParticipantId, generation: u64) {
        let tx = self.events_tx.clone();
        let participant = id.clone();
        let timeout = self.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(MeshEvent::NegotiationTimeout {
                participant,
                generation,
            });
        });
    }

    async fn send(&self, to: &ParticipantId, payload: SignalPayload) {
        if let Err(e) = self.relay.send_signal(to, payload).await {
            log::warn!("Could not signal {}: {}", to, e);
        }
    }
}

fn spawn_continuation<F>(
    tx: &mpsc::UnboundedSender<MeshEvent>,
    participant: ParticipantId,
    generation: u64,
    work: F,
) where
    F: Future<Output = OutcomeKind> + Send + 'static,
{
    let tx = tx.clone();
    tokio::spawn(async move {
        let kind = work.await;
        let _ = tx.send(MeshEvent::Completed(Outcome {
            participant,
            generation,
            kind,
        }));
    });
}

fn apply_candidates(
    tx: &mpsc::UnboundedSender<MeshEvent>,
    participant: &ParticipantId,
    generation: u64,
    transport: &Arc<dyn PeerTransport>,
    candidates: Vec<IceCandidate>,
) {
    for candidate in candidates {
        let transport = transport.clone();
        spawn_continuation(tx, participant.clone(), generation, async move {
            OutcomeKind::CandidateApplied(transport.add_ice_candidate(candidate).await)
        });
    }
}
