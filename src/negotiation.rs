//! Offer/answer ordering for a single peer connection.
//!
//! This is pure bookkeeping: it never touches the transport. The mesh asks
//! it what to do with each incoming payload and performs the I/O itself.

use crate::transport::IceCandidate;
use crate::types::{ParticipantId, Role};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    /// `have-local-offer`
    OfferSent,
    /// `have-remote-offer`
    OfferReceived,
    /// `stable` after a completed exchange
    Connected,
}

impl NegotiationState {
    /// The equivalent transport signaling state name.
    pub fn signaling_state(&self) -> &'static str {
        match self {
            NegotiationState::Idle | NegotiationState::Connected => "stable",
            NegotiationState::OfferSent => "have-local-offer",
            NegotiationState::OfferReceived => "have-remote-offer",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::OfferReceived => "offer-received",
            NegotiationState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// What to do with an offer that just arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    /// Apply it and answer.
    Accept,
    /// Glare where we hold the initiative: drop the remote offer, our own
    /// offer stands and the remote side will answer it.
    KeepLocalOffer,
    /// Tear the connection down and answer the offer on a fresh one.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: NegotiationState,
    pub action: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} while {}", self.action, self.from)
    }
}

#[derive(Debug)]
pub struct Negotiation {
    role: Role,
    state: NegotiationState,
    local_offer_sent: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    local_description_sent: bool,
    outgoing_candidates: Vec<IceCandidate>,
}

impl Negotiation {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
            local_offer_sent: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            local_description_sent: false,
            outgoing_candidates: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == NegotiationState::Connected
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Commit to offering. The offer itself is produced asynchronously.
    pub fn start_offer(&mut self) -> Result<(), InvalidTransition> {
        self.transition(NegotiationState::Idle, NegotiationState::OfferSent, "start an offer")
    }

    /// Local offer has been produced. Returns false if it no longer applies.
    pub fn offer_produced(&mut self) -> bool {
        if self.state != NegotiationState::OfferSent || self.local_offer_sent {
            return false;
        }
        self.local_offer_sent = true;
        true
    }

    pub fn classify_offer(&self, local: &ParticipantId, remote: &ParticipantId) -> OfferDecision {
        match self.state {
            NegotiationState::Idle => OfferDecision::Accept,
            NegotiationState::OfferSent if local < remote => OfferDecision::KeepLocalOffer,
            _ => OfferDecision::Reset,
        }
    }

    pub fn accept_offer(&mut self) -> Result<(), InvalidTransition> {
        self.transition(
            NegotiationState::Idle,
            NegotiationState::OfferReceived,
            "accept an offer",
        )
    }

    /// The remote offer is applied and our answer is ready to send.
    /// Returns the candidates that were waiting for the remote description.
    pub fn answer_produced(&mut self) -> Result<Vec<IceCandidate>, InvalidTransition> {
        self.transition(
            NegotiationState::OfferReceived,
            NegotiationState::Connected,
            "complete an answer",
        )?;
        Ok(self.remote_description_applied())
    }

    /// Returns true when the answer should be applied. Answers in any state
    /// other than a delivered `offer-sent` are duplicates or out of order.
    pub fn accept_answer(&mut self) -> bool {
        if self.state != NegotiationState::OfferSent || !self.local_offer_sent {
            return false;
        }
        self.state = NegotiationState::Connected;
        true
    }

    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.pending_candidates)
    }

    /// Drains remote candidates still waiting for a remote description.
    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }

    /// Hands a locally gathered candidate back if our offer or answer has
    /// already gone out, otherwise holds it until it has.
    pub fn hold_local_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.local_description_sent {
            Some(candidate)
        } else {
            self.outgoing_candidates.push(candidate);
            None
        }
    }

    /// Our offer or answer has been sent. Returns the local candidates
    /// gathered before that, in order.
    pub fn local_description_sent(&mut self) -> Vec<IceCandidate> {
        self.local_description_sent = true;
        std::mem::take(&mut self.outgoing_candidates)
    }

    /// Hands the candidate back if it can be applied right away, otherwise
    /// queues it until the remote description is in place.
    pub fn offer_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.pending_candidates.push(candidate);
            None
        }
    }

    fn transition(
        &mut self,
        from: NegotiationState,
        to: NegotiationState,
        action: &'static str,
    ) -> Result<(), InvalidTransition> {
        if self.state != from {
            return Err(InvalidTransition {
                from: self.state,
                action,
            });
        }
        self.state = to;
        Ok(())
    }
}
