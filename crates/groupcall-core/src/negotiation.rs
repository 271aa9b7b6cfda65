//! Offer/answer/ICE state machine for a single remote participant.
//!
//! The machine performs no I/O. Each input yields the list of actions the
//! session manager has to carry out, in order. The peer that receives `init`
//! creates the offer and the peer that receives `offer` answers, so two
//! participants never offer to each other at the same time.

use std::collections::VecDeque;
use std::fmt;

use thiserror::Error;

use crate::config::{CandidatePolicy, DEFAULT_MAX_BUFFERED_CANDIDATES};
use crate::engine::{ConnectionState, EngineEvent, StreamHandle};
use crate::envelope::{Command, IceCandidate, SdpKind, SessionDescription};
use crate::manager::CallStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
    Closed,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed)
    }

    /// States in which candidates are exchanged.
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            NegotiationState::OfferSent
                | NegotiationState::OfferReceived
                | NegotiationState::AnswerExchanged
                | NegotiationState::Connected
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::New => "new",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::OfferReceived => "offer-received",
            NegotiationState::AnswerExchanged => "answer-exchanged",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
            NegotiationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Work the session manager performs on behalf of one peer.
#[derive(Debug, Clone)]
pub enum PeerAction {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    /// Send a command to this peer through the relay.
    Send(Command),
    RemoteStream(StreamHandle),
    Status(CallStatus),
    /// Remove the session. Always the last action of a batch.
    Teardown(CallStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{event} is not accepted in state {state}")]
pub struct UnexpectedEvent {
    pub state: NegotiationState,
    pub event: &'static str,
}

#[derive(Debug)]
pub struct Negotiation {
    state: NegotiationState,
    remote_description_applied: bool,
    policy: CandidatePolicy,
    buffer_limit: usize,
    pending: VecDeque<IceCandidate>,
}

impl Negotiation {
    pub fn new(policy: CandidatePolicy) -> Self {
        Self {
            state: NegotiationState::New,
            remote_description_applied: false,
            policy,
            buffer_limit: DEFAULT_MAX_BUFFERED_CANDIDATES,
            pending: VecDeque::new(),
        }
    }

    /// Cap on candidates held under [`CandidatePolicy::Buffer`].
    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = limit;
        self
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_description_applied
    }

    pub fn buffered_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn on_command(&mut self, command: Command) -> Result<Vec<PeerAction>, UnexpectedEvent> {
        use NegotiationState::*;

        let name = command.kind().as_str();
        match (self.state, command) {
            (New, Command::Init) => {
                self.state = OfferSent;
                Ok(vec![PeerAction::CreateOffer])
            }
            (New, Command::Offer(description)) => {
                self.state = OfferReceived;
                Ok(vec![
                    PeerAction::SetRemoteDescription(description),
                    PeerAction::CreateAnswer,
                ])
            }
            (OfferSent, Command::Answer(description)) => {
                self.state = AnswerExchanged;
                Ok(vec![PeerAction::SetRemoteDescription(description)])
            }
            (state, Command::Candidate(candidate)) if state.is_negotiating() => {
                Ok(self.remote_candidate(candidate))
            }
            (state, _) => Err(self.unexpected(state, name)),
        }
    }

    pub fn on_engine(&mut self, event: EngineEvent) -> Result<Vec<PeerAction>, UnexpectedEvent> {
        use NegotiationState::*;

        let name = event.name();
        let state = self.state;
        if state.is_terminal() {
            return Err(self.unexpected(state, name));
        }
        match event {
            EngineEvent::LocalDescription(description) => {
                let command = match (state, description.kind) {
                    (OfferSent, SdpKind::Offer) => Command::Offer(description.clone()),
                    (OfferReceived, SdpKind::Answer) => {
                        self.state = AnswerExchanged;
                        Command::Answer(description.clone())
                    }
                    _ => return Err(self.unexpected(state, name)),
                };
                Ok(vec![
                    PeerAction::Send(command),
                    PeerAction::SetLocalDescription(description),
                ])
            }
            EngineEvent::LocalCandidate(candidate) if state.is_negotiating() => {
                Ok(vec![PeerAction::Send(Command::Candidate(candidate))])
            }
            EngineEvent::RemoteDescriptionSet
                if matches!(state, OfferReceived | AnswerExchanged | Connected) =>
            {
                self.remote_description_applied = true;
                Ok(self
                    .pending
                    .drain(..)
                    .map(PeerAction::AddIceCandidate)
                    .collect())
            }
            EngineEvent::ConnectionState(connection) => self.connection_state(connection, name),
            EngineEvent::RemoteStreamAdded(stream) if state != New => {
                Ok(vec![PeerAction::RemoteStream(stream)])
            }
            EngineEvent::RemoteStreamRemoved => {
                self.state = Closed;
                Ok(vec![PeerAction::Teardown(CallStatus::Disconnected)])
            }
            EngineEvent::Failure(reason) => Ok(self.fail(reason)),
            _ => Err(self.unexpected(state, name)),
        }
    }

    fn connection_state(
        &mut self,
        connection: ConnectionState,
        name: &'static str,
    ) -> Result<Vec<PeerAction>, UnexpectedEvent> {
        use NegotiationState::*;

        match (self.state, connection) {
            (_, ConnectionState::New | ConnectionState::Checking) => Ok(Vec::new()),
            (AnswerExchanged, ConnectionState::Connected | ConnectionState::Completed) => {
                self.state = Connected;
                Ok(vec![PeerAction::Status(CallStatus::Connected)])
            }
            (Connected, ConnectionState::Connected | ConnectionState::Completed) => Ok(Vec::new()),
            (
                AnswerExchanged | Connected,
                ConnectionState::Disconnected | ConnectionState::Closed,
            ) => {
                self.state = Closed;
                Ok(vec![PeerAction::Teardown(CallStatus::Disconnected)])
            }
            (_, ConnectionState::Failed) => Ok(self.fail("ice connection failed".to_string())),
            (state, _) => Err(self.unexpected(state, name)),
        }
    }

    fn remote_candidate(&mut self, candidate: IceCandidate) -> Vec<PeerAction> {
        if self.remote_description_applied {
            return vec![PeerAction::AddIceCandidate(candidate)];
        }
        match self.policy {
            CandidatePolicy::Drop => {
                tracing::debug!(
                    state = %self.state,
                    mid = %candidate.id,
                    "remote description not set yet; dropping candidate"
                );
            }
            CandidatePolicy::Buffer if self.pending.len() >= self.buffer_limit => {
                tracing::warn!(
                    state = %self.state,
                    limit = self.buffer_limit,
                    mid = %candidate.id,
                    "candidate buffer full; dropping candidate"
                );
            }
            CandidatePolicy::Buffer => {
                tracing::debug!(
                    state = %self.state,
                    buffered = self.pending.len() + 1,
                    "remote description not set yet; buffering candidate"
                );
                self.pending.push_back(candidate);
            }
        }
        Vec::new()
    }

    fn fail(&mut self, reason: String) -> Vec<PeerAction> {
        self.state = NegotiationState::Failed;
        self.pending.clear();
        vec![PeerAction::Teardown(CallStatus::Failed { reason })]
    }

    fn unexpected(&self, state: NegotiationState, event: &'static str) -> UnexpectedEvent {
        UnexpectedEvent { state, event }
    }
}
