use crate::config::{CandidatePolicy, MediaConstraints};
use crate::engine::{EngineEvent, PeerConnection, StreamHandle};
use crate::envelope::{Command, PeerId};
use crate::negotiation::{Negotiation, NegotiationState, PeerAction, UnexpectedEvent};
use crate::pool::EndpointSlot;

/// One remote participant: its slot, its negotiation and its engine
/// connection. Dropped by the manager together with the slot.
pub struct PeerSession {
    id: PeerId,
    slot: EndpointSlot,
    generation: u64,
    negotiation: Negotiation,
    connection: Box<dyn PeerConnection>,
}

impl PeerSession {
    pub fn new(
        id: PeerId,
        slot: EndpointSlot,
        generation: u64,
        policy: CandidatePolicy,
        buffer_limit: usize,
        connection: Box<dyn PeerConnection>,
    ) -> Self {
        Self {
            id,
            slot,
            generation,
            negotiation: Negotiation::new(policy).with_buffer_limit(buffer_limit),
            connection,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn slot(&self) -> EndpointSlot {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiation.state()
    }

    pub fn attach(&self, stream: &StreamHandle) {
        self.connection.attach_stream(stream);
    }

    pub fn handle_command(
        &mut self,
        command: Command,
    ) -> Result<Vec<PeerAction>, UnexpectedEvent> {
        self.negotiation.on_command(command)
    }

    pub fn handle_engine(
        &mut self,
        event: EngineEvent,
    ) -> Result<Vec<PeerAction>, UnexpectedEvent> {
        self.negotiation.on_engine(event)
    }

    /// Run an engine-side action on this session's connection. Actions that
    /// need the manager are handed back.
    pub fn perform(
        &self,
        action: PeerAction,
        constraints: &MediaConstraints,
    ) -> Option<PeerAction> {
        match action {
            PeerAction::CreateOffer => self.connection.create_offer(constraints),
            PeerAction::CreateAnswer => self.connection.create_answer(constraints),
            PeerAction::SetLocalDescription(description) => {
                self.connection.set_local_description(description)
            }
            PeerAction::SetRemoteDescription(description) => {
                self.connection.set_remote_description(description)
            }
            PeerAction::AddIceCandidate(candidate) => self.connection.add_ice_candidate(candidate),
            other => return Some(other),
        }
        None
    }

    pub fn close(self) {
        self.connection.close();
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("state", &self.negotiation.state())
            .finish_non_exhaustive()
    }
}
