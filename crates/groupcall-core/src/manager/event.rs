use serde_json::Value;
use tokio::sync::oneshot;

use super::{DispatchOutcome, PeerSummary};
use crate::channel::RelayEvent;
use crate::engine::EngineEvent;
use crate::envelope::PeerId;
use crate::error::SessionError;

/// Everything the manager worker processes, in arrival order.
#[derive(Debug)]
pub enum ManagerEvent {
    Relay(RelayEvent),
    Engine {
        peer: PeerId,
        generation: u64,
        event: EngineEvent,
    },
    Request(Request),
}

#[derive(Debug)]
pub enum Request {
    Start {
        name: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    RequestIdentity {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    InitiateCall {
        target: PeerId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Dispatch {
        envelope: Value,
        reply: oneshot::Sender<DispatchOutcome>,
    },
    Teardown {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerSummary>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
