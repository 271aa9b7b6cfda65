//! Signaling session manager for small peer-to-peer group calls.
//!
//! The relay only ferries JSON envelopes; every media path is negotiated
//! pairwise between participants. This crate owns the participant table, the
//! bounded pool of endpoint slots, and the offer/answer/ICE state machine
//! that drives each pairing. Media capture and the relay connection itself
//! sit behind the [`engine::MediaEngine`] and [`channel::SignalingChannel`]
//! seams.

pub mod channel;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod manager;
pub mod negotiation;
pub mod peer;
pub mod pool;
pub mod telemetry;

pub use channel::{ChannelError, ClientFrame, RelayEvent, ServerFrame, SignalingChannel};
pub use config::{CandidatePolicy, SessionConfig, SessionConfigBuilder};
pub use engine::{ConnectionState, EngineError, MediaEngine, PeerConnection, StreamHandle};
pub use envelope::{
    Command, CommandKind, Envelope, EnvelopeError, IceCandidate, PeerId, SdpKind,
    SessionDescription,
};
pub use error::SessionError;
pub use manager::{
    CallStatus, DispatchOutcome, PeerSummary, SessionManager, SessionNotification,
};
pub use negotiation::NegotiationState;
pub use pool::{EndpointPool, EndpointSlot, PoolError};

#[cfg(test)]
mod tests;
