//! Seam to the persistent relay connection.
//!
//! Frames on the wire are `{"event": <name>, "data": <value>}` objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::envelope::{Envelope, PeerId};

pub mod mock;

pub trait SignalingChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Queue a frame for the relay. Never blocks.
    fn send(&self, frame: ClientFrame) -> Result<(), ChannelError>;

    /// Inbound relay events. The receiver can be taken once.
    fn events(&self) -> Result<mpsc::UnboundedReceiver<RelayEvent>, ChannelError>;

    fn disconnect(&self);
}

/// Frames a participant sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientFrame {
    RequestIdentity,
    AnnounceReady { name: String },
    Message(Value),
}

impl ClientFrame {
    pub fn message(envelope: &Envelope) -> Result<Self, ChannelError> {
        let value = envelope
            .to_value()
            .map_err(|err| ChannelError::Encode(err.to_string()))?;
        Ok(ClientFrame::Message(value))
    }

    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|err| ChannelError::Encode(err.to_string()))
    }
}

/// Frames the relay sends to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerFrame {
    IdentityAssigned(PeerId),
    ReadyAck(PeerId),
    Message(Value),
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    IdentityAssigned(PeerId),
    ReadyAck(PeerId),
    Message(Value),
    /// The relay connection ended.
    Closed,
}

impl From<ServerFrame> for RelayEvent {
    fn from(frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::IdentityAssigned(id) => RelayEvent::IdentityAssigned(id),
            ServerFrame::ReadyAck(id) => RelayEvent::ReadyAck(id),
            ServerFrame::Message(value) => RelayEvent::Message(value),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("signaling channel closed")]
    Closed,
    #[error("signaling channel setup failed: {0}")]
    Setup(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("relay events already taken")]
    EventsTaken,
}
