//! Wire model for the JSON envelopes exchanged through the relay.
//!
//! ```text
//! { "from": "<peer>"?, "to": "<peer>", "type": "init|offer|answer|candidate", "payload": {..}? }
//! ```
//!
//! `payload` is absent exactly when `type` is `init`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Relay-assigned identifier of a participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Init,
    Offer,
    Answer,
    Candidate,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Init => "init",
            CommandKind::Offer => "offer",
            CommandKind::Answer => "answer",
            CommandKind::Candidate => "candidate",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP offer or answer as carried in `offer`/`answer` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate. `id` is the media-line mid, `label` its index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub id: String,
    pub label: u16,
    pub candidate: String,
}

/// A decoded command, with its payload already typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Init => CommandKind::Init,
            Command::Offer(_) => CommandKind::Offer,
            Command::Answer(_) => CommandKind::Answer,
            Command::Candidate(_) => CommandKind::Candidate,
        }
    }

    fn from_parts(kind: CommandKind, payload: Option<&Value>) -> Result<Self, EnvelopeError> {
        match (kind, payload) {
            (CommandKind::Init, None) => Ok(Command::Init),
            (CommandKind::Init, Some(_)) => Err(EnvelopeError::UnexpectedPayload),
            (kind, None) => Err(EnvelopeError::MissingPayload(kind)),
            (CommandKind::Offer, Some(value)) => {
                let description = description_payload(kind, value, SdpKind::Offer)?;
                Ok(Command::Offer(description))
            }
            (CommandKind::Answer, Some(value)) => {
                let description = description_payload(kind, value, SdpKind::Answer)?;
                Ok(Command::Answer(description))
            }
            (CommandKind::Candidate, Some(value)) => {
                let candidate = IceCandidate::deserialize(value)
                    .map_err(|source| EnvelopeError::InvalidPayload { kind, source })?;
                Ok(Command::Candidate(candidate))
            }
        }
    }

    fn payload(&self) -> Result<Option<Value>, serde_json::Error> {
        match self {
            Command::Init => Ok(None),
            Command::Offer(description) | Command::Answer(description) => {
                serde_json::to_value(description).map(Some)
            }
            Command::Candidate(candidate) => serde_json::to_value(candidate).map(Some),
        }
    }
}

fn description_payload(
    kind: CommandKind,
    value: &Value,
    expected: SdpKind,
) -> Result<SessionDescription, EnvelopeError> {
    let description = SessionDescription::deserialize(value)
        .map_err(|source| EnvelopeError::InvalidPayload { kind, source })?;
    if description.kind != expected {
        return Err(EnvelopeError::DescriptionMismatch {
            kind,
            found: description.kind,
        });
    }
    Ok(description)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    pub to: PeerId,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// Build an outbound envelope. The relay fills in `from`.
    pub fn outbound(to: PeerId, command: &Command) -> Result<Self, EnvelopeError> {
        Ok(Self {
            from: None,
            to,
            kind: command.kind(),
            payload: command.payload()?,
        })
    }

    pub fn decode(value: Value) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value, EnvelopeError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn sender(&self) -> Result<&PeerId, EnvelopeError> {
        self.from.as_ref().ok_or(EnvelopeError::MissingSender)
    }

    pub fn command(&self) -> Result<Command, EnvelopeError> {
        Command::from_parts(self.kind, self.payload.as_ref())
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope json is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("inbound envelope has no sender")]
    MissingSender,
    #[error("{0} envelope requires a payload")]
    MissingPayload(CommandKind),
    #[error("init envelope must not carry a payload")]
    UnexpectedPayload,
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: CommandKind,
        source: serde_json::Error,
    },
    #[error("{kind} envelope carries a {found:?} description")]
    DescriptionMismatch { kind: CommandKind, found: SdpKind },
}
