//! Session manager: owns the peer table and the endpoint pool.
//!
//! [`SessionManager`] is a cloneable handle. All state lives in one worker
//! task that processes relay events, engine callbacks and handle requests
//! strictly one at a time from a single queue.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::channel::{RelayEvent, SignalingChannel};
use crate::config::SessionConfig;
use crate::engine::{MediaEngine, StreamHandle};
use crate::envelope::PeerId;
use crate::error::SessionError;
use crate::negotiation::NegotiationState;
use crate::pool::EndpointSlot;

mod event;
mod state;

pub(crate) use self::event::{ManagerEvent, Request};
pub(crate) use self::state::SessionCore;

/// User-visible call status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed { reason: String },
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Connecting => "CONNECTING",
            CallStatus::Connected => "CONNECTED",
            CallStatus::Disconnected => "DISCONNECTED",
            CallStatus::Failed { .. } => "FAILED",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum SessionNotification {
    /// The relay assigned this participant's own id.
    IdentityAssigned(PeerId),
    /// The relay acknowledged `start`; others can now call this id.
    CallReady(PeerId),
    LocalStream(StreamHandle),
    StatusChanged { peer: PeerId, status: CallStatus },
    RemoteStreamAdded {
        peer: PeerId,
        slot: EndpointSlot,
        stream: StreamHandle,
    },
    RemoteStreamRemoved { peer: PeerId, slot: EndpointSlot },
}

/// What `dispatch` did with an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Routed,
    /// Every endpoint slot is taken.
    Rejected,
    Malformed,
    /// Not legal for the peer's negotiation state.
    Unexpected,
    /// The media engine could not create a connection.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub id: PeerId,
    pub slot: EndpointSlot,
    pub state: NegotiationState,
}

#[derive(Clone)]
pub struct SessionManager {
    events: mpsc::UnboundedSender<ManagerEvent>,
    shut_down: Arc<AtomicBool>,
}

impl SessionManager {
    /// Spawn the worker on the current tokio runtime. Takes the channel's
    /// event stream, so one channel serves one manager.
    pub fn spawn(
        config: SessionConfig,
        engine: Arc<dyn MediaEngine>,
        channel: Arc<dyn SignalingChannel>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionNotification>), SessionError> {
        let mut relay = channel.events()?;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let pump = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = relay.recv().await {
                if pump.send(ManagerEvent::Relay(event)).is_err() {
                    return;
                }
            }
            let _ = pump.send(ManagerEvent::Relay(RelayEvent::Closed));
        });

        let mut core = SessionCore::new(config, engine, channel, events_tx.clone(), notify_tx);
        let shut_down = core.shutdown_flag();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                core.handle(event);
                if core.is_shut_down() {
                    break;
                }
            }
            debug!("session manager worker stopped");
        });

        Ok((
            Self {
                events: events_tx,
                shut_down,
            },
            notify_rx,
        ))
    }

    /// Create the local stream and announce readiness to the relay.
    pub async fn start(&self, name: impl Into<String>) -> Result<(), SessionError> {
        let name = name.into();
        self.call(|reply| Request::Start { name, reply }).await?
    }

    pub async fn request_identity(&self) -> Result<(), SessionError> {
        self.call(|reply| Request::RequestIdentity { reply }).await?
    }

    /// Send `init` to `target`, or queue it until `start` has run.
    pub async fn initiate_call(&self, target: impl Into<PeerId>) -> Result<(), SessionError> {
        let target = target.into();
        self.call(|reply| Request::InitiateCall { target, reply }).await?
    }

    /// Feed an inbound envelope by hand. Relay `message` events take this
    /// path automatically.
    pub async fn dispatch(&self, envelope: Value) -> Result<DispatchOutcome, SessionError> {
        self.call(|reply| Request::Dispatch { envelope, reply }).await
    }

    /// Returns whether a session was removed.
    pub async fn teardown(&self, peer: impl Into<PeerId>) -> Result<bool, SessionError> {
        let peer = peer.into();
        self.call(|reply| Request::Teardown { peer, reply }).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>, SessionError> {
        self.call(|reply| Request::Peers { reply }).await
    }

    /// Terminal. Every later call fails with [`SessionError::ShutDown`].
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.call(|reply| Request::Shutdown { reply }).await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        if self
            .events
            .send(ManagerEvent::Request(request(reply)))
            .is_err()
        {
            trace!("request after worker exit");
            return Err(SessionError::ShutDown);
        }
        response.await.map_err(|_| SessionError::ShutDown)
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
