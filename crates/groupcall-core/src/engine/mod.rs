//! Seam to the media engine that owns capture, codecs and peer connections.
//!
//! Every operation on a [`PeerConnection`] is fire-and-forget. Results come
//! back through the [`EngineObserver`] handed to the connection at creation,
//! which queues them onto the session manager's serialized event path.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{IceServer, LocalStreamConfig, MediaConstraints};
use crate::envelope::{IceCandidate, PeerId, SessionDescription};
use crate::manager::ManagerEvent;

pub mod mock;

pub trait MediaEngine: Send + Sync {
    /// Build the local capture stream. Called once per manager.
    fn create_local_stream(&self, config: &LocalStreamConfig) -> Result<StreamHandle, EngineError>;

    fn create_connection(
        &self,
        ice_servers: &[IceServer],
        constraints: &MediaConstraints,
        observer: EngineObserver,
    ) -> Result<Box<dyn PeerConnection>, EngineError>;

    fn release_local_stream(&self, stream: StreamHandle);

    /// Release engine-wide resources. No connection is created afterwards.
    fn dispose(&self);
}

/// One media-engine connection handle, owned by a single peer session.
pub trait PeerConnection: Send {
    fn attach_stream(&self, stream: &StreamHandle);
    fn create_offer(&self, constraints: &MediaConstraints);
    fn create_answer(&self, constraints: &MediaConstraints);
    fn set_local_description(&self, description: SessionDescription);
    fn set_remote_description(&self, description: SessionDescription);
    fn add_ice_candidate(&self, candidate: IceCandidate);
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks produced by the engine for one connection.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    LocalDescription(SessionDescription),
    LocalCandidate(IceCandidate),
    RemoteDescriptionSet,
    ConnectionState(ConnectionState),
    RemoteStreamAdded(StreamHandle),
    RemoteStreamRemoved,
    Failure(String),
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::LocalDescription(_) => "local-description",
            EngineEvent::LocalCandidate(_) => "local-candidate",
            EngineEvent::RemoteDescriptionSet => "remote-description-set",
            EngineEvent::ConnectionState(_) => "connection-state",
            EngineEvent::RemoteStreamAdded(_) => "remote-stream-added",
            EngineEvent::RemoteStreamRemoved => "remote-stream-removed",
            EngineEvent::Failure(_) => "failure",
        }
    }
}

/// Opaque media stream. The engine that created it can downcast the payload.
#[derive(Clone)]
pub struct StreamHandle {
    label: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl StreamHandle {
    pub fn new<T: Any + Send + Sync>(label: impl Into<String>, inner: Arc<T>) -> Self {
        Self {
            label: label.into(),
            inner,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }

    pub fn same_stream(&self, other: &StreamHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Routes engine callbacks for one peer session back to the manager.
///
/// Callbacks are tagged with the session generation so the manager can drop
/// anything that outlives the session it was issued for.
#[derive(Clone)]
pub struct EngineObserver {
    peer: PeerId,
    generation: u64,
    sink: mpsc::UnboundedSender<ManagerEvent>,
}

impl EngineObserver {
    pub(crate) fn new(
        peer: PeerId,
        generation: u64,
        sink: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Self {
        Self {
            peer,
            generation,
            sink,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn local_description_created(&self, description: SessionDescription) {
        self.emit(EngineEvent::LocalDescription(description));
    }

    pub fn ice_candidate(&self, candidate: IceCandidate) {
        self.emit(EngineEvent::LocalCandidate(candidate));
    }

    pub fn remote_description_set(&self) {
        self.emit(EngineEvent::RemoteDescriptionSet);
    }

    pub fn connection_state_changed(&self, state: ConnectionState) {
        self.emit(EngineEvent::ConnectionState(state));
    }

    pub fn remote_stream_added(&self, stream: StreamHandle) {
        self.emit(EngineEvent::RemoteStreamAdded(stream));
    }

    pub fn remote_stream_removed(&self) {
        self.emit(EngineEvent::RemoteStreamRemoved);
    }

    pub fn negotiation_failed(&self, reason: impl Into<String>) {
        self.emit(EngineEvent::Failure(reason.into()));
    }

    pub fn emit(&self, event: EngineEvent) {
        let name = event.name();
        let message = ManagerEvent::Engine {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        };
        if self.sink.send(message).is_err() {
            tracing::trace!(
                peer = %self.peer,
                event = name,
                "manager gone; engine callback dropped"
            );
        }
    }
}

impl fmt::Debug for EngineObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineObserver")
            .field("peer", &self.peer)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("media engine setup failed: {0}")]
    Setup(String),
    #[error("local stream unavailable: {0}")]
    Stream(String),
    #[error("media engine has been disposed")]
    Disposed,
}
