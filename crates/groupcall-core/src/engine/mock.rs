//! In-process media engine that records every call.
//!
//! In automatic mode it answers like a real engine would: created
//! descriptions, remote-description acknowledgements and one local ICE
//! candidate per local description are reported through the observer.
//! Connection-state changes and remote streams are fired by the test.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{EngineError, EngineObserver, MediaEngine, PeerConnection, StreamHandle};
use crate::config::{IceServer, LocalStreamConfig, MediaConstraints};
use crate::envelope::{IceCandidate, PeerId, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateLocalStream(String),
    CreateConnection(PeerId),
    AttachStream(PeerId, String),
    CreateOffer(PeerId),
    CreateAnswer(PeerId),
    SetLocalDescription(PeerId, SessionDescription),
    SetRemoteDescription(PeerId, SessionDescription),
    AddIceCandidate(PeerId, IceCandidate),
    Close(PeerId),
    ReleaseLocalStream(String),
    Dispose,
}

#[derive(Debug)]
pub struct MockStream {
    pub label: String,
}

#[derive(Default)]
struct MockState {
    calls: Vec<EngineCall>,
    observers: HashMap<PeerId, EngineObserver>,
    descriptions: u64,
    refuse_connections: bool,
    disposed: bool,
}

#[derive(Clone)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    automatic: bool,
    candidates: bool,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            automatic: true,
            candidates: true,
        }
    }

    /// Records calls but never calls back on its own.
    pub fn manual() -> Self {
        Self {
            automatic: false,
            ..Self::new()
        }
    }

    pub fn without_candidates(mut self) -> Self {
        self.candidates = false;
        self
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<EngineCall> {
        std::mem::take(&mut self.state.lock().calls)
    }

    pub fn count(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Observer of the most recent connection created for `peer`.
    pub fn observer(&self, peer: &PeerId) -> Option<EngineObserver> {
        self.state.lock().observers.get(peer).cloned()
    }

    fn record(&self, call: EngineCall) {
        self.state.lock().calls.push(call);
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaEngine for MockEngine {
    fn create_local_stream(&self, config: &LocalStreamConfig) -> Result<StreamHandle, EngineError> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(EngineError::Disposed);
        }
        state
            .calls
            .push(EngineCall::CreateLocalStream(config.label.clone()));
        Ok(StreamHandle::new(
            config.label.clone(),
            Arc::new(MockStream {
                label: config.label.clone(),
            }),
        ))
    }

    fn create_connection(
        &self,
        _ice_servers: &[IceServer],
        _constraints: &MediaConstraints,
        observer: EngineObserver,
    ) -> Result<Box<dyn PeerConnection>, EngineError> {
        let peer = observer.peer().clone();
        let mut state = self.state.lock();
        if state.disposed {
            return Err(EngineError::Disposed);
        }
        if state.refuse_connections {
            return Err(EngineError::Setup(format!("connection to {peer} refused")));
        }
        state.calls.push(EngineCall::CreateConnection(peer.clone()));
        state.observers.insert(peer.clone(), observer.clone());
        Ok(Box::new(MockConnection {
            peer,
            engine: self.clone(),
            observer,
        }))
    }

    fn release_local_stream(&self, stream: StreamHandle) {
        self.record(EngineCall::ReleaseLocalStream(stream.label().to_string()));
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        state.observers.clear();
        state.calls.push(EngineCall::Dispose);
    }
}

struct MockConnection {
    peer: PeerId,
    engine: MockEngine,
    observer: EngineObserver,
}

impl MockConnection {
    fn next_sdp(&self, kind: &str) -> String {
        let mut state = self.engine.state.lock();
        state.descriptions += 1;
        format!("v=0\r\ns=mock-{kind}-{}-{}\r\n", self.peer, state.descriptions)
    }
}

impl PeerConnection for MockConnection {
    fn attach_stream(&self, stream: &StreamHandle) {
        self.engine.record(EngineCall::AttachStream(
            self.peer.clone(),
            stream.label().to_string(),
        ));
    }

    fn create_offer(&self, _constraints: &MediaConstraints) {
        self.engine.record(EngineCall::CreateOffer(self.peer.clone()));
        if self.engine.automatic {
            let sdp = self.next_sdp("offer");
            self.observer
                .local_description_created(SessionDescription::offer(sdp));
        }
    }

    fn create_answer(&self, _constraints: &MediaConstraints) {
        self.engine.record(EngineCall::CreateAnswer(self.peer.clone()));
        if self.engine.automatic {
            let sdp = self.next_sdp("answer");
            self.observer
                .local_description_created(SessionDescription::answer(sdp));
        }
    }

    fn set_local_description(&self, description: SessionDescription) {
        self.engine.record(EngineCall::SetLocalDescription(
            self.peer.clone(),
            description,
        ));
        if self.engine.automatic && self.engine.candidates {
            self.observer.ice_candidate(IceCandidate {
                id: "audio".to_string(),
                label: 0,
                candidate: format!(
                    "candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host ({})",
                    self.peer
                ),
            });
        }
    }

    fn set_remote_description(&self, description: SessionDescription) {
        self.engine.record(EngineCall::SetRemoteDescription(
            self.peer.clone(),
            description,
        ));
        if self.engine.automatic {
            self.observer.remote_description_set();
        }
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) {
        self.engine
            .record(EngineCall::AddIceCandidate(self.peer.clone(), candidate));
    }

    fn close(&self) {
        self.engine.record(EngineCall::Close(self.peer.clone()));
    }
}
