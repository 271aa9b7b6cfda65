use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn};

use super::event::{ManagerEvent, Request};
use super::{CallStatus, DispatchOutcome, PeerSummary, SessionNotification};
use crate::channel::{ChannelError, ClientFrame, RelayEvent, SignalingChannel};
use crate::config::SessionConfig;
use crate::engine::{EngineEvent, EngineObserver, MediaEngine, StreamHandle};
use crate::envelope::{Command, Envelope, PeerId};
use crate::error::SessionError;
use crate::negotiation::PeerAction;
use crate::peer::PeerSession;
use crate::pool::EndpointPool;

/// Manager state. Only ever touched from the worker, one event at a time.
pub(crate) struct SessionCore {
    config: SessionConfig,
    engine: Arc<dyn MediaEngine>,
    channel: Arc<dyn SignalingChannel>,
    events: mpsc::UnboundedSender<ManagerEvent>,
    notifications: mpsc::UnboundedSender<SessionNotification>,
    peers: HashMap<PeerId, PeerSession>,
    pool: EndpointPool,
    local_stream: Option<StreamHandle>,
    local_id: Option<PeerId>,
    pending_calls: Vec<PeerId>,
    next_generation: u64,
    started: bool,
    shut_down: Arc<AtomicBool>,
}

impl SessionCore {
    pub(crate) fn new(
        config: SessionConfig,
        engine: Arc<dyn MediaEngine>,
        channel: Arc<dyn SignalingChannel>,
        events: mpsc::UnboundedSender<ManagerEvent>,
        notifications: mpsc::UnboundedSender<SessionNotification>,
    ) -> Self {
        let pool = EndpointPool::new(config.max_peers);
        Self {
            config,
            engine,
            channel,
            events,
            notifications,
            peers: HashMap::new(),
            pool,
            local_stream: None,
            local_id: None,
            pending_calls: Vec::new(),
            next_generation: 0,
            started: false,
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Set before the shutdown request is answered.
    pub(crate) fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shut_down)
    }

    pub(crate) fn handle(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Relay(event) => self.handle_relay(event),
            ManagerEvent::Engine {
                peer,
                generation,
                event,
            } => self.handle_engine(&peer, generation, event),
            ManagerEvent::Request(request) => self.handle_request(request),
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Start { name, reply } => {
                let _ = reply.send(self.start(&name));
            }
            Request::RequestIdentity { reply } => {
                let _ = reply.send(self.request_identity());
            }
            Request::InitiateCall { target, reply } => {
                let _ = reply.send(self.initiate_call(target));
            }
            Request::Dispatch { envelope, reply } => {
                let _ = reply.send(self.dispatch(&envelope));
            }
            Request::Teardown { peer, reply } => {
                let _ = reply.send(self.teardown(&peer));
            }
            Request::Peers { reply } => {
                let _ = reply.send(self.peers());
            }
            Request::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    pub(crate) fn start(&mut self, name: &str) -> Result<(), SessionError> {
        self.ensure_live()?;
        if self.started {
            return Err(SessionError::AlreadyStarted);
        }
        if !self.channel.is_connected() {
            return Err(SessionError::NotConnected);
        }

        let stream = self.engine.create_local_stream(&self.config.local_stream)?;
        let announce = ClientFrame::AnnounceReady {
            name: name.to_string(),
        };
        if let Err(err) = self.channel.send(announce) {
            warn!(error = %err, "readiness announcement failed; start can be retried");
            self.engine.release_local_stream(stream);
            return Err(err.into());
        }

        self.local_stream = Some(stream.clone());
        self.started = true;
        info!(name, stream = stream.label(), "local stream ready");
        self.notify(SessionNotification::LocalStream(stream));

        for target in std::mem::take(&mut self.pending_calls) {
            debug!(peer = %target, "placing queued call");
            self.send_command(&target, Command::Init);
        }
        Ok(())
    }

    pub(crate) fn request_identity(&mut self) -> Result<(), SessionError> {
        self.ensure_live()?;
        if !self.channel.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.channel.send(ClientFrame::RequestIdentity)?;
        Ok(())
    }

    pub(crate) fn initiate_call(&mut self, target: PeerId) -> Result<(), SessionError> {
        self.ensure_live()?;
        if self.local_stream.is_none() {
            if !self.pending_calls.contains(&target) {
                debug!(peer = %target, "no local stream yet; queueing call");
                self.pending_calls.push(target);
            }
            return Ok(());
        }
        if !self.channel.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.channel.send(message_frame(&target, &Command::Init)?)?;
        Ok(())
    }

    /// Single entry point for inbound envelopes. Never fails; the outcome
    /// says what happened to the message.
    pub(crate) fn dispatch(&mut self, value: &Value) -> DispatchOutcome {
        if self.is_shut_down() {
            debug!("manager shut down; ignoring envelope");
            return DispatchOutcome::Rejected;
        }

        let decoded = Envelope::decode(value.clone()).and_then(|envelope| {
            let from = envelope.sender()?.clone();
            Ok((from, envelope.command()?))
        });
        let (from, command) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "dropping malformed envelope");
                return DispatchOutcome::Malformed;
            }
        };

        if !self.peers.contains_key(&from) {
            if !matches!(command, Command::Init | Command::Offer(_)) {
                warn!(
                    peer = %from,
                    kind = %command.kind(),
                    "unknown peer cannot open a session with this command"
                );
                return DispatchOutcome::Unexpected;
            }
            if let Err(outcome) = self.open_session(&from) {
                return outcome;
            }
        }

        let span = info_span!("peer", peer = %from);
        let _enter = span.enter();
        let result = match self.peers.get_mut(&from) {
            Some(session) => session.handle_command(command),
            None => return DispatchOutcome::Failed,
        };
        match result {
            Ok(actions) => {
                self.run_actions(&from, actions);
                DispatchOutcome::Routed
            }
            Err(err) => {
                warn!(error = %err, "dropping unexpected command");
                DispatchOutcome::Unexpected
            }
        }
    }

    fn open_session(&mut self, peer: &PeerId) -> Result<(), DispatchOutcome> {
        let slot = match self.pool.allocate() {
            Ok(slot) => slot,
            Err(err) => {
                debug!(peer = %peer, error = %err, "session full; rejecting call");
                return Err(DispatchOutcome::Rejected);
            }
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        let observer = EngineObserver::new(peer.clone(), generation, self.events.clone());
        let connection = match self.engine.create_connection(
            &self.config.ice_servers,
            &self.config.constraints,
            observer,
        ) {
            Ok(connection) => connection,
            Err(err) => {
                warn!(peer = %peer, error = %err, "could not create connection");
                if let Err(err) = self.pool.release(slot) {
                    warn!(slot = slot.index(), error = %err, "slot release failed");
                }
                return Err(DispatchOutcome::Failed);
            }
        };

        let session = PeerSession::new(
            peer.clone(),
            slot,
            generation,
            self.config.candidate_policy,
            self.config.max_buffered_candidates,
            connection,
        );
        match &self.local_stream {
            Some(stream) => session.attach(stream),
            None => warn!(peer = %peer, "session opened before start; receive-only"),
        }
        info!(peer = %peer, slot = slot.index(), generation, "peer session created");
        self.peers.insert(peer.clone(), session);
        self.notify(SessionNotification::StatusChanged {
            peer: peer.clone(),
            status: CallStatus::Connecting,
        });
        Ok(())
    }

    pub(crate) fn handle_engine(&mut self, peer: &PeerId, generation: u64, event: EngineEvent) {
        let span = info_span!("peer", peer = %peer);
        let _enter = span.enter();
        let result = match self.peers.get_mut(peer) {
            Some(session) if session.generation() == generation => session.handle_engine(event),
            _ => {
                debug!(generation, event = event.name(), "stale engine callback dropped");
                return;
            }
        };
        match result {
            Ok(actions) => self.run_actions(peer, actions),
            Err(err) => warn!(error = %err, "dropping unexpected engine event"),
        }
    }

    fn handle_relay(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::IdentityAssigned(id) => {
                info!(id = %id, "identity assigned");
                self.local_id = Some(id.clone());
                self.notify(SessionNotification::IdentityAssigned(id));
            }
            RelayEvent::ReadyAck(id) => {
                debug!(id = %id, "relay acknowledged readiness");
                self.notify(SessionNotification::CallReady(id));
            }
            RelayEvent::Message(value) => {
                self.dispatch(&value);
            }
            RelayEvent::Closed => {
                if !self.is_shut_down() {
                    warn!("relay connection closed");
                }
            }
        }
    }

    fn run_actions(&mut self, peer: &PeerId, actions: Vec<PeerAction>) {
        for action in actions {
            let Some(session) = self.peers.get(peer) else {
                return;
            };
            let Some(action) = session.perform(action, &self.config.constraints) else {
                continue;
            };
            match action {
                PeerAction::Send(command) => self.send_command(peer, command),
                PeerAction::RemoteStream(stream) => {
                    let slot = session.slot();
                    info!(slot = slot.index(), "remote stream added");
                    self.notify(SessionNotification::RemoteStreamAdded {
                        peer: peer.clone(),
                        slot,
                        stream,
                    });
                }
                PeerAction::Status(status) => {
                    info!(status = %status, "call status changed");
                    self.notify(SessionNotification::StatusChanged {
                        peer: peer.clone(),
                        status,
                    });
                }
                PeerAction::Teardown(status) => {
                    self.remove_session(peer, Some(status));
                    return;
                }
                other => debug!(action = ?other, "engine action not performed"),
            }
        }
    }

    /// Idempotent: a second call for the same peer does nothing.
    pub(crate) fn teardown(&mut self, peer: &PeerId) -> bool {
        self.remove_session(peer, None)
    }

    fn remove_session(&mut self, peer: &PeerId, status: Option<CallStatus>) -> bool {
        let Some(session) = self.peers.remove(peer) else {
            debug!(peer = %peer, "teardown for unknown peer ignored");
            return false;
        };
        let slot = session.slot();
        if let Err(err) = self.pool.release(slot) {
            warn!(peer = %peer, error = %err, "slot release failed");
        }
        session.close();
        info!(peer = %peer, slot = slot.index(), "peer session torn down");

        if let Some(status) = status {
            self.notify(SessionNotification::StatusChanged {
                peer: peer.clone(),
                status,
            });
        }
        self.notify(SessionNotification::RemoteStreamRemoved {
            peer: peer.clone(),
            slot,
        });
        true
    }

    pub(crate) fn peers(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self
            .peers
            .values()
            .map(|session| PeerSummary {
                id: session.id().clone(),
                slot: session.slot(),
                state: session.state(),
            })
            .collect();
        peers.sort_by_key(|peer| peer.slot);
        peers
    }

    pub(crate) fn shutdown(&mut self) {
        if self.is_shut_down() {
            return;
        }
        let ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for id in ids {
            self.remove_session(&id, None);
        }
        if let Some(stream) = self.local_stream.take() {
            self.engine.release_local_stream(stream);
        }
        self.engine.dispose();
        self.channel.disconnect();
        self.pending_calls.clear();
        self.shut_down.store(true, Ordering::SeqCst);
        info!(local = ?self.local_id, "session manager shut down");
    }

    fn send_command(&self, to: &PeerId, command: Command) {
        let result = message_frame(to, &command).and_then(|frame| self.channel.send(frame));
        if let Err(err) = result {
            warn!(peer = %to, kind = %command.kind(), error = %err, "failed to send envelope");
        }
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.is_shut_down() {
            Err(SessionError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn notify(&self, notification: SessionNotification) {
        if self.notifications.send(notification).is_err() {
            debug!("notification receiver dropped");
        }
    }
}

/// `to` always comes from the session key, never from inbound data.
fn message_frame(to: &PeerId, command: &Command) -> Result<ClientFrame, ChannelError> {
    let envelope = Envelope::outbound(to.clone(), command)
        .map_err(|err| ChannelError::Encode(err.to_string()))?;
    ClientFrame::message(&envelope)
}
