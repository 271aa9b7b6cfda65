use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::channel::mock::MockChannel;
use crate::channel::{ClientFrame, RelayEvent};
use crate::config::{CandidatePolicy, SessionConfig};
use crate::engine::mock::{EngineCall, MockEngine};
use crate::engine::{ConnectionState, StreamHandle};
use crate::envelope::{CommandKind, PeerId, SessionDescription};
use crate::manager::{
    CallStatus, DispatchOutcome, ManagerEvent, SessionCore, SessionManager, SessionNotification,
};
use crate::negotiation::NegotiationState;
use crate::SessionError;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    core: SessionCore,
    engine: MockEngine,
    channel: MockChannel,
    events: mpsc::UnboundedReceiver<ManagerEvent>,
    notifications: mpsc::UnboundedReceiver<SessionNotification>,
}

impl Harness {
    fn new(config: SessionConfig, engine: MockEngine) -> Self {
        let channel = MockChannel::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (notify_tx, notifications) = mpsc::unbounded_channel();
        let core = SessionCore::new(
            config,
            Arc::new(engine.clone()),
            Arc::new(channel.clone()),
            events_tx,
            notify_tx,
        );
        Self {
            core,
            engine,
            channel,
            events,
            notifications,
        }
    }

    fn started(config: SessionConfig, engine: MockEngine) -> Self {
        let mut harness = Self::new(config, engine);
        harness.core.start("me").unwrap();
        harness.channel.take_sent();
        harness.engine.take_calls();
        harness.notes();
        harness
    }

    /// Feed queued engine callbacks back into the core until none are left.
    fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.core.handle(event);
        }
    }

    fn dispatch(&mut self, value: Value) -> DispatchOutcome {
        let outcome = self.core.dispatch(&value);
        self.pump();
        outcome
    }

    fn notes(&mut self) -> Vec<SessionNotification> {
        let mut notes = Vec::new();
        while let Ok(note) = self.notifications.try_recv() {
            notes.push(note);
        }
        notes
    }

    fn state_of(&self, peer: &str) -> Option<NegotiationState> {
        self.core
            .peers()
            .into_iter()
            .find(|summary| summary.id.as_str() == peer)
            .map(|summary| summary.state)
    }
}

fn init(from: &str) -> Value {
    json!({"from": from, "to": "me", "type": "init"})
}

fn offer(from: &str) -> Value {
    json!({"from": from, "to": "me", "type": "offer", "payload": {"type": "offer", "sdp": format!("v=0 from {from}")}})
}

fn answer(from: &str) -> Value {
    json!({"from": from, "to": "me", "type": "answer", "payload": {"type": "answer", "sdp": "v=0 answer"}})
}

fn candidate(from: &str, label: u16) -> Value {
    json!({"from": from, "to": "me", "type": "candidate",
           "payload": {"id": "video", "label": label, "candidate": format!("candidate:{label} 1 udp 1 10.1.1.{label} 9 typ host")}})
}

fn removed_count(notes: &[SessionNotification], peer: &str) -> usize {
    notes
        .iter()
        .filter(|note| {
            matches!(note, SessionNotification::RemoteStreamRemoved { peer: p, .. }
                if p.as_str() == peer)
        })
        .count()
}

fn added_candidates(engine: &MockEngine) -> Vec<u16> {
    engine
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            EngineCall::AddIceCandidate(_, candidate) => Some(candidate.label),
            _ => None,
        })
        .collect()
}

#[test]
fn init_from_unknown_peer_opens_slot_zero_and_sends_offer() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::new());

    assert_eq!(h.dispatch(init("alice")), DispatchOutcome::Routed);

    let peers = h.core.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].slot.index(), 0);
    assert_eq!(peers[0].state, NegotiationState::OfferSent);

    let calls = h.engine.calls();
    let alice = PeerId::from("alice");
    assert_eq!(calls[0], EngineCall::CreateConnection(alice.clone()));
    assert_eq!(calls[1], EngineCall::AttachStream(alice.clone(), "ARDAMS".into()));
    assert_eq!(calls[2], EngineCall::CreateOffer(alice.clone()));

    let sent = h.channel.sent_envelopes();
    assert_eq!(sent[0].kind, CommandKind::Offer);
    assert_eq!(sent[0].to, alice);
    assert_eq!(sent[0].from, None);
    assert!(sent.iter().skip(1).all(|env| env.kind == CommandKind::Candidate));

    assert!(matches!(
        h.notes().as_slice(),
        [SessionNotification::StatusChanged { status: CallStatus::Connecting, .. }]
    ));
}

#[test]
fn third_caller_is_rejected_when_two_slots_are_held() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::new());
    assert_eq!(h.dispatch(init("alice")), DispatchOutcome::Routed);
    assert_eq!(h.dispatch(init("bob")), DispatchOutcome::Routed);
    h.channel.take_sent();

    assert_eq!(h.dispatch(init("carol")), DispatchOutcome::Rejected);
    assert_eq!(h.core.peers().len(), 2);
    assert!(h.state_of("carol").is_none());
    assert_eq!(
        h.engine
            .count(|call| *call == EngineCall::CreateConnection(PeerId::from("carol"))),
        0
    );
    assert!(h.channel.sent().is_empty());
}

#[test]
fn disconnect_while_connected_releases_slot_once() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::new());
    assert_eq!(h.dispatch(offer("alice")), DispatchOutcome::Routed);
    assert_eq!(h.state_of("alice"), Some(NegotiationState::AnswerExchanged));

    let observer = h.engine.observer(&PeerId::from("alice")).unwrap();
    observer.connection_state_changed(ConnectionState::Connected);
    h.pump();
    assert_eq!(h.state_of("alice"), Some(NegotiationState::Connected));
    h.notes();

    observer.connection_state_changed(ConnectionState::Disconnected);
    h.pump();
    observer.remote_stream_removed();
    h.pump();

    assert!(h.core.peers().is_empty());
    let notes = h.notes();
    assert_eq!(removed_count(&notes, "alice"), 1);
    assert!(notes.iter().any(|note| matches!(
        note,
        SessionNotification::StatusChanged { status: CallStatus::Disconnected, .. }
    )));
    assert_eq!(
        h.engine.count(|call| matches!(call, EngineCall::Close(_))),
        1
    );

    assert_eq!(h.dispatch(init("bob")), DispatchOutcome::Routed);
    assert_eq!(h.core.peers()[0].slot.index(), 0);
}

#[test]
fn answerer_replies_with_answer_after_acknowledged_offer() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::new());
    h.dispatch(offer("alice"));

    let calls = h.engine.calls();
    assert!(calls.contains(&EngineCall::SetRemoteDescription(
        PeerId::from("alice"),
        SessionDescription::offer("v=0 from alice"),
    )));
    let sent = h.channel.sent_envelopes();
    assert_eq!(sent[0].kind, CommandKind::Answer);
    assert_eq!(sent[0].payload.as_ref().unwrap()["type"], "answer");
}

#[test]
fn offerer_applies_answer_and_then_candidates() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::new());
    h.dispatch(init("alice"));
    assert_eq!(h.dispatch(answer("alice")), DispatchOutcome::Routed);
    assert_eq!(h.state_of("alice"), Some(NegotiationState::AnswerExchanged));

    assert_eq!(h.dispatch(candidate("alice", 4)), DispatchOutcome::Routed);
    assert_eq!(added_candidates(&h.engine), vec![4]);
}

#[test]
fn early_candidate_is_dropped_and_later_one_applied() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::manual());
    h.dispatch(offer("alice"));

    assert_eq!(h.dispatch(candidate("alice", 1)), DispatchOutcome::Routed);
    assert!(added_candidates(&h.engine).is_empty());

    h.engine
        .observer(&PeerId::from("alice"))
        .unwrap()
        .remote_description_set();
    h.pump();
    assert!(added_candidates(&h.engine).is_empty());

    h.dispatch(candidate("alice", 2));
    assert_eq!(added_candidates(&h.engine), vec![2]);
}

#[test]
fn buffer_policy_applies_early_candidates_in_order() {
    let config = SessionConfig::builder()
        .candidate_policy(CandidatePolicy::Buffer)
        .build()
        .unwrap();
    let mut h = Harness::started(config, MockEngine::manual());
    h.dispatch(offer("alice"));
    h.dispatch(candidate("alice", 1));
    h.dispatch(candidate("alice", 2));
    assert!(added_candidates(&h.engine).is_empty());

    h.engine
        .observer(&PeerId::from("alice"))
        .unwrap()
        .remote_description_set();
    h.pump();
    h.dispatch(candidate("alice", 3));
    assert_eq!(added_candidates(&h.engine), vec![1, 2, 3]);
}

#[test]
fn teardown_twice_is_a_no_op_the_second_time() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::new());
    h.dispatch(init("alice"));
    h.notes();

    assert!(h.core.teardown(&PeerId::from("alice")));
    assert!(!h.core.teardown(&PeerId::from("alice")));

    let notes = h.notes();
    assert_eq!(removed_count(&notes, "alice"), 1);
    assert_eq!(
        h.engine.count(|call| matches!(call, EngineCall::Close(_))),
        1
    );
    h.dispatch(init("bob"));
    h.dispatch(init("carol"));
    assert_eq!(h.core.peers().len(), 2);
}

#[test]
fn malformed_envelopes_never_open_a_session() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::new());
    let bad = [
        json!(42),
        json!({"to": "me", "type": "init"}),
        json!({"from": "alice", "to": "me", "type": "offer"}),
        json!({"from": "alice", "to": "me", "type": "init", "payload": {"x": 1}}),
        json!({"from": "alice", "to": "me", "type": "hangup"}),
        json!({"from": "alice", "to": "me", "type": "candidate", "payload": {"id": "a"}}),
    ];
    for value in bad {
        assert_eq!(h.dispatch(value), DispatchOutcome::Malformed);
    }
    assert!(h.core.peers().is_empty());
    assert!(h.engine.calls().is_empty());
}

#[test]
fn candidate_from_unknown_peer_does_not_allocate() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::new());
    assert_eq!(h.dispatch(candidate("mallory", 0)), DispatchOutcome::Unexpected);
    assert_eq!(h.dispatch(answer("mallory")), DispatchOutcome::Unexpected);
    assert!(h.core.peers().is_empty());
}

#[test]
fn out_of_order_command_is_dropped_without_state_change() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::manual());
    h.dispatch(offer("alice"));
    assert_eq!(h.dispatch(answer("alice")), DispatchOutcome::Unexpected);
    assert_eq!(h.dispatch(init("alice")), DispatchOutcome::Unexpected);
    assert_eq!(h.state_of("alice"), Some(NegotiationState::OfferReceived));
}

#[test]
fn callbacks_from_a_torn_down_session_are_ignored() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::manual());
    let alice = PeerId::from("alice");
    h.dispatch(init(alice.as_str()));
    let stale = h.engine.observer(&alice).unwrap();

    h.core.teardown(&alice);
    h.dispatch(init(alice.as_str()));
    assert_eq!(h.state_of("alice"), Some(NegotiationState::OfferSent));

    stale.local_description_created(SessionDescription::offer("v=0 stale"));
    stale.connection_state_changed(ConnectionState::Failed);
    h.pump();
    assert!(h.channel.sent_envelopes().is_empty());
    assert_eq!(h.state_of("alice"), Some(NegotiationState::OfferSent));

    h.engine
        .observer(&alice)
        .unwrap()
        .local_description_created(SessionDescription::offer("v=0 fresh"));
    h.pump();
    assert_eq!(h.channel.sent_envelopes().len(), 1);
}

#[test]
fn negotiation_failure_is_reported_and_torn_down() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::manual());
    h.dispatch(init("alice"));
    h.notes();

    h.engine
        .observer(&PeerId::from("alice"))
        .unwrap()
        .negotiation_failed("codec mismatch");
    h.pump();

    assert!(h.core.peers().is_empty());
    let notes = h.notes();
    assert!(notes.iter().any(|note| matches!(
        note,
        SessionNotification::StatusChanged { status: CallStatus::Failed { reason }, .. } if reason == "codec mismatch"
    )));
    assert_eq!(removed_count(&notes, "alice"), 1);
}

#[test]
fn remote_stream_is_announced_with_its_slot() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::new());
    h.dispatch(init("alice"));
    h.dispatch(init("bob"));
    h.notes();

    let stream = StreamHandle::new("remote-bob", Arc::new(()));
    h.engine
        .observer(&PeerId::from("bob"))
        .unwrap()
        .remote_stream_added(stream.clone());
    h.pump();

    match h.notes().as_slice() {
        [SessionNotification::RemoteStreamAdded { peer, slot, stream: got }] => {
            assert_eq!(peer.as_str(), "bob");
            assert_eq!(slot.display_index(), 2);
            assert!(got.same_stream(&stream));
        }
        other => panic!("unexpected notifications {other:?}"),
    }
}

#[test]
fn refused_connection_returns_the_slot() {
    let engine = MockEngine::new();
    let mut h = Harness::started(SessionConfig::default(), engine.clone());
    engine.refuse_connections(true);
    assert_eq!(h.dispatch(init("alice")), DispatchOutcome::Failed);
    assert!(h.core.peers().is_empty());

    engine.refuse_connections(false);
    h.dispatch(init("alice"));
    h.dispatch(init("bob"));
    assert_eq!(h.core.peers().len(), 2);
}

#[test]
fn start_requires_a_connected_channel_and_runs_once() {
    let mut h = Harness::new(SessionConfig::default(), MockEngine::new());
    h.channel.set_connected(false);
    assert!(matches!(h.core.start("me"), Err(SessionError::NotConnected)));
    assert!(h.engine.calls().is_empty());

    h.channel.set_connected(true);
    h.core.start("me").unwrap();
    assert!(matches!(h.core.start("me"), Err(SessionError::AlreadyStarted)));
    assert_eq!(
        h.engine
            .count(|call| matches!(call, EngineCall::CreateLocalStream(_))),
        1
    );
    assert_eq!(
        h.channel.sent(),
        vec![ClientFrame::AnnounceReady { name: "me".into() }]
    );
    assert!(matches!(
        h.notes().as_slice(),
        [SessionNotification::LocalStream(_)]
    ));
}

#[test]
fn calls_placed_before_start_are_sent_once_started() {
    let mut h = Harness::new(SessionConfig::default(), MockEngine::new());
    h.core.initiate_call(PeerId::from("alice")).unwrap();
    h.core.initiate_call(PeerId::from("alice")).unwrap();
    assert!(h.channel.sent().is_empty());

    h.core.start("me").unwrap();
    let inits: Vec<_> = h
        .channel
        .sent_envelopes()
        .into_iter()
        .filter(|env| env.kind == CommandKind::Init)
        .collect();
    assert_eq!(inits.len(), 1);
    assert_eq!(inits[0].to.as_str(), "alice");
    assert_eq!(inits[0].payload, None);
}

#[test]
fn failed_announcement_leaves_start_retryable() {
    let mut h = Harness::new(SessionConfig::default(), MockEngine::new());
    h.core.initiate_call(PeerId::from("alice")).unwrap();
    h.channel.fail_sends(true);

    assert!(matches!(h.core.start("me"), Err(SessionError::Channel(_))));
    assert_eq!(
        h.engine
            .count(|call| matches!(call, EngineCall::ReleaseLocalStream(_))),
        1
    );
    assert!(h.notes().is_empty());

    h.channel.fail_sends(false);
    h.core.start("me").unwrap();
    assert_eq!(
        h.channel.sent()[0],
        ClientFrame::AnnounceReady { name: "me".into() }
    );
    let inits = h
        .channel
        .sent_envelopes()
        .into_iter()
        .filter(|env| env.kind == CommandKind::Init && env.to.as_str() == "alice")
        .count();
    assert_eq!(inits, 1);
}

#[tokio::test]
async fn mock_channel_stream_ends_on_disconnect() {
    use crate::channel::SignalingChannel;

    let channel = MockChannel::new();
    let mut events = channel.events().unwrap();
    channel.inject(RelayEvent::ReadyAck(PeerId::from("me")));
    channel.disconnect();
    channel.inject(RelayEvent::ReadyAck(PeerId::from("late")));

    let drained = tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        seen
    })
    .await
    .expect("stream ends after disconnect");
    assert_eq!(drained, vec![RelayEvent::ReadyAck(PeerId::from("me"))]);
}

#[test]
fn session_opened_before_start_is_receive_only() {
    let mut h = Harness::new(SessionConfig::default(), MockEngine::new());
    assert_eq!(h.dispatch(init("alice")), DispatchOutcome::Routed);
    assert_eq!(
        h.engine
            .count(|call| matches!(call, EngineCall::AttachStream(..))),
        0
    );
}

#[test]
fn relay_events_are_surfaced_and_messages_dispatched() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::new());
    h.core
        .handle(ManagerEvent::Relay(RelayEvent::IdentityAssigned("me".into())));
    h.core
        .handle(ManagerEvent::Relay(RelayEvent::ReadyAck("me".into())));
    h.core.handle(ManagerEvent::Relay(RelayEvent::Message(init("alice"))));
    h.core.handle(ManagerEvent::Relay(RelayEvent::Closed));

    let notes = h.notes();
    assert!(matches!(&notes[0], SessionNotification::IdentityAssigned(id) if id.as_str() == "me"));
    assert!(matches!(&notes[1], SessionNotification::CallReady(id) if id.as_str() == "me"));
    assert_eq!(h.state_of("alice"), Some(NegotiationState::OfferSent));
}

#[test]
fn shutdown_releases_everything_and_is_terminal() {
    let mut h = Harness::started(SessionConfig::default(), MockEngine::new());
    h.dispatch(init("alice"));
    h.dispatch(init("bob"));
    h.notes();

    h.core.shutdown();
    assert!(h.core.peers().is_empty());
    assert_eq!(
        h.engine.count(|call| matches!(call, EngineCall::Close(_))),
        2
    );
    assert_eq!(
        h.engine
            .count(|call| matches!(call, EngineCall::ReleaseLocalStream(_))),
        1
    );
    assert!(h.engine.is_disposed());
    assert!(h.channel.was_disconnected());
    assert_eq!(removed_count(&h.notes(), "alice"), 1);

    h.core.shutdown();
    assert_eq!(
        h.engine.count(|call| matches!(call, EngineCall::Dispose)),
        1
    );
    assert!(matches!(h.core.start("me"), Err(SessionError::ShutDown)));
    assert_eq!(h.dispatch(init("carol")), DispatchOutcome::Rejected);
}

#[test]
fn live_sessions_never_exceed_capacity() {
    let config = SessionConfig::builder().max_peers(3).build().unwrap();
    let mut h = Harness::started(config, MockEngine::new());

    for step in 0..60usize {
        let peer = format!("p{}", (step * 7) % 11);
        if step % 4 == 3 {
            h.core.teardown(&PeerId::from(peer.as_str()));
        } else {
            h.dispatch(init(&peer));
        }
        let peers = h.core.peers();
        assert!(peers.len() <= 3);
        let mut slots: Vec<usize> = peers.iter().map(|p| p.slot.index()).collect();
        slots.dedup();
        assert_eq!(slots.len(), peers.len());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manager_handle_serializes_requests_and_stops_after_shutdown() {
    let engine = MockEngine::new();
    let channel = MockChannel::new();
    let (manager, mut notes) = SessionManager::spawn(
        SessionConfig::default(),
        Arc::new(engine.clone()),
        Arc::new(channel.clone()),
    )
    .unwrap();

    tokio::time::timeout(WAIT, async {
        manager.start("me").await.unwrap();
        manager.request_identity().await.unwrap();
        channel.inject(RelayEvent::Message(init("alice")));

        let opened = loop {
            match notes.recv().await {
                Some(SessionNotification::StatusChanged {
                    peer,
                    status: CallStatus::Connecting,
                }) => break peer,
                Some(_) => continue,
                None => panic!("notifications closed"),
            }
        };
        assert_eq!(opened.as_str(), "alice");

        let peers = manager.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert!(
            channel
                .sent_envelopes()
                .iter()
                .any(|env| env.kind == CommandKind::Offer && env.to.as_str() == "alice")
        );
        assert!(channel.sent().contains(&ClientFrame::RequestIdentity));

        assert!(manager.teardown("alice").await.unwrap());
        assert!(!manager.teardown("alice").await.unwrap());

        assert!(!manager.is_shut_down());
        manager.shutdown().await.unwrap();
        // Observable as soon as the reply arrives, whichever worker thread ran it.
        assert!(manager.is_shut_down());
        assert!(matches!(manager.peers().await, Err(SessionError::ShutDown)));
        assert!(matches!(manager.start("again").await, Err(SessionError::ShutDown)));
        assert!(engine.is_disposed());
        assert!(channel.was_disconnected());

        // The worker has exited, so notifications end.
        while notes.recv().await.is_some() {}
    })
    .await
    .expect("manager test finished in time");
}
