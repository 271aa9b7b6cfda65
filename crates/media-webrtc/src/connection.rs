use std::collections::HashMap;
use std::sync::Arc;

use groupcall_core::config::MediaConstraints;
use groupcall_core::engine::EngineObserver;
use groupcall_core::{IceCandidate, PeerConnection, SessionDescription, StreamHandle};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::convert;
use crate::{LocalMedia, RemoteMedia};

enum Op {
    Attach(StreamHandle),
    Offer(MediaConstraints),
    Answer(MediaConstraints),
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    Candidate(IceCandidate),
    Close,
}

/// Handle to a connection driven by its own task.
///
/// Operations are queued and applied strictly in submission order, which keeps
/// the fire-and-forget contract of [`PeerConnection`] while the underlying
/// webrtc calls are async.
pub(crate) struct WebRtcConnection {
    ops: mpsc::UnboundedSender<Op>,
}

impl WebRtcConnection {
    pub(crate) fn spawn(
        runtime: &tokio::runtime::Handle,
        api: Arc<API>,
        config: RTCConfiguration,
        observer: EngineObserver,
    ) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        runtime.spawn(drive(api, config, observer, rx));
        Self { ops }
    }

    fn submit(&self, op: Op) {
        if self.ops.send(op).is_err() {
            tracing::trace!("connection driver gone; operation dropped");
        }
    }
}

impl PeerConnection for WebRtcConnection {
    fn attach_stream(&self, stream: &StreamHandle) {
        self.submit(Op::Attach(stream.clone()));
    }

    fn create_offer(&self, constraints: &MediaConstraints) {
        self.submit(Op::Offer(constraints.clone()));
    }

    fn create_answer(&self, constraints: &MediaConstraints) {
        self.submit(Op::Answer(constraints.clone()));
    }

    fn set_local_description(&self, description: SessionDescription) {
        self.submit(Op::SetLocal(description));
    }

    fn set_remote_description(&self, description: SessionDescription) {
        self.submit(Op::SetRemote(description));
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) {
        self.submit(Op::Candidate(candidate));
    }

    fn close(&self) {
        self.submit(Op::Close);
    }
}

#[derive(Default)]
struct Sending {
    audio: bool,
    video: bool,
}

async fn drive(
    api: Arc<API>,
    config: RTCConfiguration,
    observer: EngineObserver,
    mut ops: mpsc::UnboundedReceiver<Op>,
) {
    let peer = observer.peer().clone();
    let pc = match api.new_peer_connection(config).await {
        Ok(pc) => Arc::new(pc),
        Err(err) => {
            tracing::warn!(peer = %peer, error = %err, "peer connection setup failed");
            observer.negotiation_failed(format!("peer connection setup failed: {err}"));
            return;
        }
    };
    register_handlers(&pc, &observer);

    let mut sending = Sending::default();
    while let Some(op) = ops.recv().await {
        if matches!(op, Op::Close) {
            break;
        }
        if let Err(reason) = apply(&pc, &observer, &mut sending, op).await {
            tracing::warn!(peer = %peer, reason = %reason, "webrtc operation failed");
            observer.negotiation_failed(reason);
        }
    }

    if let Err(err) = pc.close().await {
        tracing::debug!(peer = %peer, error = %err, "peer connection close failed");
    }
    tracing::debug!(peer = %peer, "connection driver finished");
}

async fn apply(
    pc: &Arc<RTCPeerConnection>,
    observer: &EngineObserver,
    sending: &mut Sending,
    op: Op,
) -> Result<(), String> {
    match op {
        Op::Attach(stream) => {
            let Some(media) = stream.downcast::<LocalMedia>() else {
                return Err(format!("stream {} was not created by this engine", stream.label()));
            };
            if let Some(track) = media.audio() {
                let track: Arc<dyn TrackLocal + Send + Sync> = track;
                pc.add_track(track)
                    .await
                    .map_err(|err| format!("add audio track failed: {err}"))?;
                sending.audio = true;
            }
            if let Some(track) = media.video() {
                let track: Arc<dyn TrackLocal + Send + Sync> = track;
                pc.add_track(track)
                    .await
                    .map_err(|err| format!("add video track failed: {err}"))?;
                sending.video = true;
            }
        }
        Op::Offer(constraints) => {
            receive_only(pc, &constraints, sending).await?;
            let offer = pc
                .create_offer(None)
                .await
                .map_err(|err| format!("create offer failed: {err}"))?;
            emit_local(observer, &offer);
        }
        Op::Answer(_) => {
            let answer = pc
                .create_answer(None)
                .await
                .map_err(|err| format!("create answer failed: {err}"))?;
            emit_local(observer, &answer);
        }
        Op::SetLocal(description) => {
            let description = convert::to_rtc_description(description)
                .map_err(|err| format!("invalid local description: {err}"))?;
            pc.set_local_description(description)
                .await
                .map_err(|err| format!("set local description failed: {err}"))?;
        }
        Op::SetRemote(description) => {
            let description = convert::to_rtc_description(description)
                .map_err(|err| format!("invalid remote description: {err}"))?;
            pc.set_remote_description(description)
                .await
                .map_err(|err| format!("set remote description failed: {err}"))?;
            observer.remote_description_set();
        }
        Op::Candidate(candidate) => {
            pc.add_ice_candidate(convert::candidate_to_init(candidate))
                .await
                .map_err(|err| format!("add ice candidate failed: {err}"))?;
        }
        Op::Close => {}
    }
    Ok(())
}

/// Receive-only transceivers for requested kinds we are not sending.
async fn receive_only(
    pc: &Arc<RTCPeerConnection>,
    constraints: &MediaConstraints,
    sending: &mut Sending,
) -> Result<(), String> {
    let wanted = [
        (RTPCodecType::Audio, constraints.offer_to_receive_audio, &mut sending.audio),
        (RTPCodecType::Video, constraints.offer_to_receive_video, &mut sending.video),
    ];
    for (kind, requested, present) in wanted {
        if !requested || *present {
            continue;
        }
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|err| format!("add {kind} transceiver failed: {err}"))?;
        *present = true;
    }
    Ok(())
}

fn emit_local(observer: &EngineObserver, description: &RTCSessionDescription) {
    match convert::from_rtc_description(description) {
        Some(description) => observer.local_description_created(description),
        None => tracing::debug!(peer = %observer.peer(), "ignoring provisional local description"),
    }
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, observer: &EngineObserver) {
    let candidates = observer.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let observer = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                tracing::trace!(peer = %observer.peer(), "ice gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => observer.ice_candidate(convert::candidate_from_init(init)),
                Err(err) => {
                    tracing::warn!(
                        peer = %observer.peer(),
                        error = %err,
                        "failed to serialize ice candidate"
                    )
                }
            }
        })
    }));

    let states = observer.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let observer = states.clone();
        Box::pin(async move {
            tracing::debug!(peer = %observer.peer(), state = %state, "ice connection state");
            if let Some(state) = convert::connection_state(state) {
                observer.connection_state_changed(state);
            }
        })
    }));

    // One notification per remote stream, not per track.
    let streams = Arc::new(Mutex::new(HashMap::<String, Arc<RemoteMedia>>::new()));
    let tracks = observer.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let observer = tracks.clone();
            let streams = Arc::clone(&streams);
            Box::pin(async move {
                let stream_id = track.stream_id();
                tracing::debug!(
                    peer = %observer.peer(),
                    stream = %stream_id,
                    kind = %track.kind(),
                    "remote track"
                );
                let added = {
                    let mut streams = streams.lock();
                    match streams.get(&stream_id) {
                        Some(media) => {
                            media.push(track);
                            None
                        }
                        None => {
                            let media = Arc::new(RemoteMedia::new(stream_id.clone(), track));
                            streams.insert(stream_id.clone(), Arc::clone(&media));
                            Some(media)
                        }
                    }
                };
                if let Some(media) = added {
                    observer.remote_stream_added(StreamHandle::new(stream_id, media));
                }
            })
        },
    ));
}
