//! [`MediaEngine`] backed by webrtc-rs.
//!
//! Local capture is represented by sample tracks (Opus audio, VP8 video) that
//! the application feeds; remote media surfaces as the raw remote tracks of
//! each negotiated stream.

mod connection;
mod convert;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use groupcall_core::config::{IceServer, LocalStreamConfig, MediaConstraints, VideoParameters};
use groupcall_core::engine::EngineObserver;
use groupcall_core::{EngineError, MediaEngine, PeerConnection, StreamHandle};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use connection::WebRtcConnection;

pub struct WebRtcEngine {
    api: Arc<API>,
    runtime: Handle,
    disposed: AtomicBool,
}

impl WebRtcEngine {
    /// Build on the current tokio runtime.
    pub fn new() -> Result<Self, EngineError> {
        let runtime = Handle::try_current()
            .map_err(|err| EngineError::Setup(format!("no tokio runtime: {err}")))?;
        Self::with_runtime(runtime)
    }

    /// Build with connection drivers spawned onto `runtime`.
    pub fn with_runtime(runtime: Handle) -> Result<Self, EngineError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(25)),
            Some(Duration::from_secs(2)),
        );
        Ok(Self {
            api: Arc::new(build_api(setting)?),
            runtime,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.is_disposed() {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }
}

fn build_api(setting: SettingEngine) -> Result<API, EngineError> {
    let mut media_engine = webrtc::api::media_engine::MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> EngineError {
    EngineError::Setup(err.to_string())
}

impl MediaEngine for WebRtcEngine {
    fn create_local_stream(&self, config: &LocalStreamConfig) -> Result<StreamHandle, EngineError> {
        self.ensure_live()?;
        let media = LocalMedia::new(config)?;
        tracing::debug!(
            label = %config.label,
            audio = media.audio.is_some(),
            video = media.video.is_some(),
            "local stream created"
        );
        Ok(StreamHandle::new(config.label.clone(), Arc::new(media)))
    }

    fn create_connection(
        &self,
        ice_servers: &[IceServer],
        constraints: &MediaConstraints,
        observer: EngineObserver,
    ) -> Result<Box<dyn PeerConnection>, EngineError> {
        self.ensure_live()?;
        if !constraints.dtls_srtp_key_agreement {
            tracing::debug!(
                peer = %observer.peer(),
                "dtls-srtp is always negotiated; constraint ignored"
            );
        }
        let config = RTCConfiguration {
            ice_servers: convert::ice_servers(ice_servers),
            ..Default::default()
        };
        Ok(Box::new(WebRtcConnection::spawn(
            &self.runtime,
            Arc::clone(&self.api),
            config,
            observer,
        )))
    }

    fn release_local_stream(&self, stream: StreamHandle) {
        match stream.downcast::<LocalMedia>() {
            Some(media) => tracing::debug!(label = %media.label, "local stream released"),
            None => tracing::warn!(
                label = %stream.label(),
                "released a stream this engine did not create"
            ),
        }
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            tracing::debug!("webrtc engine disposed");
        }
    }
}

/// Local capture tracks. The application writes encoded samples into them.
pub struct LocalMedia {
    label: String,
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
    video_parameters: Option<VideoParameters>,
}

impl LocalMedia {
    fn new(config: &LocalStreamConfig) -> Result<Self, EngineError> {
        if !config.audio && config.video.is_none() {
            return Err(EngineError::Stream("neither audio nor video requested".into()));
        }
        let audio = config.audio.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48_000,
                    channels: 2,
                    ..Default::default()
                },
                format!("{}a0", config.label),
                config.label.clone(),
            ))
        });
        let video = config.video.as_ref().map(|_| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90_000,
                    ..Default::default()
                },
                format!("{}v0", config.label),
                config.label.clone(),
            ))
        });
        Ok(Self {
            label: config.label.clone(),
            audio,
            video,
            video_parameters: config.video,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn audio(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.audio.clone()
    }

    pub fn video(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.video.clone()
    }

    /// Capture geometry the video track was requested with.
    pub fn video_parameters(&self) -> Option<&VideoParameters> {
        self.video_parameters.as_ref()
    }
}

/// Tracks received from one remote stream.
pub struct RemoteMedia {
    stream_id: String,
    tracks: Mutex<Vec<Arc<TrackRemote>>>,
}

impl RemoteMedia {
    fn new(stream_id: String, first: Arc<TrackRemote>) -> Self {
        Self {
            stream_id,
            tracks: Mutex::new(vec![first]),
        }
    }

    fn push(&self, track: Arc<TrackRemote>) {
        self.tracks.lock().push(track);
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.tracks.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::track::track_local::TrackLocal;

    #[tokio::test]
    async fn local_stream_carries_labelled_tracks() {
        let engine = WebRtcEngine::new().unwrap();
        let stream = engine
            .create_local_stream(&LocalStreamConfig::default())
            .unwrap();
        assert_eq!(stream.label(), "ARDAMS");

        let media = stream.downcast::<LocalMedia>().unwrap();
        assert_eq!(media.audio().unwrap().id(), "ARDAMSa0");
        assert_eq!(media.video().unwrap().stream_id(), "ARDAMS");
        assert_eq!(media.video_parameters().map(|v| v.width), Some(640));
    }

    #[tokio::test]
    async fn audio_only_and_empty_streams() {
        let engine = WebRtcEngine::new().unwrap();
        let audio_only = LocalStreamConfig {
            video: None,
            ..LocalStreamConfig::default()
        };
        let media = engine
            .create_local_stream(&audio_only)
            .unwrap()
            .downcast::<LocalMedia>()
            .unwrap();
        assert!(media.audio().is_some());
        assert!(media.video().is_none());

        let nothing = LocalStreamConfig {
            audio: false,
            video: None,
            ..LocalStreamConfig::default()
        };
        assert!(matches!(
            engine.create_local_stream(&nothing),
            Err(EngineError::Stream(_))
        ));
    }

    #[tokio::test]
    async fn disposed_engine_refuses_work() {
        let engine = WebRtcEngine::new().unwrap();
        engine.dispose();
        engine.dispose();
        assert!(engine.is_disposed());
        assert!(matches!(
            engine.create_local_stream(&LocalStreamConfig::default()),
            Err(EngineError::Disposed)
        ));
    }

    #[test]
    fn new_requires_a_runtime() {
        assert!(matches!(WebRtcEngine::new(), Err(EngineError::Setup(_))));
    }
}
