use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_PEERS: usize = 2;
pub const DEFAULT_STREAM_LABEL: &str = "ARDAMS";
pub const DEFAULT_MAX_BUFFERED_CANDIDATES: usize = 64;
/// Largest accepted `max_peers`; the endpoint pool is allocated up front.
pub const MAX_PEERS_LIMIT: usize = 256;

const ENV_MAX_PEERS: &str = "GROUPCALL_MAX_PEERS";
const ENV_CANDIDATE_POLICY: &str = "GROUPCALL_CANDIDATE_POLICY";
const ENV_LOCALHOST_ONLY: &str = "GROUPCALL_LOCALHOST_ONLY";

/// Configuration for a session manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on simultaneous remote participants
    pub max_peers: usize,
    /// ICE servers handed to every new connection
    pub ice_servers: Vec<IceServer>,
    /// Constraints for offers and answers
    pub constraints: MediaConstraints,
    /// What to do with candidates that arrive before the remote description
    pub candidate_policy: CandidatePolicy,
    /// Per-peer cap on candidates held under `CandidatePolicy::Buffer`
    pub max_buffered_candidates: usize,
    /// Local capture stream
    pub local_stream: LocalStreamConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            ice_servers: vec![
                IceServer::new("stun:23.21.150.121"),
                IceServer::new("stun:stun.l.google.com:19302"),
            ],
            constraints: MediaConstraints::default(),
            candidate_policy: CandidatePolicy::default(),
            max_buffered_candidates: DEFAULT_MAX_BUFFERED_CANDIDATES,
            local_stream: LocalStreamConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `GROUPCALL_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(ENV_MAX_PEERS) {
            self.max_peers = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                field: ENV_MAX_PEERS,
                reason: format!("expected a positive integer, got {raw:?}"),
            })?;
        }
        if let Some(raw) = lookup(ENV_CANDIDATE_POLICY) {
            self.candidate_policy = raw.parse()?;
        }
        if lookup(ENV_LOCALHOST_ONLY).is_some_and(|v| v != "0" && !v.is_empty()) {
            self.ice_servers.clear();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid {
                field: "max_peers",
                reason: "at least one peer slot is required".into(),
            });
        }
        if self.max_peers > MAX_PEERS_LIMIT {
            return Err(ConfigError::Invalid {
                field: "max_peers",
                reason: format!("{} exceeds the limit of {MAX_PEERS_LIMIT}", self.max_peers),
            });
        }
        if self.ice_servers.iter().any(|server| server.urls.is_empty()) {
            return Err(ConfigError::Invalid {
                field: "ice_servers",
                reason: "every ice server needs at least one url".into(),
            });
        }
        if self.local_stream.label.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "local_stream.label",
                reason: "stream label must not be empty".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
    pub dtls_srtp_key_agreement: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
            dtls_srtp_key_agreement: true,
        }
    }
}

/// Handling of remote ICE candidates that arrive before the remote
/// description has been applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidatePolicy {
    #[default]
    Drop,
    /// Hold them per peer and apply them in order once the engine
    /// acknowledges the remote description.
    Buffer,
}

impl FromStr for CandidatePolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(CandidatePolicy::Drop),
            "buffer" => Ok(CandidatePolicy::Buffer),
            other => Err(ConfigError::Invalid {
                field: "candidate_policy",
                reason: format!("unknown policy {other:?} (expected drop or buffer)"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStreamConfig {
    pub label: String,
    pub audio: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoParameters>,
}

impl Default for LocalStreamConfig {
    fn default() -> Self {
        Self {
            label: DEFAULT_STREAM_LABEL.to_string(),
            audio: true,
            video: Some(VideoParameters::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoParameters {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for VideoParameters {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

/// Builder for session configuration
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    max_peers: Option<usize>,
    ice_servers: Option<Vec<IceServer>>,
    constraints: Option<MediaConstraints>,
    candidate_policy: Option<CandidatePolicy>,
    max_buffered_candidates: Option<usize>,
    local_stream: Option<LocalStreamConfig>,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = Some(max_peers);
        self
    }

    pub fn add_ice_server(mut self, url: impl Into<String>) -> Self {
        self.ice_servers
            .get_or_insert_with(Vec::new)
            .push(IceServer::new(url));
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.get_or_insert_with(Vec::new).push(IceServer {
            urls,
            username: Some(username),
            credential: Some(credential),
        });
        self
    }

    /// No STUN/TURN servers at all.
    pub fn localhost_only(mut self) -> Self {
        self.ice_servers = Some(Vec::new());
        self
    }

    pub fn constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn candidate_policy(mut self, policy: CandidatePolicy) -> Self {
        self.candidate_policy = Some(policy);
        self
    }

    pub fn max_buffered_candidates(mut self, limit: usize) -> Self {
        self.max_buffered_candidates = Some(limit);
        self
    }

    pub fn local_stream(mut self, local_stream: LocalStreamConfig) -> Self {
        self.local_stream = Some(local_stream);
        self
    }

    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let defaults = SessionConfig::default();
        let config = SessionConfig {
            max_peers: self.max_peers.unwrap_or(defaults.max_peers),
            ice_servers: self.ice_servers.unwrap_or(defaults.ice_servers),
            constraints: self.constraints.unwrap_or(defaults.constraints),
            candidate_policy: self.candidate_policy.unwrap_or(defaults.candidate_policy),
            max_buffered_candidates: self
                .max_buffered_candidates
                .unwrap_or(defaults.max_buffered_candidates),
            local_stream: self.local_stream.unwrap_or(defaults.local_stream),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
