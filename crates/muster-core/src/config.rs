//! Configuration for the broker daemon and the agent dialer.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MUSTER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/muster/config.toml
//!   3. ~/.config/muster/config.toml

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Broker-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// TCP listen address for agent connections.
    pub listen_addr: String,
    /// Fleet-wide shared secret; both sides derive the envelope key from it.
    pub shared_secret: String,
    /// If true, newly created peer records are active immediately.
    /// If false, an operator must activate each peer before it may join.
    pub auto_activate: bool,
    /// Issue a per-session secret and obfuscate frames with it.
    pub issue_session_secret: bool,
    /// Registry partition count. Must be a power of two.
    pub registry_shards: usize,
    pub handshake: HandshakeConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Sustained handshakes per second admitted past the limiter.
    pub rate_per_sec: f64,
    /// Burst allowance on top of the sustained rate.
    pub burst: f64,
    /// Deadline for one whole handshake, in seconds.
    pub timeout_secs: u64,
    /// Read timeout applied to a silent session, as a multiple of the
    /// peer's declared heartbeat interval.
    pub read_timeout_multiplier: u32,
    /// Heartbeat interval assumed when a peer declares none, in seconds.
    pub default_heartbeat_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-call deadline, in seconds.
    pub timeout_secs: u64,
    /// Fixed worker count of the dispatch pool.
    pub workers: usize,
    /// Capacity of the dispatch queue. Submission blocks when full.
    pub queue: usize,
}

/// One candidate broker address on the agent side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// host:port to dial.
    pub addr: String,
    /// Wrap the connection in TLS.
    #[serde(default)]
    pub tls: bool,
    /// SNI/server-name override. Defaults to the host part of `addr`.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Agent-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Candidate broker endpoints, tried round-robin.
    pub endpoints: Vec<EndpointConfig>,
    pub shared_secret: String,
    /// Software version asserted in the identity.
    pub version: String,
    /// Stable hardware identifier. Empty = derive from the dial address.
    pub hardware_id: String,
    pub heartbeat_secs: u64,
    /// Per-attempt dial timeout, in seconds.
    pub dial_timeout_secs: u64,
    /// Address asserted in the identity. Defaults to the dial socket's
    /// local address.
    pub advertise_addr: Option<IpAddr>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:59100".into(),
            shared_secret: String::new(),
            auto_activate: true,
            issue_session_secret: true,
            registry_shards: 128,
            handshake: HandshakeConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 150.0,
            burst: 150.0,
            timeout_secs: 5,
            read_timeout_multiplier: 3,
            default_heartbeat_secs: 15,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            workers: 64,
            queue: 1024,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            shared_secret: String::new(),
            version: env!("CARGO_PKG_VERSION").into(),
            hardware_id: String::new(),
            heartbeat_secs: 15,
            dial_timeout_secs: 5,
            advertise_addr: None,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("muster")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BrokerConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            BrokerConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MUSTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BrokerConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MUSTER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MUSTER_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = std::env::var("MUSTER_SHARED_SECRET") {
            self.shared_secret = v;
        }
        if let Ok(v) = std::env::var("MUSTER_AUTO_ACTIVATE") {
            self.auto_activate = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MUSTER_HANDSHAKE__RATE_PER_SEC") {
            if let Ok(r) = v.parse() {
                self.handshake.rate_per_sec = r;
            }
        }
        if let Ok(v) = std::env::var("MUSTER_DISPATCH__TIMEOUT_SECS") {
            if let Ok(t) = v.parse() {
                self.dispatch.timeout_secs = t;
            }
        }
    }
}

impl AgentConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            AgentConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MUSTER_AGENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("agent.toml"))
    }

    /// Apply MUSTER_AGENT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MUSTER_AGENT_ENDPOINT") {
            self.endpoints = vec![EndpointConfig {
                addr: v,
                tls: false,
                server_name: None,
            }];
        }
        if let Ok(v) = std::env::var("MUSTER_AGENT_SHARED_SECRET") {
            self.shared_secret = v;
        }
        if let Ok(v) = std::env::var("MUSTER_AGENT_HEARTBEAT_SECS") {
            if let Ok(h) = v.parse() {
                self.heartbeat_secs = h;
            }
        }
    }
}
