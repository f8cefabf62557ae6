//! Runtime configuration (§6.6), loaded from `config.toml`.
//!
//! Shaped after the teacher's `Config`/`SettingsForm` split: a
//! `#[serde(default = ...)]` field per tunable with a free-standing default
//! function, and a `Default` impl that doubles as the template written out
//! the first time no config file exists.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_PORT;
use crate::error::{LcpError, Result};

fn default_listen_port() -> u16 {
    DEFAULT_PORT
}

fn default_broadcast_addresses() -> Vec<String> {
    vec!["255.255.255.255".to_string()]
}

fn default_discovery_period_secs() -> u64 {
    10
}

fn default_peer_timeout_secs() -> u64 {
    90
}

fn default_received_file_directory() -> PathBuf {
    PathBuf::from("received_files")
}

fn default_header_timeout_secs() -> u64 {
    2
}

fn default_body_timeout_secs() -> u64 {
    3
}

fn default_message_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Human-readable peer id, encoded on the wire per §3's `PeerId`.
    pub local_peer_id: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Broadcast destinations the discovery worker sends ECHO to.
    /// Computing the host's own broadcast address is out of scope; the
    /// host supplies one or more addresses directly.
    #[serde(default = "default_broadcast_addresses")]
    pub broadcast_addresses: Vec<String>,

    #[serde(default = "default_discovery_period_secs")]
    pub discovery_period_secs: u64,

    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,

    /// Overrides the §4.7 worker-pool formula's computed concurrent-
    /// transfer ceiling when set (§6.6); `None` defers to the computed
    /// value.
    #[serde(default)]
    pub max_concurrent_file_sends: Option<usize>,

    #[serde(default = "default_received_file_directory")]
    pub received_file_directory: PathBuf,

    #[serde(default = "default_header_timeout_secs")]
    pub header_timeout_secs: u64,

    #[serde(default = "default_body_timeout_secs")]
    pub body_timeout_secs: u64,

    #[serde(default = "default_message_retries")]
    pub message_retries: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            local_peer_id: "anonymous".to_string(),
            listen_port: default_listen_port(),
            broadcast_addresses: default_broadcast_addresses(),
            discovery_period_secs: default_discovery_period_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
            max_concurrent_file_sends: None,
            received_file_directory: default_received_file_directory(),
            header_timeout_secs: default_header_timeout_secs(),
            body_timeout_secs: default_body_timeout_secs(),
            message_retries: default_message_retries(),
        }
    }
}

impl PeerConfig {
    /// Load from `path`, writing out a default template if it doesn't
    /// exist yet rather than silently falling back to defaults — a
    /// missing config is almost always a first-run, and the host should
    /// see (and edit) what it's about to run with.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let template = Self::default();
            let toml = toml::to_string_pretty(&template)
                .map_err(|e| LcpError::Config(format!("failed to render default config: {e}")))?;
            fs::write(path, toml)
                .map_err(|e| LcpError::Config(format!("failed to write {path:?}: {e}")))?;
            return Err(LcpError::Config(format!(
                "no config found, default written to {path:?}; edit it and rerun"
            )));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| LcpError::Config(format!("failed to read {path:?}: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| LcpError::Config(format!("failed to parse {path:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = PeerConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: PeerConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.local_peer_id, cfg.local_peer_id);
        assert_eq!(parsed.listen_port, cfg.listen_port);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let minimal = "local_peer_id = \"alice\"\n";
        let parsed: PeerConfig = toml::from_str(minimal).unwrap();
        assert_eq!(parsed.local_peer_id, "alice");
        assert_eq!(parsed.listen_port, default_listen_port());
        assert_eq!(parsed.max_concurrent_file_sends, None);
    }
}
