//! Bridge configuration – reads/writes `~/.groundlink/config.toml`.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:9870"
//!
//! [client]
//! server_url = "ws://127.0.0.1:9870"
//! inbound_topics = [1, 2]
//! outbound_topics = [10]
//! retry_delay_ms = 1000
//! queue_capacity = 1000
//! overflow_policy = "drop_newest"
//!
//! [heartbeat]
//! topic = 100
//! interval_ms = 1000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use groundlink_middleware::{BridgeClientConfig, OverflowPolicy, ReceiverConfig};
use groundlink_types::{LinkError, TopicId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    /// Address the WebSocket bridge server listens on.
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Topics pulled from the server; empty means every topic.
    #[serde(default)]
    pub inbound_topics: Vec<TopicId>,

    /// Topics pushed to the server; empty means every topic.
    #[serde(default)]
    pub outbound_topics: Vec<TopicId>,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

/// Periodic counter published on the local bus; disabled without a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<TopicId>,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
}

fn default_bind() -> String {
    "0.0.0.0:9870".to_string()
}
fn default_server_url() -> String {
    "ws://127.0.0.1:9870".to_string()
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            inbound_topics: Vec::new(),
            outbound_topics: Vec::new(),
            retry_delay_ms: default_retry_delay_ms(),
            queue_capacity: default_queue_capacity(),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            topic: None,
            interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl ClientSection {
    pub fn bridge_config(&self) -> BridgeClientConfig {
        BridgeClientConfig {
            inbound_topics: self.inbound_topics.clone(),
            outbound_topics: self.outbound_topics.clone(),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            receiver: ReceiverConfig {
                capacity: self.queue_capacity,
                overflow_policy: self.overflow_policy,
            },
            ..BridgeClientConfig::default()
        }
    }
}

/// Return the path to `~/.groundlink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".groundlink").join("config.toml")
}

/// Load the config at `path` with environment overrides applied.  Returns
/// `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, LinkError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| LinkError::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| LinkError::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Like [`load_from`], falling back to defaults (with overrides) when the
/// file is missing.
pub fn load_or_default(path: &Path) -> Result<Config, LinkError> {
    match load_from(path)? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

/// Apply `GROUNDLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `GROUNDLINK_BIND` | `server.bind` |
/// | `GROUNDLINK_SERVER_URL` | `client.server_url` |
/// | `GROUNDLINK_RETRY_DELAY_MS` | `client.retry_delay_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("GROUNDLINK_BIND") {
        cfg.server.bind = v;
    }
    if let Ok(v) = std::env::var("GROUNDLINK_SERVER_URL") {
        cfg.client.server_url = v;
    }
    if let Ok(v) = std::env::var("GROUNDLINK_RETRY_DELAY_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.client.retry_delay_ms = ms;
    }
}

/// Write `cfg` to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), LinkError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| LinkError::Config(format!("failed to create {}: {e}", parent.display())))?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| LinkError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| LinkError::Config(format!("failed to write {}: {e}", path.display())))
}
