use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::sync::Mutex;

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

/// Seed address of a peer, used before the replicated topology knows it.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub id: u64,
    pub addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub id: u64,
    /// Start a brand-new single-node cluster instead of waiting to be added
    /// to an existing one. Only valid with an empty data directory.
    #[serde(default)]
    pub bootstrap: bool,
    pub addr: String,
    pub metrics_addr: String,
    pub base_path: String,
    #[serde(default)]
    pub node_list: Vec<NodeConfig>,

    // Consensus timers (milliseconds).
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    #[serde(default = "default_entries_per_segment")]
    pub entries_per_segment: u64,

    // Maintenance supervisor.
    #[serde(default = "default_supervisor_interval_ms")]
    pub supervisor_interval_ms: u64,
    #[serde(default = "default_promotion_etag_tolerance")]
    pub promotion_etag_tolerance: u64,
    #[serde(default = "default_suspect_after_ms")]
    pub suspect_after_ms: u64,
    #[serde(default = "default_demote_after_ms")]
    pub demote_after_ms: u64,
    #[serde(default = "default_remove_after_ms")]
    pub remove_after_ms: u64,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

fn default_election_timeout_min_ms() -> u64 {
    300
}
fn default_election_timeout_max_ms() -> u64 {
    600
}
fn default_heartbeat_interval_ms() -> u64 {
    100
}
fn default_snapshot_interval_ms() -> u64 {
    60_000
}
fn default_entries_per_segment() -> u64 {
    10_000
}
fn default_supervisor_interval_ms() -> u64 {
    1_000
}
fn default_promotion_etag_tolerance() -> u64 {
    128
}
fn default_suspect_after_ms() -> u64 {
    3_000
}
fn default_demote_after_ms() -> u64 {
    15_000
}
fn default_remove_after_ms() -> u64 {
    300_000
}
fn default_startup_grace_ms() -> u64 {
    10_000
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            bootstrap: false,
            addr: "0.0.0.0:4000".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
            base_path: "./data".to_string(),
            node_list: Vec::new(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            entries_per_segment: default_entries_per_segment(),
            supervisor_interval_ms: default_supervisor_interval_ms(),
            promotion_etag_tolerance: default_promotion_etag_tolerance(),
            suspect_after_ms: default_suspect_after_ms(),
            demote_after_ms: default_demote_after_ms(),
            remove_after_ms: default_remove_after_ms(),
            startup_grace_ms: default_startup_grace_ms(),
        }
    }

    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        let config: RuntimeConfig = match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        *instance().lock().unwrap() = config.clone();
        Some(config)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config_with_defaults() {
        let toml = r#"
            id = 2
            addr = "127.0.0.1:4000"
            metrics_addr = "127.0.0.1:4010"
            base_path = "/tmp/node2"

            [[node_list]]
            id = 1
            addr = "127.0.0.1:3000"
        "#;
        let config: RuntimeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.id, 2);
        assert!(!config.bootstrap);
        assert_eq!(config.node_list.len(), 1);
        assert_eq!(config.heartbeat_interval_ms, 100);
        assert_eq!(config.promotion_etag_tolerance, 128);
    }
}
