//! Per-node JSON configuration.
//!
//! One file per node identifier under the user config directory. Saves are
//! atomic: written to a sibling temp file and renamed over the target.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use weft_types::unix_now;

const CONFIG_FILE: &str = "config.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    /// Local rpc/control listen address (host:port).
    pub rpc_listen_addr: String,
    /// Overlay port for TCP and QUIC; 0 picks ephemeral ports.
    pub overlay_port: u16,
    /// Loopback-only operation: no DHT, no NAT traversal.
    pub local_mode: bool,
    /// Multiaddrs dialed at startup.
    pub bootstrap_peers: Vec<String>,
    /// Unix seconds of the last successful save.
    pub last_saved: u64,
    /// Free-form operator annotations.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        NodeConfig {
            node_id: node_id.into(),
            rpc_listen_addr: "127.0.0.1:9470".to_string(),
            overlay_port: 0,
            local_mode: false,
            bootstrap_peers: Vec::new(),
            last_saved: 0,
            extra: BTreeMap::new(),
        }
    }

    /// The node's state directory: `<config_dir>/weft/<node_id>`.
    pub fn default_dir(node_id: &str) -> Result<PathBuf> {
        let base = dirs::config_dir().context("no user config directory on this platform")?;
        Ok(base.join("weft").join(node_id))
    }

    /// Loads the config from `dir`, or returns defaults when no file exists
    /// yet. A malformed file is an error, not a silent reset.
    pub fn load_or_default(node_id: &str, dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(NodeConfig::new(node_id));
        }
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let config: NodeConfig =
            serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
        Ok(config)
    }

    /// Atomically persists the config into `dir`, stamping `last_saved`.
    pub fn save(&mut self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        self.last_saved = unix_now();

        let path = dir.join(CONFIG_FILE);
        let tmp = dir.join(format!("{CONFIG_FILE}.tmp"));
        let bytes = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load_or_default("n1", dir.path()).unwrap();
        assert_eq!(config.node_id, "n1");
        assert_eq!(config.overlay_port, 0);
        assert!(!config.local_mode);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::new("n2");
        config.overlay_port = 12_100;
        config.local_mode = true;
        config.bootstrap_peers = vec!["/ip4/10.0.0.1/tcp/12100".to_string()];
        config.extra.insert("region".into(), "eu-west".into());
        config.save(dir.path()).unwrap();

        let loaded = NodeConfig::load_or_default("n2", dir.path()).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.last_saved > 0);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), b"{not json").unwrap();
        assert!(NodeConfig::load_or_default("n3", dir.path()).is_err());
    }

    #[test]
    fn save_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::new("n4");
        config.save(dir.path()).unwrap();
        config.overlay_port = 7;
        config.save(dir.path()).unwrap();

        let loaded = NodeConfig::load_or_default("n4", dir.path()).unwrap();
        assert_eq!(loaded.overlay_port, 7);
        assert!(!dir.path().join(format!("{CONFIG_FILE}.tmp")).exists());
    }
}
