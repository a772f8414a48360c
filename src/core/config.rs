// Copyright (c) 2026 Dignode
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Typed node configuration.
//!
//! Sources, in order of precedence: built-in defaults, an optional TOML
//! file, then the `DIG_*` environment variables. Unknown TOML keys are
//! rejected rather than ignored.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("read config: {0}")]
    Read(String),
    /// Config file could not be parsed (includes unknown keys).
    #[error("parse config: {0}")]
    Parse(String),
    /// A value failed validation.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Node configuration root. All fields have spec defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NodeConfig {
    /// Store directory; `.dig` and `.dig.part` files live here.
    pub dig_home: PathBuf,
    /// TCP listen port; 0 lets the OS assign one.
    pub port: u16,
    /// Bootstrap service base URLs, tried in order.
    pub bootstrap_servers: Vec<String>,
    /// Accepted for compatibility; local discovery currently rides gossip.
    pub enable_mdns: bool,
    /// Join the DHT and store/resolve `/dig-*` records.
    pub enable_dht: bool,
    /// Multiaddresses dialed at startup.
    pub connect_to_peers: Vec<String>,
    /// Network identifier carried in handshakes and registrations.
    pub network_id: String,
    /// Listen address for the metrics endpoint; empty disables it.
    pub metrics_addr: String,

    /// Seconds between sync cycles.
    pub sync_interval_secs: u64,
    /// Seconds a peer entry lives without being observed.
    pub peer_ttl_secs: u64,
    /// Requests allowed per remote peer per minute.
    pub max_requests_per_minute: u32,
    /// Outbound dial deadline in seconds.
    pub dial_timeout_secs: u64,
    /// Concurrent outbound dials.
    pub max_parallel_dials: usize,
    /// Per-chunk response deadline in seconds.
    pub chunk_timeout_secs: u64,
    /// Upper bound on announcement jitter in seconds.
    pub announce_jitter_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            dig_home: default_dig_home(),
            port: 0,
            bootstrap_servers: Vec::new(),
            enable_mdns: true,
            enable_dht: true,
            connect_to_peers: Vec::new(),
            network_id: "mainnet".to_string(),
            metrics_addr: String::new(),
            sync_interval_secs: 30,
            peer_ttl_secs: 600,
            max_requests_per_minute: 100,
            dial_timeout_secs: 60,
            max_parallel_dials: 10,
            chunk_timeout_secs: 30,
            announce_jitter_secs: 30,
        }
    }
}

fn default_dig_home() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".dig");
    }
    PathBuf::from(".dig")
}

impl NodeConfig {
    /// Load configuration: defaults, then `path` (if given), then `DIG_*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| ConfigError::Read(e.to_string()))?;
                toml::from_str::<NodeConfig>(&raw)
                    .map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            None => NodeConfig::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `DIG_HOME`, `DIG_PORT`, `DIG_NETWORK_ID`, `DIG_BOOTSTRAP_NODES`.
    pub fn apply_env(&mut self) {
        if let Ok(home) = std::env::var("DIG_HOME") {
            if !home.trim().is_empty() {
                self.dig_home = PathBuf::from(home);
            }
        }
        if let Ok(port) = std::env::var("DIG_PORT") {
            if let Ok(p) = port.trim().parse::<u16>() {
                self.port = p;
            }
        }
        if let Ok(net) = std::env::var("DIG_NETWORK_ID") {
            if !net.trim().is_empty() {
                self.network_id = net.trim().to_string();
            }
        }
        if let Ok(nodes) = std::env::var("DIG_BOOTSTRAP_NODES") {
            let list: Vec<String> = nodes
                .split(',')
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !list.is_empty() {
                self.bootstrap_servers = list;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.network_id.trim().is_empty() {
            return Err(ConfigError::Invalid("network_id must not be empty".into()));
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid("sync_interval_secs must be > 0".into()));
        }
        if self.max_requests_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "max_requests_per_minute must be > 0".into(),
            ));
        }
        for url in &self.bootstrap_servers {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "bootstrap server {url} is not an http(s) URL"
                )));
            }
        }
        Ok(())
    }

    /// Sync cycle period.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Peer time-to-live.
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_ttl_secs)
    }

    /// Outbound dial deadline.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Per-chunk response deadline.
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Announcement jitter upper bound.
    pub fn announce_jitter(&self) -> Duration {
        Duration::from_secs(self.announce_jitter_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.network_id, "mainnet");
        assert_eq!(cfg.sync_interval_secs, 30);
        assert_eq!(cfg.peer_ttl_secs, 600);
        assert_eq!(cfg.max_requests_per_minute, 100);
        assert!(cfg.enable_dht);
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = toml::from_str::<NodeConfig>("flux_capacitor = true");
        assert!(err.is_err());
    }
}
