use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::codec::key::DEFAULT_IGNORED_HEADERS;
use crate::constants::{DEFAULT_ADDR, DEFAULT_GROUP_NAME, DEFAULT_MAX_BODY_BYTES};
use crate::group::GroupOptions;
use crate::origin::{OriginOptions, DEFAULT_ORIGIN_TIMEOUT};
use crate::peer::DEFAULT_PEER_TIMEOUT;
use crate::ring::{PeerSet, DEFAULT_REPLICAS};
use crate::store::DEFAULT_CAPACITY_BYTES;
use crate::stream::DEFAULT_FLUSH_INTERVAL;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub peers: Peers,
    #[serde(default)]
    pub cache: Cache,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        let host = self.origin.host.trim();
        if host.is_empty() {
            return Err(anyhow!("origin.host is required"));
        }
        if host.contains("://") && !host.starts_with("http://") {
            return Err(anyhow!("origin.host {host:?}: only plain http origins are supported"));
        }
        let group = &self.cache.group;
        if group.is_empty() || !group.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
            return Err(anyhow!("cache.group {group:?} must be non-empty and made of [A-Za-z0-9_.-]"));
        }
        if self.cache.capacity_bytes == 0 {
            return Err(anyhow!("cache.capacity_bytes must be positive"));
        }
        if self.peers.replicas == 0 {
            return Err(anyhow!("peers.replicas must be positive"));
        }
        if !self.peers.addresses.is_empty() && self.self_addr().is_empty() {
            return Err(anyhow!("peers.self_addr is required when peers are configured"));
        }
        Ok(())
    }

    /// This process's peer address: `peers.self_addr`, else the first peer.
    pub fn self_addr(&self) -> String {
        let explicit = self.peers.self_addr.trim();
        if !explicit.is_empty() {
            return explicit.to_string();
        }
        self.peers
            .addresses
            .iter()
            .map(|addr| addr.trim())
            .find(|addr| !addr.is_empty())
            .unwrap_or("")
            .to_string()
    }

    pub fn peer_set(&self) -> PeerSet {
        PeerSet::new(&self.self_addr(), &self.peers.addresses)
    }

    pub fn origin_options(&self) -> OriginOptions {
        OriginOptions {
            host: self.origin.host.clone(),
            timeout: self.origin.timeout,
            max_idle_conns_per_host: self.origin.max_idle_conns_per_host,
            max_connections: self.origin.max_connections,
        }
    }

    pub fn group_options(&self) -> GroupOptions {
        GroupOptions {
            name: self.cache.group.clone(),
            capacity_bytes: self.cache.capacity_bytes,
            replicas: self.peers.replicas,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Logger {
    pub level: String,
    pub path: String,
    pub caller: bool,
    pub traceid: bool,
    pub nopid: bool,
    /// Rotate the log file past this many MiB; 0 disables rotation.
    pub max_size: u64,
    pub max_backups: u64,
}

impl Default for Logger {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            path: String::new(),
            caller: false,
            traceid: true,
            nopid: false,
            max_size: 0,
            max_backups: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Server {
    pub addr: String,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    pub max_body_bytes: usize,
    pub access_log: Option<ServerAccessLog>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            access_log: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerAccessLog {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Origin {
    pub host: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_idle_conns_per_host: usize,
    /// Concurrent origin requests; 0 is unlimited.
    pub max_connections: usize,
}

impl Default for Origin {
    fn default() -> Self {
        Self {
            host: "localhost:8000".to_string(),
            timeout: DEFAULT_ORIGIN_TIMEOUT,
            max_idle_conns_per_host: 0,
            max_connections: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Peers {
    pub self_addr: String,
    pub addresses: Vec<String>,
    pub replicas: usize,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for Peers {
    fn default() -> Self {
        Self {
            self_addr: String::new(),
            addresses: Vec::new(),
            replicas: DEFAULT_REPLICAS,
            timeout: DEFAULT_PEER_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Cache {
    pub group: String,
    pub capacity_bytes: u64,
    /// Request headers left out of the cache key.
    pub ignore_headers: Vec<String>,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP_NAME.to_string(),
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            ignore_headers: DEFAULT_IGNORED_HEADERS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse(&raw).with_context(|| format!("parse config {}", path.display()))
}

/// Parses YAML, returning the config and the paths of unknown keys.
pub fn parse(raw: &str) -> Result<(Bootstrap, Vec<String>)> {
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })?;
    Ok((cfg, ignored))
}
