use serde::Serialize;

use crate::group::{CacheGroup, GroupStats};
use crate::store::StoreStats;

#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub commit: &'static str,
    pub build_time: &'static str,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_REV").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown"),
    }
}

/// Served at `/_status/stats`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub group: String,
    #[serde(rename = "self")]
    pub local_peer: String,
    pub peers: Vec<String>,
    pub loads: GroupStats,
    pub store: StoreStats,
}

impl StatusReport {
    pub fn collect(group: &CacheGroup) -> Self {
        Self {
            group: group.name().to_string(),
            local_peer: group.peers().local().to_string(),
            peers: group.peers().all().iter().map(|p| p.to_string()).collect(),
            loads: group.stats(),
            store: group.store_stats(),
        }
    }
}
