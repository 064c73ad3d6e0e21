use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub remote_url: Option<String>,
    pub remote_timeout_sec: Option<u64>,
    pub owner_id: Option<String>,

    // Component configs
    pub poller: Option<PollerConfig>,
    pub heuristic: Option<HeuristicConfig>,
    pub store: Option<StoreConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PollerConfig {
    pub tick_interval_ms: Option<u64>,
    pub max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct HeuristicConfig {
    pub grace_secs: Option<u64>,
    pub recent_change_secs: Option<u64>,
    pub silence_secs: Option<u64>,
    pub check_interval_secs: Option<u64>,
    /// Regular expressions; replaces the built-in list when present.
    pub active_patterns: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub stale_job_hours: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
