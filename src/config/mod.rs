mod file_config;

pub use file_config::{FileConfig, HeuristicConfig, PollerConfig, StoreConfig};

use crate::job_store::JOB_DB_FILE_NAME;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub remote_url: Option<String>,
    pub remote_timeout_sec: u64,
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub remote_url: String,
    pub remote_timeout_sec: u64,
    pub owner_id: Option<String>,

    pub poller: PollerSettings,
    pub heuristic: HeuristicSettings,
    pub store: StoreSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let remote_url = file
            .remote_url
            .or_else(|| cli.remote_url.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("remote_url must be specified via --remote-url or in config file")
            })?;

        let remote_timeout_sec = file.remote_timeout_sec.unwrap_or(cli.remote_timeout_sec);
        if remote_timeout_sec == 0 {
            bail!("remote_timeout_sec must be greater than zero");
        }

        let owner_id = file.owner_id.or_else(|| cli.owner_id.clone());

        let poller_file = file.poller.unwrap_or_default();
        let poller_defaults = PollerSettings::default();
        let poller = PollerSettings {
            tick_interval_ms: poller_file
                .tick_interval_ms
                .unwrap_or(poller_defaults.tick_interval_ms),
            max_consecutive_failures: poller_file
                .max_consecutive_failures
                .unwrap_or(poller_defaults.max_consecutive_failures),
        };
        if poller.tick_interval_ms == 0 {
            bail!("poller.tick_interval_ms must be greater than zero");
        }

        let heuristic_file = file.heuristic.unwrap_or_default();
        let heuristic_defaults = HeuristicSettings::default();
        let heuristic = HeuristicSettings {
            grace_secs: heuristic_file
                .grace_secs
                .unwrap_or(heuristic_defaults.grace_secs),
            recent_change_secs: heuristic_file
                .recent_change_secs
                .unwrap_or(heuristic_defaults.recent_change_secs),
            silence_secs: heuristic_file
                .silence_secs
                .unwrap_or(heuristic_defaults.silence_secs),
            check_interval_secs: heuristic_file
                .check_interval_secs
                .unwrap_or(heuristic_defaults.check_interval_secs),
            active_patterns: heuristic_file
                .active_patterns
                .unwrap_or(heuristic_defaults.active_patterns),
        };
        if heuristic.check_interval_secs == 0 || heuristic.silence_secs == 0 {
            bail!("heuristic.check_interval_secs and heuristic.silence_secs must be greater than zero");
        }

        let store = StoreSettings {
            stale_job_hours: file
                .store
                .unwrap_or_default()
                .stale_job_hours
                .unwrap_or(StoreSettings::default().stale_job_hours),
        };

        Ok(Self {
            db_dir,
            remote_url,
            remote_timeout_sec,
            owner_id,
            poller,
            heuristic,
            store,
        })
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.db_dir.join(JOB_DB_FILE_NAME)
    }
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub tick_interval_ms: u64,
    /// Consecutive transient status failures tolerated before the listener is told.
    pub max_consecutive_failures: u32,
}

impl PollerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_consecutive_failures: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeuristicSettings {
    pub grace_secs: u64,
    pub recent_change_secs: u64,
    pub silence_secs: u64,
    pub check_interval_secs: u64,
    pub active_patterns: Vec<String>,
}

impl Default for HeuristicSettings {
    fn default() -> Self {
        Self {
            grace_secs: 30,
            recent_change_secs: 45,
            silence_secs: 120,
            check_interval_secs: 30,
            active_patterns: vec![
                r"(?i)\bclos(e|es|ing)\b.*\bbrowser\b".to_string(),
                r"(?i)\bbrowser\b.*\bclos(e|es|ing)\b".to_string(),
                r"(?i)\bfill(s|ing)?\b.*\bform\b".to_string(),
                r"(?i)\bfuel[\s_-]*grades?\b".to_string(),
                r"(?i)\bnavigat(e|es|ing|ion)\b".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Terminal jobs that ended longer ago than this are pruned on load.
    pub stale_job_hours: u64,
}

impl StoreSettings {
    /// Staleness window in seconds, clamped to `i64::MAX`.
    pub fn stale_after_secs(&self) -> i64 {
        i64::try_from(self.stale_job_hours.saturating_mul(3600)).unwrap_or(i64::MAX)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            stale_job_hours: 24,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    fn cli_with_dir(temp_dir: &TempDir) -> CliConfig {
        CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            remote_url: Some("http://automation:8000".to_string()),
            remote_timeout_sec: 30,
            owner_id: None,
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            owner_id: Some("operator-1".to_string()),
            remote_timeout_sec: 12,
            ..cli_with_dir(&temp_dir)
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.remote_url, "http://automation:8000");
        assert_eq!(config.remote_timeout_sec, 12);
        assert_eq!(config.owner_id.as_deref(), Some("operator-1"));
        assert_eq!(config.poller.tick_interval_ms, 1000);
        assert_eq!(config.poller.max_consecutive_failures, 30);
        assert_eq!(config.heuristic.silence_secs, 120);
        assert_eq!(config.store.stale_job_hours, 24);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            remote_url: Some("http://cli:1".to_string()),
            remote_timeout_sec: 30,
            owner_id: Some("cli-owner".to_string()),
        };

        let file_config: FileConfig = toml::from_str(&format!(
            r#"
            db_dir = "{}"
            remote_url = "http://toml:2"

            [poller]
            tick_interval_ms = 250

            [heuristic]
            silence_secs = 90
            active_patterns = ["(?i)closing browser"]

            [store]
            stale_job_hours = 48
            "#,
            temp_dir.path().display()
        ))
        .unwrap();

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.remote_url, "http://toml:2");
        assert_eq!(config.poller.tick_interval_ms, 250);
        assert_eq!(config.heuristic.silence_secs, 90);
        assert_eq!(config.heuristic.active_patterns, vec!["(?i)closing browser"]);
        assert_eq!(config.store.stale_job_hours, 48);
        // CLI or default value used when TOML doesn't specify
        assert_eq!(config.remote_timeout_sec, 30);
        assert_eq!(config.owner_id.as_deref(), Some("cli-owner"));
        assert_eq!(config.poller.max_consecutive_failures, 30);
        assert_eq!(config.heuristic.grace_secs, 30);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve(&cli, None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_missing_remote_url_error() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            remote_url: None,
            ..cli_with_dir(&temp_dir)
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("remote_url must be specified"));
    }

    #[test]
    fn test_resolve_rejects_zero_tick() {
        let temp_dir = make_temp_db_dir();
        let file_config = FileConfig {
            poller: Some(PollerConfig {
                tick_interval_ms: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli_with_dir(&temp_dir), Some(file_config));
        assert!(result.unwrap_err().to_string().contains("tick_interval_ms"));
    }

    #[test]
    fn test_db_path_helper() {
        let temp_dir = make_temp_db_dir();
        let config = AppConfig::resolve(&cli_with_dir(&temp_dir), None).unwrap();
        assert_eq!(config.jobs_db_path(), temp_dir.path().join("jobs.db"));
    }

    #[test]
    fn test_stale_after_secs() {
        assert_eq!(StoreSettings::default().stale_after_secs(), 24 * 3600);
    }

    #[test]
    fn test_stale_after_secs_saturates() {
        let settings = StoreSettings {
            stale_job_hours: u64::MAX,
        };
        assert_eq!(settings.stale_after_secs(), i64::MAX);

        let settings = StoreSettings {
            stale_job_hours: u64::MAX / 3600,
        };
        assert_eq!(settings.stale_after_secs(), i64::MAX);
    }
}
