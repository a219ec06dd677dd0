//! Process-level settings from the environment and scrape settings from YAML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use jobwatch_core::{BackoffPolicy, SourceKind, SourceSpec};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Listing pages per source and tuple; the public listing stops serving
/// results well before this.
pub const MAX_SOURCE_PAGES: u32 = 40;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("`{0}` must list at least one entry")]
    EmptyList(&'static str),
    #[error("no sources configured")]
    NoSources,
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    #[error("`{0}` must not be negative")]
    Negative(&'static str),
    #[error("source `{source_name}` asks for {pages} pages; the limit is {}", MAX_SOURCE_PAGES)]
    TooManyPages { source_name: String, pages: u32 },
    #[error("jitter_min_secs ({min}) is greater than jitter_max_secs ({max})")]
    InvertedJitter { min: u64, max: u64 },
    #[error("source `{0}` is a command source without a command")]
    MissingCommand(String),
    #[error("source `{0}` is a fixture source without a fixture_path")]
    MissingFixturePath(String),
    #[error("source `{0}` is a command source and needs process isolation")]
    CommandNeedsProcess(String),
    #[error("source name `{0}` is used twice")]
    DuplicateSource(String),
    #[error("invalid value `{value}` for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Where and when to run; read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub config_path: PathBuf,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    /// Worker executable; `None` means the current executable.
    pub worker_program: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("JOBWATCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/jobwatch.db")),
            config_path: std::env::var("JOBWATCH_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/config_scraper.yaml")),
            reports_dir: std::env::var("JOBWATCH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            scheduler_enabled: std::env::var("JOBWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("JOBWATCH_SYNC_CRON_1")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            sync_cron_2: std::env::var("JOBWATCH_SYNC_CRON_2")
                .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
            worker_program: std::env::var("JOBWATCH_WORKER_PROGRAM").ok().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Each source call runs in a child process that is killed on timeout.
    #[default]
    Process,
    /// Each source call runs as a tokio task that is aborted on timeout.
    Task,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub max_retries: usize,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 30,
            max_delay_secs: 300,
        }
    }
}

impl ThrottleConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.base_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
        }
    }
}

/// Contents of `config_scraper.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub roles: Vec<String>,
    pub functions: Vec<String>,
    pub locations: Vec<String>,
    pub sources: Vec<SourceSpec>,
    pub source_timeout_secs: u64,
    pub max_run_duration_secs: u64,
    pub jitter_min_secs: u64,
    pub jitter_max_secs: u64,
    pub new_to_active_days: i64,
    pub staleness_window_days: i64,
    pub results_wanted: u32,
    pub hours_old: u32,
    pub max_parallel_sources: usize,
    pub flush_retries: usize,
    pub isolation: IsolationMode,
    pub throttle: ThrottleConfig,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            roles: Vec::new(),
            functions: vec![String::new()],
            locations: Vec::new(),
            sources: Vec::new(),
            source_timeout_secs: 180,
            max_run_duration_secs: 4 * 60 * 60,
            jitter_min_secs: 3,
            jitter_max_secs: 6,
            new_to_active_days: 5,
            staleness_window_days: 3,
            results_wanted: 20,
            hours_old: 72,
            max_parallel_sources: 1,
            flush_retries: 1,
            isolation: IsolationMode::Process,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl ScrapeConfig {
    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Reads, applies environment overrides and validates.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let mut config = Self::from_yaml_str(&text, path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(secs) = env_u64("JOBWATCH_SOURCE_TIMEOUT_SECS")? {
            self.source_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("JOBWATCH_MAX_RUN_SECS")? {
            self.max_run_duration_secs = secs;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.roles.iter().all(|r| r.trim().is_empty()) {
            return Err(ConfigError::EmptyList("roles"));
        }
        if self.functions.is_empty() {
            return Err(ConfigError::EmptyList("functions"));
        }
        if self.locations.iter().all(|l| l.trim().is_empty()) {
            return Err(ConfigError::EmptyList("locations"));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if self.source_timeout_secs == 0 {
            return Err(ConfigError::Zero("source_timeout_secs"));
        }
        if self.max_parallel_sources == 0 {
            return Err(ConfigError::Zero("max_parallel_sources"));
        }
        if self.new_to_active_days < 0 {
            return Err(ConfigError::Negative("new_to_active_days"));
        }
        if self.staleness_window_days < 0 {
            return Err(ConfigError::Negative("staleness_window_days"));
        }
        if self.jitter_min_secs > self.jitter_max_secs {
            return Err(ConfigError::InvertedJitter {
                min: self.jitter_min_secs,
                max: self.jitter_max_secs,
            });
        }

        let mut seen = std::collections::BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
            if source.pages > MAX_SOURCE_PAGES {
                return Err(ConfigError::TooManyPages {
                    source_name: source.name.clone(),
                    pages: source.pages,
                });
            }
            match source.kind {
                SourceKind::Command if source.command.is_empty() => {
                    return Err(ConfigError::MissingCommand(source.name.clone()))
                }
                SourceKind::Command if self.isolation == IsolationMode::Task => {
                    return Err(ConfigError::CommandNeedsProcess(source.name.clone()))
                }
                SourceKind::Fixture if source.fixture_path.is_none() => {
                    return Err(ConfigError::MissingFixturePath(source.name.clone()))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn env_u64(key: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
        Err(_) => Ok(None),
    }
}
