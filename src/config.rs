//! Layered configuration for phasequeue.
//!
//! Settings are read from `.phasequeue/phasequeue.toml`, then overridden by
//! environment variables, then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [queue]
//! max_chain_length = 20
//! db_path = ".phasequeue/queue.db"
//!
//! [coordinator]
//! poll_interval_secs = 10
//! provider_timeout_secs = 30
//! notify_timeout_secs = 15
//!
//! [provider]
//! base_url = "http://localhost:7233/api"
//!
//! [github]
//! repo = "acme/widgets"
//! token_env = "GITHUB_TOKEN"
//! api_base = "https://api.github.com"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 3142
//!
//! [logging]
//! level = "info"
//! json = false
//! dir = ".phasequeue/logs"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::coordinator::CoordinatorConfig;
use crate::queue::github::{self, DEFAULT_API_BASE};
use crate::queue::store::DEFAULT_MAX_CHAIN_LENGTH;

pub const CONFIG_DIR: &str = ".phasequeue";
pub const CONFIG_FILE: &str = "phasequeue.toml";

pub const ENV_DB_PATH: &str = "PHASEQUEUE_DB_PATH";
pub const ENV_POLL_INTERVAL: &str = "PHASEQUEUE_POLL_INTERVAL_SECS";
pub const ENV_PROVIDER_URL: &str = "PHASEQUEUE_PROVIDER_URL";
pub const ENV_GITHUB_REPO: &str = "PHASEQUEUE_GITHUB_REPO";
pub const ENV_PORT: &str = "PHASEQUEUE_PORT";

/// Queue storage and chain limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Upper bound on phases per group
    #[serde(default = "default_max_chain_length")]
    pub max_chain_length: usize,
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_max_chain_length() -> usize {
    DEFAULT_MAX_CHAIN_LENGTH
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("queue.db")
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_chain_length: default_max_chain_length(),
            db_path: default_db_path(),
        }
    }
}

/// Reconciliation loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_notify_timeout_secs")]
    pub notify_timeout_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_provider_timeout_secs() -> u64 {
    30
}

fn default_notify_timeout_secs() -> u64 {
    15
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            provider_timeout_secs: default_provider_timeout_secs(),
            notify_timeout_secs: default_notify_timeout_secs(),
        }
    }
}

impl CoordinatorSection {
    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            // A zero interval would spin; clamp to one second.
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            provider_timeout: Duration::from_secs(self.provider_timeout_secs.max(1)),
            notify_timeout: Duration::from_secs(self.notify_timeout_secs.max(1)),
        }
    }
}

/// Workflow-history service the coordinator polls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// GitHub issue-comment notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSection {
    /// `owner/repo`; notifications are only logged when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Name of the environment variable holding the token
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            repo: None,
            token_env: default_token_env(),
            api_base: default_api_base(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a locally served UI
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3142
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Daily rolling log files are written here when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

/// The complete phasequeue.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseQueueToml {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PhaseQueueToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse phasequeue.toml")
    }

    /// Returns the defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize phasequeue.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `PHASEQUEUE_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DB_PATH).filter(|v| !v.is_empty()) {
            self.queue.db_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(ENV_POLL_INTERVAL) {
            self.coordinator.poll_interval_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a whole number of seconds", ENV_POLL_INTERVAL))?;
        }
        if let Some(url) = lookup(ENV_PROVIDER_URL).filter(|v| !v.is_empty()) {
            self.provider.base_url = Some(url);
        }
        if let Some(repo) = lookup(ENV_GITHUB_REPO).filter(|v| !v.is_empty()) {
            self.github.repo = Some(repo);
        }
        if let Some(raw) = lookup(ENV_PORT) {
            self.server.port = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a port number", ENV_PORT))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.queue.max_chain_length == 0 {
            warnings.push("queue.max_chain_length is 0; every enqueue will be rejected".into());
        }
        if self.coordinator.poll_interval_secs == 0 {
            warnings.push("coordinator.poll_interval_secs is 0; using 1 second".into());
        }
        if self.coordinator.provider_timeout_secs >= self.coordinator.poll_interval_secs.max(1) * 10
        {
            warnings.push(format!(
                "coordinator.provider_timeout_secs ({}) is much longer than the poll interval ({})",
                self.coordinator.provider_timeout_secs, self.coordinator.poll_interval_secs
            ));
        }
        match self.provider.base_url.as_deref() {
            None => warnings.push(
                "provider.base_url is not set; `serve` and `reconcile` need a status provider"
                    .into(),
            ),
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => warnings
                .push(format!(
                    "provider.base_url '{}' should start with http:// or https://",
                    url
                )),
            Some(_) => {}
        }
        if let Some(repo) = self.github.repo.as_deref()
            && github::parse_owner_repo(repo).is_none()
        {
            warnings.push(format!(
                "github.repo '{}' is not an owner/repo slug or GitHub URL",
                repo
            ));
        }
        if self.server.port == 0 {
            warnings.push("server.port is 0; the OS will pick a port".into());
        }

        warnings
    }
}

/// Runtime configuration: file, then environment, then CLI flags.
#[derive(Debug, Clone)]
pub struct PhaseQueueConfig {
    /// File the settings were read from (may not exist)
    pub config_path: PathBuf,
    pub toml: PhaseQueueToml,
    pub verbose: bool,
}

impl PhaseQueueConfig {
    pub fn default_path() -> PathBuf {
        PathBuf::from(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load from `config_path` (or the default location) and the process environment.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        Self::load_with_env(config_path, |key| std::env::var(key).ok())
    }

    pub fn load_with_env<F>(config_path: Option<PathBuf>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_path = config_path.unwrap_or_else(Self::default_path);
        let mut toml = PhaseQueueToml::load_or_default(&config_path)?;
        toml.apply_env(lookup)?;
        Ok(Self {
            config_path,
            toml,
            verbose: false,
        })
    }

    /// Apply CLI flags on top of file and environment.
    pub fn with_cli_args(mut self, db_path: Option<PathBuf>, verbose: bool) -> Self {
        if let Some(db) = db_path {
            self.toml.queue.db_path = db;
        }
        self.verbose = verbose;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.toml.queue.db_path
    }

    pub fn max_chain_length(&self) -> usize {
        self.toml.queue.max_chain_length
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        self.toml.coordinator.to_coordinator_config()
    }

    pub fn provider_url(&self) -> Option<&str> {
        self.toml.provider.base_url.as_deref()
    }

    /// GitHub token from the configured environment variable, if present.
    pub fn github_token(&self) -> Option<String> {
        std::env::var(&self.toml.github.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }

    /// Logging settings with `-v` raising the default level to debug.
    pub fn logging(&self) -> LoggingConfig {
        let mut logging = self.toml.logging.clone();
        if self.verbose {
            logging.level = "debug".to_string();
        }
        logging
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        if self.toml.github.repo.is_some() {
            match self.github_token() {
                None => warnings.push(format!(
                    "github.repo is set but ${} is empty; notifications will only be logged",
                    self.toml.github.token_env
                )),
                Some(token) if !github::is_valid_github_token(&token) => warnings.push(format!(
                    "${} does not look like a GitHub token",
                    self.toml.github.token_env
                )),
                Some(_) => {}
            }
        }
        warnings
    }
}

/// Write a default config file, refusing to overwrite an existing one.
pub fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("Config file already exists: {}", path.display());
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    PhaseQueueToml::default().save(path)
}
