//! Process configuration from the environment and the `sources.yaml` registry.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use recon_adapters::AdapterSpec;
use recon_core::{RuleSet, SourceClock, DEFAULT_ERROR_CAP};
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Postgres target. Required for anything but dry runs.
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub max_error_messages: usize,
    pub db_connect_timeout_secs: u64,
    pub history_limit: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("RECON_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            state_dir: std::env::var("RECON_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("state")),
            reports_dir: std::env::var("RECON_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("reports")),
            user_agent: std::env::var("RECON_USER_AGENT")
                .unwrap_or_else(|_| "recon-bot/0.1".to_string()),
            http_timeout_secs: env_parse("RECON_HTTP_TIMEOUT_SECS", 30),
            scheduler_enabled: std::env::var("RECON_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("RECON_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            max_error_messages: env_parse("RECON_MAX_ERROR_MESSAGES", DEFAULT_ERROR_CAP),
            db_connect_timeout_secs: env_parse("RECON_DB_CONNECT_TIMEOUT_SECS", 30),
            history_limit: env_parse("RECON_HISTORY_LIMIT", 90),
            workspace_root,
        }
    }

    /// Defaults rooted at `root`, ignoring the environment. Used by tests.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            database_url: None,
            state_dir: root.join("state"),
            reports_dir: root.join("reports"),
            user_agent: "recon-bot/0.1".to_string(),
            http_timeout_secs: 30,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            max_error_messages: DEFAULT_ERROR_CAP,
            db_connect_timeout_secs: 30,
            history_limit: 90,
            workspace_root: root,
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.db_connect_timeout_secs)
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is not set (use --dry-run to sync without a database)")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    File,
    Postgres,
}

/// Which records are written on each run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistMode {
    /// Every current record; the upsert refreshes unchanged rows too.
    #[default]
    All,
    /// New records and still-active records whose fields changed.
    Changed,
}

/// What to do with a record whose timestamp matches no known format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTimestampPolicy {
    /// Persist with a null timestamp, unless the timestamp is part of the natural key.
    #[default]
    Flag,
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// IANA zone for offset-naive timestamps. Required: sources are never assumed UTC.
    pub timezone: String,
    #[serde(default)]
    pub state: StateBackend,
    #[serde(default)]
    pub persist: PersistMode,
    #[serde(default)]
    pub unknown_timestamp: UnknownTimestampPolicy,
    /// Health threshold: fewer persisted records than this raises a problem.
    #[serde(default)]
    pub min_records: Option<usize>,
    /// Extra validation rules layered over the adapter's defaults.
    #[serde(default)]
    pub rules: Option<RuleSet>,
    #[serde(flatten)]
    pub adapter: AdapterSpec,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn clock(&self) -> Result<SourceClock> {
        SourceClock::parse(&self.timezone)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("source {} has an invalid timezone", self.source_id))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        let mut seen = BTreeSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("source_id `{}` is listed twice", source.source_id);
            }
            source.clock()?;
        }
        Ok(registry)
    }

    /// Enabled sources, or exactly the requested ones (enabled or not) when `only` is
    /// non-empty. Unknown ids are an error.
    pub fn select(&self, only: &[String]) -> Result<Vec<SourceConfig>> {
        if only.is_empty() {
            return Ok(self.sources.iter().filter(|s| s.enabled).cloned().collect());
        }
        only.iter()
            .map(|id| {
                self.sources
                    .iter()
                    .find(|s| &s.source_id == id)
                    .cloned()
                    .with_context(|| format!("no source `{id}` in the registry"))
            })
            .collect()
    }
}
