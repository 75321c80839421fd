//! Snapshots read from a local JSON file. Used for replaying captured sources and in tests.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use recon_core::{Fields, KeySpec, RuleSet};
use recon_storage::{HttpFetcher, TableSpec};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{AdapterError, FetchContext, RecordProfile, Snapshot, SnapshotFetcher};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureSettings {
    /// JSON array of flat objects.
    pub path: PathBuf,
    pub key: KeySpec,
    #[serde(default)]
    pub timestamp_field: Option<String>,
    pub table: TableSpec,
}

#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source_id: String,
    settings: FixtureSettings,
}

impl FixtureAdapter {
    pub fn new(source_id: impl Into<String>, settings: FixtureSettings) -> Self {
        Self {
            source_id: source_id.into(),
            settings,
        }
    }
}

#[async_trait]
impl SnapshotFetcher for FixtureAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn profile(&self) -> RecordProfile {
        RecordProfile {
            key: self.settings.key.clone(),
            // Fixture rules come from the source-level `rules` block.
            rules: RuleSet::default(),
            timestamp_field: self.settings.timestamp_field.clone(),
            table: self.settings.table.clone(),
        }
    }

    async fn fetch_snapshot(
        &self,
        _http: &HttpFetcher,
        _ctx: &FetchContext,
    ) -> Result<Snapshot, AdapterError> {
        let path = &self.settings.path;
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AdapterError::SourceUnavailable(format!(
                    "fixture {} not found",
                    path.display()
                )));
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to read fixture {}", path.display()))
                    .into());
            }
        };
        let records: Vec<Fields> = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse fixture {}", path.display()))?;
        info!(source_id = %self.source_id, records = records.len(), "loaded fixture snapshot");
        Ok(Snapshot::complete(records))
    }
}
