//! Known-state store backed by one JSON file per source.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use recon_core::{KnownStateEntry, KnownStateStore, NaturalKey, StoreError};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    source_id: String,
    entries: Vec<KnownStateEntry>,
}

/// Every write rewrites the file through a temp file and a rename, so a crash leaves
/// either the previous or the new state on disk.
#[derive(Debug)]
pub struct FileStateStore {
    source_id: String,
    path: PathBuf,
    cache: Mutex<Option<BTreeMap<NaturalKey, KnownStateEntry>>>,
}

impl FileStateStore {
    pub fn new(state_dir: impl AsRef<Path>, source_id: impl Into<String>) -> Self {
        let source_id = source_id.into();
        let path = state_dir.as_ref().join(format!("{source_id}.json"));
        Self {
            source_id,
            path,
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_from_disk(&self) -> Result<BTreeMap<NaturalKey, KnownStateEntry>, StoreError> {
        let io_error = |err: std::io::Error| {
            StoreError::Io(format!("reading state file {}: {err}", self.path.display()))
        };
        if !fs::try_exists(&self.path).await.map_err(io_error)? {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(&self.path).await.map_err(io_error)?;
        let file: StateFile = serde_json::from_slice(&bytes).map_err(|err| {
            StoreError::Corrupt(format!("parsing state file {}: {err}", self.path.display()))
        })?;
        if file.version != STATE_FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "state file {} has version {}, expected {}",
                self.path.display(),
                file.version,
                STATE_FORMAT_VERSION
            )));
        }
        Ok(file
            .entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect())
    }

    async fn write_to_disk(
        &self,
        entries: &BTreeMap<NaturalKey, KnownStateEntry>,
    ) -> anyhow::Result<()> {
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating state directory {}", parent.display()))?;

        let file = StateFile {
            version: STATE_FORMAT_VERSION,
            source_id: self.source_id.clone(),
            entries: entries.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("encoding state file")?;

        let temp_path = parent.join(format!(".{}.{}.tmp", self.source_id, Uuid::new_v4()));
        let mut handle = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        handle
            .write_all(&bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        handle
            .sync_all()
            .await
            .with_context(|| format!("syncing temp state file {}", temp_path.display()))?;
        drop(handle);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("replacing state file {}", self.path.display()));
        }
        Ok(())
    }

    async fn with_cache<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<NaturalKey, KnownStateEntry>) -> T,
    ) -> Result<T, StoreError> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_from_disk().await?);
        }
        Ok(f(guard.get_or_insert_with(BTreeMap::new)))
    }
}

#[async_trait]
impl KnownStateStore for FileStateStore {
    async fn load_all_active(&self) -> Result<BTreeSet<NaturalKey>, StoreError> {
        self.with_cache(|entries| {
            entries
                .values()
                .filter(|e| e.is_active)
                .map(|e| e.key.clone())
                .collect()
        })
        .await
    }

    async fn get(&self, key: &NaturalKey) -> Result<Option<KnownStateEntry>, StoreError> {
        self.with_cache(|entries| entries.get(key).cloned()).await
    }

    async fn upsert_entries(&self, batch: &[KnownStateEntry]) -> Result<(), StoreError> {
        let mut guard = self.cache.lock().await;
        let mut next = match guard.as_ref() {
            Some(entries) => entries.clone(),
            None => self.read_from_disk().await?,
        };
        for entry in batch {
            next.insert(entry.key.clone(), entry.clone());
        }
        self.write_to_disk(&next)
            .await
            .map_err(|err| StoreError::Io(format!("{err:#}")))?;
        *guard = Some(next);
        Ok(())
    }

    async fn all_entries(&self) -> Result<Vec<KnownStateEntry>, StoreError> {
        self.with_cache(|entries| entries.values().cloned().collect())
            .await
    }
}
