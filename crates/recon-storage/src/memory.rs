use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{Fields, NaturalKey, Record};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::writer::{PersistError, UpsertBackend};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub fields: Fields,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

/// Upsert target held in memory, keyed by natural key. Clones share the same rows.
/// Used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    rows: Arc<Mutex<BTreeMap<NaturalKey, StoredRow>>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> BTreeMap<NaturalKey, StoredRow> {
        self.rows.lock().await.clone()
    }

    pub async fn keys(&self) -> BTreeSet<NaturalKey> {
        self.rows.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl UpsertBackend for MemoryTable {
    type Conn = ();

    async fn connect(&self) -> Result<(), PersistError> {
        Ok(())
    }

    async fn upsert_record(&self, _conn: &mut (), record: &Record) -> Result<(), PersistError> {
        let row = StoredRow {
            fields: record.fields.clone(),
            source_timestamp: record.source_timestamp.as_ref().and_then(|ts| ts.known()),
            fetched_at: record.fetch_timestamp,
        };
        self.rows
            .lock()
            .await
            .insert(record.natural_key.clone(), row);
        Ok(())
    }
}
