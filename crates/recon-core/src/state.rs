//! Per-key lifecycle state carried across runs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::record::{content_hash, Fields, NaturalKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownStateEntry {
    pub key: NaturalKey,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default)]
    pub content_hash: Option<String>,
    /// Cached copy of the last persisted fields, used to fast-path still-active keys
    /// past detail enrichment.
    #[serde(default)]
    pub fields: Option<Fields>,
    /// Set once detail enrichment has succeeded for this key.
    #[serde(default)]
    pub enriched_at: Option<DateTime<Utc>>,
}

impl KnownStateEntry {
    pub fn first_seen(key: NaturalKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            first_seen_at: now,
            last_seen_at: now,
            is_active: true,
            content_hash: None,
            fields: None,
            enriched_at: None,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = now;
        self.is_active = true;
    }

    pub fn expire(&mut self) {
        self.is_active = false;
    }

    pub fn remember_fields(&mut self, fields: Fields) {
        self.content_hash = Some(content_hash(&fields));
        self.fields = Some(fields);
    }

    /// True when the cached fields are missing or differ from `fields`.
    pub fn has_changed(&self, fields: &Fields) -> bool {
        self.content_hash.as_deref() != Some(content_hash(fields).as_str())
    }
}

/// Durable per-source key state. Reads must reflect the latest committed writes of
/// prior runs; `upsert_entries` must be atomic per entry.
#[async_trait]
pub trait KnownStateStore: Send + Sync {
    async fn load_all_active(&self) -> Result<BTreeSet<NaturalKey>, StoreError>;
    async fn get(&self, key: &NaturalKey) -> Result<Option<KnownStateEntry>, StoreError>;
    async fn upsert_entries(&self, entries: &[KnownStateEntry]) -> Result<(), StoreError>;
    /// Every entry, active or expired. Used for reporting and export.
    async fn all_entries(&self) -> Result<Vec<KnownStateEntry>, StoreError>;
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<BTreeMap<NaturalKey, KnownStateEntry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = KnownStateEntry>) -> Self {
        Self {
            entries: Mutex::new(entries.into_iter().map(|e| (e.key.clone(), e)).collect()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl KnownStateStore for MemoryStateStore {
    async fn load_all_active(&self) -> Result<BTreeSet<NaturalKey>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .values()
            .filter(|e| e.is_active)
            .map(|e| e.key.clone())
            .collect())
    }

    async fn get(&self, key: &NaturalKey) -> Result<Option<KnownStateEntry>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn upsert_entries(&self, batch: &[KnownStateEntry]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        for entry in batch {
            entries.insert(entry.key.clone(), entry.clone());
        }
        Ok(())
    }

    async fn all_entries(&self) -> Result<Vec<KnownStateEntry>, StoreError> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;

    #[tokio::test]
    async fn memory_store_reads_its_own_writes() {
        let store = MemoryStateStore::new();
        let now = Utc::now();
        let mut expired = KnownStateEntry::first_seen(NaturalKey::new("a"), now);
        expired.expire();
        let active = KnownStateEntry::first_seen(NaturalKey::new("b"), now);

        store.upsert_entries(&[expired, active]).await.unwrap();

        let keys = store.load_all_active().await.unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec![NaturalKey::new("b")]);
        let a = store.get(&NaturalKey::new("a")).await.unwrap().unwrap();
        assert!(!a.is_active);
        assert_eq!(store.len().await, 2);
    }

    #[test]
    fn change_detection_uses_the_cached_hash() {
        let mut entry = KnownStateEntry::first_seen(NaturalKey::new("k"), Utc::now());
        let mut fields = Fields::new();
        fields.insert("title".into(), FieldValue::text("Rust developer"));
        assert!(entry.has_changed(&fields));

        entry.remember_fields(fields.clone());
        assert!(!entry.has_changed(&fields));

        fields.insert("title".into(), FieldValue::text("Senior Rust developer"));
        assert!(entry.has_changed(&fields));
    }
}
