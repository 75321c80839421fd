//! Parquet export of known state, one file per source plus a checksummed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use recon_core::KnownStateEntry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub source_id: String,
    /// Relative to the export directory.
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
    pub active_rows: usize,
}

/// Writes `known_state_<source_id>.parquet` for each source into `out_dir`, then
/// `manifest.json`. Returns the manifest path.
pub async fn export_known_state(
    out_dir: &Path,
    sources: &[(String, Vec<KnownStateEntry>)],
) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let mut files = Vec::with_capacity(sources.len());
    for (source_id, entries) in sources {
        let path = out_dir.join(format!("known_state_{source_id}.parquet"));
        write_known_state_parquet(&path, source_id, entries)?;
        let active = entries.iter().filter(|e| e.is_active).count();
        files.push(manifest_entry(source_id, out_dir, &path, entries.len(), active)?);
        info!(source_id = %source_id, rows = entries.len(), active, "exported known state");
    }

    let manifest = ExportManifest {
        schema_version: SCHEMA_VERSION,
        exported_at: Utc::now(),
        files,
    };
    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_known_state_parquet(path: &Path, source_id: &str, entries: &[KnownStateEntry]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("natural_key", DataType::Utf8, false),
        ArrowField::new("first_seen_at", DataType::Utf8, false),
        ArrowField::new("last_seen_at", DataType::Utf8, false),
        ArrowField::new("is_active", DataType::Boolean, false),
        ArrowField::new("content_hash", DataType::Utf8, true),
        ArrowField::new("enriched_at", DataType::Utf8, true),
        ArrowField::new("fields_json", DataType::Utf8, true),
    ]));

    let fields_json = entries
        .iter()
        .map(|e| e.fields.as_ref().map(serde_json::to_string).transpose())
        .collect::<Result<Vec<_>, _>>()
        .context("serializing cached fields")?;

    let source_ids = StringArray::from(vec![Some(source_id); entries.len()]);
    let keys = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.key.as_str()))
            .collect::<Vec<_>>(),
    );
    let first_seen = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.first_seen_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let last_seen = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.last_seen_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let active = BooleanArray::from(entries.iter().map(|e| e.is_active).collect::<Vec<_>>());
    let hashes = StringArray::from(
        entries
            .iter()
            .map(|e| e.content_hash.as_deref())
            .collect::<Vec<_>>(),
    );
    let enriched = StringArray::from(
        entries
            .iter()
            .map(|e| e.enriched_at.map(|ts| ts.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let fields = StringArray::from(fields_json);

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(keys),
            Arc::new(first_seen),
            Arc::new(last_seen),
            Arc::new(active),
            Arc::new(hashes),
            Arc::new(enriched),
            Arc::new(fields),
        ],
    )
    .with_context(|| format!("building known state record batch for {source_id}"))?;
    write_parquet(path, batch)
}

fn manifest_entry(
    source_id: &str,
    out_dir: &Path,
    path: &Path,
    rows: usize,
    active_rows: usize,
) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(out_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ExportManifestFile {
        source_id: source_id.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
        active_rows,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use recon_core::{FieldValue, Fields, NaturalKey};
    use tempfile::tempdir;

    use super::*;

    fn entries() -> Vec<KnownStateEntry> {
        let at = Utc.with_ymd_and_hms(2025, 6, 15, 6, 0, 0).unwrap();
        let mut a = KnownStateEntry::first_seen(NaturalKey::new("A"), at);
        let mut fields = Fields::new();
        fields.insert("price".into(), FieldValue::Number(10.0));
        a.remember_fields(fields);
        let mut b = KnownStateEntry::first_seen(NaturalKey::new("B"), at);
        b.expire();
        vec![a, b]
    }

    #[tokio::test]
    async fn writes_parquet_and_a_checksummed_manifest() {
        let dir = tempdir().unwrap();
        let manifest_path = export_known_state(dir.path(), &[("fx".into(), entries())])
            .await
            .unwrap();

        let manifest: ExportManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.schema_version, SCHEMA_VERSION);
        assert_eq!(manifest.files.len(), 1);
        let file = &manifest.files[0];
        assert_eq!(file.path, "known_state_fx.parquet");
        assert_eq!((file.rows, file.active_rows), (2, 1));

        let bytes = std::fs::read(dir.path().join(&file.path)).unwrap();
        assert_eq!(file.bytes, bytes.len() as u64);
        assert_eq!(file.sha256, hex::encode(Sha256::digest(&bytes)));

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(dir.path().join(&file.path)).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn empty_sources_still_get_a_file() {
        let dir = tempdir().unwrap();
        let manifest_path = export_known_state(dir.path(), &[("weather".into(), Vec::new())])
            .await
            .unwrap();
        let manifest: ExportManifest =
            serde_json::from_slice(&std::fs::read(manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.files[0].rows, 0);
        assert!(dir.path().join("known_state_weather.parquet").exists());
    }
}
