//! One stream: a single source taken from snapshot to persisted state.
//!
//! Stages run in order `FETCHING → VALIDATING → RECONCILING → ENRICHING → PERSISTING →
//! REPORTED`. Every stage that can fail feeds a [`StreamReport`], and `REPORTED` is always
//! reached. Only an invariant violation marks the stream as a hard failure.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recon_adapters::{BuiltAdapter, DetailEnricher, FetchContext, RecordProfile, SnapshotFetcher};
use recon_core::{
    apply, dedup_snapshot, derive_key, format_utc, normalize_timestamp, reconcile_with_store,
    AppliedTransitions, BatchResult, CoreError, FieldValue, Fields, KnownStateEntry,
    KnownStateStore, NaturalKey, NormalizedTime, Observation, Record, ReconciliationResult,
    SourceClock, StoreError, UploadOutcome, UpsertWriter, Validation,
};
use recon_storage::HttpFetcher;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{PersistMode, SourceConfig, UnknownTimestampPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStage {
    Fetching,
    Validating,
    Reconciling,
    Enriching,
    Persisting,
    Reported,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Fetching => "FETCHING",
            RunStage::Validating => "VALIDATING",
            RunStage::Reconciling => "RECONCILING",
            RunStage::Enriching => "ENRICHING",
            RunStage::Persisting => "PERSISTING",
            RunStage::Reported => "REPORTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StreamStatus {
    Completed,
    /// Part of the source failed. Records were persisted, nothing was expired.
    Partial,
    /// No usable snapshot. Known state was carried forward untouched.
    Unavailable(String),
    /// The known-state store failed.
    Failed(String),
    /// Reconciliation found an impossible state. A bug in keying, not a runtime condition.
    InvariantViolation(String),
}

impl StreamStatus {
    pub fn is_hard_failure(&self) -> bool {
        matches!(self, StreamStatus::InvariantViolation(_))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationCounts {
    pub new: usize,
    pub still_active: usize,
    pub expired: usize,
    /// Expiries skipped because the snapshot was partial.
    pub expiry_withheld: usize,
}

impl ReconciliationCounts {
    fn from_result(result: &ReconciliationResult) -> Self {
        Self {
            new: result.new_count(),
            still_active: result.still_active_count(),
            expired: result.expired_count(),
            expiry_withheld: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentCounts {
    pub enriched: usize,
    pub failed: usize,
    /// Still-active records served from the detail cache.
    pub cached: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    pub source_id: String,
    pub display_name: String,
    pub status: StreamStatus,
    pub stage: RunStage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub valid: usize,
    pub duplicates_merged: usize,
    pub unknown_timestamps: usize,
    pub reconciliation: ReconciliationCounts,
    pub enrichment: EnrichmentCounts,
    /// Still-active records not rewritten because nothing changed.
    pub unchanged_skipped: usize,
    pub transitions: AppliedTransitions,
    /// Validation rejections plus the writer's outcomes.
    pub batch: BatchResult,
    pub warnings: Vec<String>,
}

impl StreamReport {
    fn new(config: &SourceConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            source_id: config.source_id.clone(),
            display_name: config.display_name.clone(),
            status: StreamStatus::Completed,
            stage: RunStage::Fetching,
            started_at,
            finished_at: started_at,
            fetched: 0,
            valid: 0,
            duplicates_merged: 0,
            unknown_timestamps: 0,
            reconciliation: ReconciliationCounts::default(),
            enrichment: EnrichmentCounts::default(),
            unchanged_skipped: 0,
            transitions: AppliedTransitions::default(),
            batch: BatchResult::default(),
            warnings: Vec::new(),
        }
    }

    pub fn persisted(&self) -> usize {
        self.batch.upserted
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// Enrich every current record, not only new ones.
    pub full_refresh: bool,
}

#[derive(Debug, Error)]
enum StreamError {
    #[error("{0}")]
    Unavailable(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<StoreError> for StreamError {
    fn from(err: StoreError) -> Self {
        StreamError::Core(CoreError::Store(err))
    }
}

/// Everything one source needs for a run, built once from configuration.
pub struct SourceRuntime {
    config: SourceConfig,
    clock: SourceClock,
    profile: RecordProfile,
    fetcher: Box<dyn SnapshotFetcher>,
    enricher: Option<Box<dyn DetailEnricher>>,
    store: Arc<dyn KnownStateStore>,
    writer: Arc<dyn UpsertWriter>,
    error_cap: usize,
}

impl SourceRuntime {
    pub fn new(
        config: SourceConfig,
        adapter: BuiltAdapter,
        store: Arc<dyn KnownStateStore>,
        writer: Arc<dyn UpsertWriter>,
        error_cap: usize,
    ) -> anyhow::Result<Self> {
        let clock = config.clock()?;
        let mut profile = adapter.fetcher.profile();
        if let Some(extra) = config.rules.clone() {
            profile.rules.extend(extra);
        }
        Ok(Self {
            config,
            clock,
            profile,
            fetcher: adapter.fetcher,
            enricher: adapter.enricher,
            store,
            writer,
            error_cap,
        })
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn profile(&self) -> &RecordProfile {
        &self.profile
    }

    pub fn store(&self) -> &Arc<dyn KnownStateStore> {
        &self.store
    }

    pub async fn run(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        options: StreamOptions,
    ) -> StreamReport {
        let mut report = StreamReport::new(&self.config, Utc::now());
        let source_id = self.config.source_id.as_str();

        match self.run_stages(http, ctx, options, &mut report).await {
            Ok(()) => {}
            Err(StreamError::Unavailable(reason)) => {
                warn!(source_id, run_id = %ctx.run_id, %reason, "source unavailable; known state carried forward");
                report.status = StreamStatus::Unavailable(reason);
            }
            Err(StreamError::Core(err)) if err.is_invariant_violation() => {
                error!(source_id, run_id = %ctx.run_id, error = %err, stage = %report.stage, "invariant violation");
                report.status = StreamStatus::InvariantViolation(err.to_string());
            }
            Err(StreamError::Core(err)) => {
                warn!(source_id, run_id = %ctx.run_id, error = %err, stage = %report.stage, "stream failed");
                report.status = StreamStatus::Failed(err.to_string());
            }
        }

        self.enter(&mut report, RunStage::Reported);
        report.finished_at = Utc::now();
        info!(
            source_id,
            run_id = %ctx.run_id,
            status = ?report.status,
            attempted = report.batch.attempted,
            upserted = report.batch.upserted,
            rejected = report.batch.rejected,
            errored = report.batch.errored,
            "stream finished"
        );
        report
    }

    fn enter(&self, report: &mut StreamReport, stage: RunStage) {
        debug!(source_id = %self.config.source_id, from = %report.stage, to = %stage, "stage");
        report.stage = stage;
    }

    async fn run_stages(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        options: StreamOptions,
        report: &mut StreamReport,
    ) -> Result<(), StreamError> {
        let snapshot = self
            .fetcher
            .fetch_snapshot(http, ctx)
            .await
            .map_err(|err| StreamError::Unavailable(err.to_string()))?;
        report.fetched = snapshot.records.len();
        report.warnings.extend(snapshot.warnings.iter().cloned());
        if snapshot.records.is_empty() {
            return Err(StreamError::Unavailable("snapshot is empty".into()));
        }
        let complete = snapshot.complete;

        self.enter(report, RunStage::Validating);
        let prepared = self.prepare(snapshot.records, ctx.fetched_at, report);
        let deduped = dedup_snapshot(prepared);
        report.duplicates_merged = deduped.merged_duplicates;
        report.valid = deduped.records.len();
        info!(
            source_id = %self.config.source_id,
            fetched = report.fetched,
            valid = report.valid,
            rejected = report.batch.rejected,
            duplicates = report.duplicates_merged,
            "validated snapshot"
        );
        if deduped.records.is_empty() {
            return Err(StreamError::Unavailable(format!(
                "none of {} records passed validation",
                report.fetched
            )));
        }

        self.enter(report, RunStage::Reconciling);
        let mut result = reconcile_with_store(&deduped.keys(), self.store.as_ref()).await?;
        report.reconciliation = ReconciliationCounts::from_result(&result);
        if !complete {
            let held = result.withhold_expiry();
            report.reconciliation.expiry_withheld = held;
            report.status = StreamStatus::Partial;
            if held > 0 {
                warn!(source_id = %self.config.source_id, held, "partial snapshot; expiry withheld");
            }
        }
        info!(
            source_id = %self.config.source_id,
            new = result.new_count(),
            still_active = result.still_active_count(),
            expired = result.expired_count(),
            "reconciled"
        );

        let mut cached = BTreeMap::new();
        for key in &result.still_active_keys {
            if let Some(entry) = self.store.get(key).await? {
                cached.insert(key.clone(), entry);
            }
        }

        self.enter(report, RunStage::Enriching);
        let records = self
            .enrich(http, ctx, deduped.records, &result.new_keys, &cached, options, report)
            .await;

        self.enter(report, RunStage::Persisting);
        let mut to_write = Vec::with_capacity(records.len());
        for (record, _) in &records {
            let unchanged = self.config.persist == PersistMode::Changed
                && cached
                    .get(&record.natural_key)
                    .is_some_and(|entry| !entry.has_changed(&record.fields));
            if unchanged {
                report.unchanged_skipped += 1;
            } else {
                to_write.push(record.clone());
            }
        }
        let written = self.writer.upsert_batch(&to_write).await;
        report.batch.merge(&written, self.error_cap);

        let observed: BTreeMap<NaturalKey, Observation> = records
            .into_iter()
            .filter(|(record, _)| !written.unpersisted_keys.contains(&record.natural_key))
            .map(|(record, enriched)| {
                (
                    record.natural_key,
                    Observation {
                        fields: record.fields,
                        enriched,
                    },
                )
            })
            .collect();
        report.transitions = apply(&result, &observed, self.store.as_ref(), ctx.fetched_at).await?;
        Ok(())
    }

    /// Validates, normalizes the timestamp field and keys each raw record. Rejections are
    /// recorded in the report and dropped.
    fn prepare(
        &self,
        raw: Vec<Fields>,
        fetched_at: DateTime<Utc>,
        report: &mut StreamReport,
    ) -> Vec<Record> {
        let mut records = Vec::with_capacity(raw.len());
        for fields in raw {
            match self.prepare_one(fields, fetched_at) {
                Ok(record) => {
                    if record.has_unknown_timestamp() {
                        report.unknown_timestamps += 1;
                    }
                    records.push(record);
                }
                Err(reason) => {
                    debug!(source_id = %self.config.source_id, %reason, "record rejected");
                    report
                        .batch
                        .record(UploadOutcome::Rejected(reason), self.error_cap);
                }
            }
        }
        records
    }

    fn prepare_one(&self, raw: Fields, fetched_at: DateTime<Utc>) -> Result<Record, String> {
        let mut fields = match recon_core::validate(&raw, &self.profile.rules) {
            Validation::Accepted(fields) => fields,
            Validation::Rejected(rejection) => return Err(rejection.reason),
        };

        let mut source_timestamp = None;
        if let Some(name) = &self.profile.timestamp_field {
            if let Some(text) = fields.get(name).and_then(timestamp_text) {
                match normalize_timestamp(&text, &self.clock) {
                    NormalizedTime::Utc(ts) => {
                        fields.insert(name.clone(), FieldValue::text(format_utc(ts)));
                        source_timestamp = Some(NormalizedTime::Utc(ts));
                    }
                    unknown => {
                        let keyed = self.profile.key.fields().contains(&name.as_str());
                        if keyed || self.config.unknown_timestamp == UnknownTimestampPolicy::Reject {
                            return Err(format!("`{name}`={text:?} is not a recognised timestamp"));
                        }
                        fields.insert(name.clone(), FieldValue::Null);
                        source_timestamp = Some(unknown);
                    }
                }
            }
        }

        let key = derive_key(&fields, &self.profile.key).map_err(|err| err.to_string())?;
        let mut record = Record::new(key, fields, fetched_at);
        if let Some(ts) = source_timestamp {
            record = record.with_source_timestamp(ts);
        }
        Ok(record)
    }

    /// Runs detail enrichment for new keys and for still-active keys never enriched.
    /// Other still-active records reuse the cached enrichment fields.
    #[allow(clippy::too_many_arguments)]
    async fn enrich(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        records: Vec<Record>,
        new_keys: &BTreeSet<NaturalKey>,
        cached: &BTreeMap<NaturalKey, KnownStateEntry>,
        options: StreamOptions,
        report: &mut StreamReport,
    ) -> Vec<(Record, bool)> {
        let Some(enricher) = &self.enricher else {
            return records.into_iter().map(|r| (r, false)).collect();
        };

        let mut out = Vec::with_capacity(records.len());
        for mut record in records {
            let entry = cached.get(&record.natural_key);
            let needs_detail = options.full_refresh
                || new_keys.contains(&record.natural_key)
                || entry.map_or(true, |e| e.enriched_at.is_none());

            if needs_detail {
                match enricher.enrich(http, ctx, &record.fields).await {
                    Ok(detail) => {
                        record.fields.extend(detail);
                        report.enrichment.enriched += 1;
                        out.push((record, true));
                        continue;
                    }
                    Err(err) => {
                        warn!(source_id = %self.config.source_id, key = %record.natural_key, error = %err, "enrichment failed");
                        report.enrichment.failed += 1;
                        report.warnings.push(format!("enrichment of {}: {err}", record.natural_key));
                    }
                }
            } else {
                report.enrichment.cached += 1;
            }

            if let Some(cached_fields) = entry.and_then(|e| e.fields.clone()) {
                record.fields = merge_under(cached_fields, record.fields);
            }
            out.push((record, false));
        }
        info!(
            source_id = %self.config.source_id,
            enriched = report.enrichment.enriched,
            cached = report.enrichment.cached,
            failed = report.enrichment.failed,
            "enrichment done"
        );
        out
    }
}

/// `fresh` over `cached`: the snapshot wins, cached detail fields fill the rest.
fn merge_under(mut cached: Fields, fresh: Fields) -> Fields {
    cached.extend(fresh);
    cached
}

fn timestamp_text(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Text(s) => Some(s.clone()),
        FieldValue::Number(n) if n.is_finite() && n.fract() == 0.0 => Some(format!("{}", *n as i64)),
        _ => None,
    }
}
