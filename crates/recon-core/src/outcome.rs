//! Per-record persistence outcomes and their aggregation.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::record::{NaturalKey, Record};

/// Error messages kept per batch unless the caller picks another cap.
pub const DEFAULT_ERROR_CAP: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadOutcome {
    Upserted,
    Rejected(String),
    Errored(String),
}

/// Summary of one batch. A value object: built by [`aggregate`] or a writer and not
/// changed after it is handed back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub attempted: usize,
    pub upserted: usize,
    pub rejected: usize,
    pub errored: usize,
    /// The first messages, up to the cap.
    pub error_messages: Vec<String>,
    /// Messages dropped after the cap was reached.
    #[serde(default)]
    pub suppressed_messages: usize,
    /// Set when retries were exhausted before the batch could complete.
    #[serde(default)]
    pub batch_error: Option<String>,
    /// Keys whose records were not persisted. Only filled by keyed recording.
    #[serde(skip)]
    pub unpersisted_keys: BTreeSet<NaturalKey>,
}

impl BatchResult {
    /// At least one record persisted. Partial success still counts.
    pub fn success(&self) -> bool {
        self.upserted > 0
    }

    pub fn is_clean(&self) -> bool {
        self.rejected == 0 && self.errored == 0 && self.batch_error.is_none()
    }

    pub fn record(&mut self, outcome: UploadOutcome, cap: usize) {
        self.attempted += 1;
        match outcome {
            UploadOutcome::Upserted => self.upserted += 1,
            UploadOutcome::Rejected(reason) => {
                self.rejected += 1;
                self.push_message(reason, cap);
            }
            UploadOutcome::Errored(cause) => {
                self.errored += 1;
                self.push_message(cause, cap);
            }
        }
    }

    /// Like [`BatchResult::record`], remembering `key` when the record did not persist.
    pub fn record_keyed(&mut self, key: &NaturalKey, outcome: UploadOutcome, cap: usize) {
        if outcome != UploadOutcome::Upserted {
            self.unpersisted_keys.insert(key.clone());
        }
        self.record(outcome, cap);
    }

    pub fn push_message(&mut self, message: String, cap: usize) {
        if self.error_messages.len() < cap {
            self.error_messages.push(message);
        } else {
            self.suppressed_messages += 1;
        }
    }

    /// Folds `other` into `self`, e.g. several streams into one run total.
    pub fn merge(&mut self, other: &BatchResult, cap: usize) {
        self.attempted += other.attempted;
        self.upserted += other.upserted;
        self.rejected += other.rejected;
        self.errored += other.errored;
        self.suppressed_messages += other.suppressed_messages;
        self.unpersisted_keys
            .extend(other.unpersisted_keys.iter().cloned());
        for message in &other.error_messages {
            self.push_message(message.clone(), cap);
        }
        if let Some(err) = &other.batch_error {
            self.push_message(err.clone(), cap);
            if self.batch_error.is_none() {
                self.batch_error = Some(err.clone());
            }
        }
    }
}

pub fn aggregate(outcomes: impl IntoIterator<Item = UploadOutcome>) -> BatchResult {
    aggregate_with_cap(outcomes, DEFAULT_ERROR_CAP)
}

pub fn aggregate_with_cap(
    outcomes: impl IntoIterator<Item = UploadOutcome>,
    cap: usize,
) -> BatchResult {
    let mut result = BatchResult::default();
    for outcome in outcomes {
        result.record(outcome, cap);
    }
    result
}

/// Idempotent insert-or-update of records keyed by natural key. A failing record never
/// aborts the batch; it is counted as errored.
#[async_trait]
pub trait UpsertWriter: Send + Sync {
    async fn upsert_batch(&self, records: &[Record]) -> BatchResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_each_outcome_class() {
        let result = aggregate([
            UploadOutcome::Upserted,
            UploadOutcome::Rejected("`open` is NaN".into()),
            UploadOutcome::Upserted,
            UploadOutcome::Errored("unique violation".into()),
        ]);
        assert_eq!(result.attempted, 4);
        assert_eq!(result.upserted, 2);
        assert_eq!(result.rejected, 1);
        assert_eq!(result.errored, 1);
        assert_eq!(result.error_messages.len(), 2);
        assert!(result.success());
        assert!(!result.is_clean());
    }

    #[test]
    fn error_messages_are_capped() {
        let outcomes = (0..10).map(|i| UploadOutcome::Errored(format!("row {i}")));
        let result = aggregate_with_cap(outcomes, 3);
        assert_eq!(result.errored, 10);
        assert_eq!(result.error_messages, vec!["row 0", "row 1", "row 2"]);
        assert_eq!(result.suppressed_messages, 7);
        assert!(!result.success());
    }

    #[test]
    fn merge_keeps_one_stream_success_visible() {
        let mut total = BatchResult::default();
        let failed = BatchResult {
            attempted: 5,
            errored: 5,
            batch_error: Some("backend unreachable after 3 attempts".into()),
            ..BatchResult::default()
        };
        let ok = aggregate([UploadOutcome::Upserted]);
        total.merge(&failed, DEFAULT_ERROR_CAP);
        total.merge(&ok, DEFAULT_ERROR_CAP);
        assert!(total.success());
        assert_eq!(total.attempted, 6);
        assert_eq!(total.batch_error.as_deref(), Some("backend unreachable after 3 attempts"));
    }

    #[test]
    fn keyed_recording_tracks_unpersisted_keys() {
        let mut result = BatchResult::default();
        result.record_keyed(&NaturalKey::new("a"), UploadOutcome::Upserted, DEFAULT_ERROR_CAP);
        result.record_keyed(
            &NaturalKey::new("b"),
            UploadOutcome::Errored("timeout".into()),
            DEFAULT_ERROR_CAP,
        );
        assert_eq!(result.upserted, 1);
        assert_eq!(
            result.unpersisted_keys,
            BTreeSet::from([NaturalKey::new("b")])
        );
    }

    #[test]
    fn outcomes_serialize_with_upper_case_tags() {
        let json = serde_json::to_string(&UploadOutcome::Rejected("bad".into())).unwrap();
        assert_eq!(json, r#"{"outcome":"REJECTED","detail":"bad"}"#);
    }
}
