//! Batch upsert with per-record failure isolation and two levels of retry.

use async_trait::async_trait;
use recon_core::{BatchResult, Record, UploadOutcome, UpsertWriter, DEFAULT_ERROR_CAP};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::retry::{execute_with_retry, RetryDisposition, RetryError, RetryPolicy, Retryable};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistError {
    /// The backend could not be reached or dropped the connection.
    #[error("backend unreachable: {0}")]
    Connectivity(String),
    /// The backend answered but refused the session: bad credentials, unknown
    /// database or a malformed URL. Retrying cannot help.
    #[error("backend refused the connection: {0}")]
    Refused(String),
    /// The backend refused this record, e.g. a constraint violation.
    #[error("record {key} failed: {message}")]
    Record { key: String, message: String },
    /// The record cannot be expressed in the target schema.
    #[error("record {key} rejected: {reason}")]
    Rejected { key: String, reason: String },
}

impl Retryable for PersistError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            PersistError::Connectivity(_) => RetryDisposition::Retryable,
            PersistError::Refused(_) | PersistError::Record { .. } | PersistError::Rejected { .. } => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

/// A keyed insert-or-update target.
#[async_trait]
pub trait UpsertBackend: Send + Sync {
    type Conn: Send;

    async fn connect(&self) -> Result<Self::Conn, PersistError>;

    /// Inserts the record or updates the row with the same natural key.
    async fn upsert_record(&self, conn: &mut Self::Conn, record: &Record)
        -> Result<(), PersistError>;
}

/// Drives an [`UpsertBackend`] through a batch.
///
/// Connection attempts retry with `connection_retry`. A connectivity failure during
/// the batch abandons the attempt, and the batch is retried with `batch_retry` on a
/// fresh connection, resuming at the first record without an outcome. Non-connectivity
/// failures are recorded against the record and the batch continues.
#[derive(Debug)]
pub struct RetryingWriter<B> {
    backend: B,
    connection_retry: RetryPolicy,
    batch_retry: RetryPolicy,
    error_cap: usize,
}

impl<B: UpsertBackend> RetryingWriter<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            connection_retry: RetryPolicy::connection(),
            batch_retry: RetryPolicy::batch(),
            error_cap: DEFAULT_ERROR_CAP,
        }
    }

    pub fn with_policies(mut self, connection_retry: RetryPolicy, batch_retry: RetryPolicy) -> Self {
        self.connection_retry = connection_retry;
        self.batch_retry = batch_retry;
        self
    }

    pub fn with_error_cap(mut self, error_cap: usize) -> Self {
        self.error_cap = error_cap;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn attempt_batch(
        &self,
        records: &[Record],
        progress: &Mutex<Vec<Option<UploadOutcome>>>,
    ) -> Result<(), PersistError> {
        let backend = &self.backend;
        let mut conn = execute_with_retry(&self.connection_retry, "connect", move |_| {
            backend.connect()
        })
        .await
        .map_err(|err| match err {
            RetryError::Exhausted { attempts, last, .. } => {
                PersistError::Connectivity(format!("{last} (after {attempts} connection attempts)"))
            }
            RetryError::Fatal { source, .. } => source,
        })?;

        let mut progress = progress.lock().await;
        for (index, record) in records.iter().enumerate() {
            if progress[index].is_some() {
                continue;
            }
            let outcome = match self.backend.upsert_record(&mut conn, record).await {
                Ok(()) => UploadOutcome::Upserted,
                Err(err @ (PersistError::Connectivity(_) | PersistError::Refused(_))) => {
                    return Err(err)
                }
                Err(err @ PersistError::Rejected { .. }) => {
                    warn!(key = %record.natural_key, error = %err, "record rejected by backend");
                    UploadOutcome::Rejected(err.to_string())
                }
                Err(err @ PersistError::Record { .. }) => {
                    warn!(key = %record.natural_key, error = %err, "record upsert failed");
                    UploadOutcome::Errored(err.to_string())
                }
            };
            progress[index] = Some(outcome);
        }
        Ok(())
    }
}

#[async_trait]
impl<B: UpsertBackend> UpsertWriter for RetryingWriter<B> {
    async fn upsert_batch(&self, records: &[Record]) -> BatchResult {
        if records.is_empty() {
            return BatchResult::default();
        }

        let progress = Mutex::new(vec![None; records.len()]);
        let progress_ref = &progress;
        let outcome = execute_with_retry(&self.batch_retry, "upsert batch", move |attempt| async move {
            if attempt > 1 {
                info!(attempt, "retrying batch on a fresh connection");
            }
            self.attempt_batch(records, progress_ref).await
        })
        .await;

        let mut result = BatchResult::default();
        let mut pending = 0;
        for (slot, record) in progress.into_inner().into_iter().zip(records) {
            match slot {
                Some(outcome) => result.record_keyed(&record.natural_key, outcome, self.error_cap),
                None => {
                    pending += 1;
                    result.unpersisted_keys.insert(record.natural_key.clone());
                }
            }
        }

        if let Err(err) = outcome {
            let message = err.to_string();
            warn!(pending, error = %message, "batch abandoned");
            result.attempted += pending;
            result.errored += pending;
            result.push_message(message.clone(), self.error_cap);
            result.batch_error = Some(message);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use recon_core::{FieldValue, Fields, NaturalKey};

    use super::*;
    use crate::memory::MemoryTable;

    /// Wraps a [`MemoryTable`] with scripted failures.
    struct FlakyTable {
        inner: MemoryTable,
        failing_keys: HashSet<String>,
        connect_failures: AtomicUsize,
        drop_connection_at: Option<String>,
        dropped: AtomicUsize,
        refuse: bool,
        connects: AtomicUsize,
    }

    impl FlakyTable {
        fn new(inner: MemoryTable) -> Self {
            Self {
                inner,
                failing_keys: HashSet::new(),
                connect_failures: AtomicUsize::new(0),
                drop_connection_at: None,
                dropped: AtomicUsize::new(0),
                refuse: false,
                connects: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl UpsertBackend for FlakyTable {
        type Conn = ();

        async fn connect(&self) -> Result<(), PersistError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(PersistError::Refused("password authentication failed".into()));
            }
            let remaining = self.connect_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.connect_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(PersistError::Connectivity("connection refused".into()));
            }
            Ok(())
        }

        async fn upsert_record(&self, conn: &mut (), record: &Record) -> Result<(), PersistError> {
            let key = record.natural_key.as_str();
            if self.drop_connection_at.as_deref() == Some(key)
                && self.dropped.fetch_add(1, Ordering::SeqCst) == 0
            {
                return Err(PersistError::Connectivity("server closed the connection".into()));
            }
            if self.failing_keys.contains(key) {
                return Err(PersistError::Record {
                    key: key.to_string(),
                    message: "duplicate key value violates unique constraint".into(),
                });
            }
            self.inner.upsert_record(conn, record).await
        }
    }

    fn records(n: usize) -> Vec<Record> {
        (1..=n)
            .map(|i| {
                let mut fields = Fields::new();
                fields.insert("value".into(), FieldValue::Number(i as f64));
                Record::new(NaturalKey::new(format!("r{i}")), fields, Utc::now())
            })
            .collect()
    }

    fn fast_policies() -> (RetryPolicy, RetryPolicy) {
        let step = |secs| RetryPolicy {
            max_attempts: 3,
            backoff: crate::retry::Backoff::Linear {
                step: Duration::from_secs(secs),
            },
        };
        (step(10), step(15))
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_record_does_not_abort_the_batch() {
        let table = MemoryTable::new();
        let mut flaky = FlakyTable::new(table.clone());
        flaky.failing_keys.insert("r5".into());
        let writer = RetryingWriter::new(flaky);

        let result = writer.upsert_batch(&records(10)).await;
        assert_eq!(result.attempted, 10);
        assert_eq!(result.upserted, 9);
        assert_eq!(result.errored, 1);
        assert!(result.batch_error.is_none());
        assert!(result.error_messages[0].contains("r5"));
        assert_eq!(
            result.unpersisted_keys.iter().collect::<Vec<_>>(),
            vec![&NaturalKey::new("r5")]
        );

        let stored = table.keys().await;
        assert_eq!(stored.len(), 9);
        assert!(!stored.contains(&NaturalKey::new("r5")));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_outage_recovers_without_losing_records() {
        let table = MemoryTable::new();
        let flaky = FlakyTable::new(table.clone());
        flaky.connect_failures.store(2, Ordering::SeqCst);
        let (conn, batch) = fast_policies();
        let writer = RetryingWriter::new(flaky).with_policies(conn, batch);

        let result = writer.upsert_batch(&records(4)).await;
        assert_eq!(result.upserted, 4);
        assert!(result.is_clean());
        assert_eq!(table.len().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_resumes_on_a_fresh_one() {
        let table = MemoryTable::new();
        let mut flaky = FlakyTable::new(table.clone());
        flaky.drop_connection_at = Some("r3".into());
        let writer = RetryingWriter::new(flaky);

        let result = writer.upsert_batch(&records(5)).await;
        assert_eq!(result.upserted, 5);
        assert_eq!(result.attempted, 5);
        assert_eq!(table.len().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_outage_reports_a_batch_error_in_bounded_time() {
        let table = MemoryTable::new();
        let flaky = FlakyTable::new(table.clone());
        flaky.connect_failures.store(usize::MAX, Ordering::SeqCst);
        let (conn, batch) = fast_policies();
        let writer = RetryingWriter::new(flaky).with_policies(conn, batch);

        let started = tokio::time::Instant::now();
        let result = writer.upsert_batch(&records(3)).await;
        let bound = batch.worst_case_wait() + conn.worst_case_wait() * batch.max_attempts as u32;

        assert!(started.elapsed() <= bound + Duration::from_secs(1));
        assert_eq!(result.upserted, 0);
        assert_eq!(result.errored, 3);
        assert_eq!(result.attempted, 3);
        assert!(result.batch_error.is_some());
        assert!(!result.success());
        assert!(table.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_session_fails_the_batch_on_the_first_attempt() {
        let table = MemoryTable::new();
        let mut flaky = FlakyTable::new(table.clone());
        flaky.refuse = true;
        let writer = RetryingWriter::new(flaky);

        let started = tokio::time::Instant::now();
        let result = writer.upsert_batch(&records(2)).await;
        assert_eq!(writer.backend.connects.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(result.errored, 2);
        assert!(result.batch_error.unwrap().contains("password authentication failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_a_batch_converges_to_the_same_rows() {
        let table = MemoryTable::new();
        let writer = RetryingWriter::new(table.clone());
        let batch = records(3);

        writer.upsert_batch(&batch).await;
        let first = table.rows().await;
        let again = writer.upsert_batch(&batch).await;
        assert_eq!(again.upserted, 3);
        assert_eq!(table.rows().await, first);
    }
}
