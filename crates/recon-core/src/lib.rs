//! Core domain model and reconciliation logic for the snapshot sync engine.
//!
//! Nothing in this crate performs network I/O. Fetchers, persistence backends and
//! durable state stores plug in through the traits in [`state`] and [`outcome`].

pub mod error;
pub mod identity;
pub mod outcome;
pub mod reconcile;
pub mod record;
pub mod state;
pub mod validate;

pub use error::{CoreError, StoreError};
pub use identity::{
    derive_key, format_utc, normalize_timestamp, normalize_url, KeySpec, SourceClock,
};
pub use outcome::{
    aggregate, aggregate_with_cap, BatchResult, UploadOutcome, UpsertWriter, DEFAULT_ERROR_CAP,
};
pub use reconcile::{
    apply, dedup_snapshot, reconcile, reconcile_with_store, AppliedTransitions, DedupedSnapshot,
    Observation, ReconciliationResult,
};
pub use record::{content_hash, FieldValue, Fields, NaturalKey, NormalizedTime, Record};
pub use state::{KnownStateEntry, KnownStateStore, MemoryStateStore};
pub use validate::{validate, NumericRule, OrderingRule, Rejection, RuleSet, Validation};

pub const CRATE_NAME: &str = "recon-core";
