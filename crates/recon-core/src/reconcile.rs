//! Snapshot reconciliation: classify keys as new, still active or expired, then apply
//! the resulting lifecycle transitions to a [`KnownStateStore`].

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::record::{Fields, NaturalKey, Record};
use crate::state::{KnownStateEntry, KnownStateStore};

#[derive(Debug, Clone, PartialEq)]
pub struct DedupedSnapshot {
    pub records: Vec<Record>,
    /// Records dropped because an earlier record carried the same key.
    pub merged_duplicates: usize,
}

impl DedupedSnapshot {
    pub fn keys(&self) -> BTreeSet<NaturalKey> {
        self.records.iter().map(|r| r.natural_key.clone()).collect()
    }
}

/// Collapses records sharing a natural key. The first occurrence wins; later ones are
/// dropped and only counted.
pub fn dedup_snapshot(records: impl IntoIterator<Item = Record>) -> DedupedSnapshot {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut merged_duplicates = 0;
    for record in records {
        if seen.insert(record.natural_key.clone()) {
            kept.push(record);
        } else {
            debug!(key = %record.natural_key, "merging duplicate snapshot record");
            merged_duplicates += 1;
        }
    }
    DedupedSnapshot {
        records: kept,
        merged_duplicates,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub new_keys: BTreeSet<NaturalKey>,
    pub still_active_keys: BTreeSet<NaturalKey>,
    pub expired_keys: BTreeSet<NaturalKey>,
}

impl ReconciliationResult {
    pub fn new_count(&self) -> usize {
        self.new_keys.len()
    }

    pub fn still_active_count(&self) -> usize {
        self.still_active_keys.len()
    }

    pub fn expired_count(&self) -> usize {
        self.expired_keys.len()
    }

    /// `new ∪ still_active`.
    pub fn current_keys(&self) -> BTreeSet<NaturalKey> {
        self.new_keys.union(&self.still_active_keys).cloned().collect()
    }

    /// Result used when the snapshot is unusable: every previously active key is
    /// carried forward untouched and nothing expires.
    pub fn carry_forward() -> Self {
        Self::default()
    }

    /// Drops the expiry half of the result, keeping every previously active key active.
    /// Used when the snapshot is known to be partial. Returns how many expiries were held.
    pub fn withhold_expiry(&mut self) -> usize {
        let held = self.expired_keys.len();
        self.expired_keys.clear();
        held
    }

    fn check_disjoint(&self) -> Result<(), CoreError> {
        let overlaps = [
            ("new", "still_active", &self.new_keys, &self.still_active_keys),
            ("new", "expired", &self.new_keys, &self.expired_keys),
            ("still_active", "expired", &self.still_active_keys, &self.expired_keys),
        ];
        for (left_name, right_name, left, right) in overlaps {
            if let Some(key) = left.intersection(right).next() {
                return Err(CoreError::InvariantViolation(format!(
                    "key {key} classified as both {left_name} and {right_name}"
                )));
            }
        }
        Ok(())
    }

    fn check_partition(
        &self,
        current: &BTreeSet<NaturalKey>,
        previously_active: &BTreeSet<NaturalKey>,
    ) -> Result<(), CoreError> {
        self.check_disjoint()?;
        if &self.current_keys() != current {
            return Err(CoreError::InvariantViolation(
                "new ∪ still_active does not equal the current snapshot keys".into(),
            ));
        }
        let previous: BTreeSet<_> = self
            .still_active_keys
            .union(&self.expired_keys)
            .cloned()
            .collect();
        if &previous != previously_active {
            return Err(CoreError::InvariantViolation(
                "still_active ∪ expired does not equal the previously active keys".into(),
            ));
        }
        Ok(())
    }
}

/// Pure set difference between the current snapshot and the previously active keys.
pub fn reconcile(
    current: &BTreeSet<NaturalKey>,
    previously_active: &BTreeSet<NaturalKey>,
) -> Result<ReconciliationResult, CoreError> {
    let result = ReconciliationResult {
        new_keys: current.difference(previously_active).cloned().collect(),
        still_active_keys: current.intersection(previously_active).cloned().collect(),
        expired_keys: previously_active.difference(current).cloned().collect(),
    };
    result.check_partition(current, previously_active)?;
    Ok(result)
}

pub async fn reconcile_with_store(
    current: &BTreeSet<NaturalKey>,
    store: &dyn KnownStateStore,
) -> Result<ReconciliationResult, CoreError> {
    let previously_active = store.load_all_active().await?;
    reconcile(current, &previously_active)
}

/// What this run observed for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub fields: Fields,
    /// Detail enrichment ran for this key in this run.
    pub enriched: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppliedTransitions {
    pub created: usize,
    /// Keys classified as new that already had an expired entry.
    pub reactivated: usize,
    pub touched: usize,
    pub expired: usize,
    /// New keys without an observation; left out of the store so the next run sees
    /// them as new again.
    pub withheld: usize,
}

/// Writes the lifecycle transitions of `result` to `store` in one batch.
///
/// New keys get `first_seen_at = last_seen_at = now`, unless an expired entry exists,
/// in which case it is reactivated and keeps its original `first_seen_at`. Still-active
/// keys are touched. Expired keys are flagged inactive and never removed.
pub async fn apply(
    result: &ReconciliationResult,
    observed: &BTreeMap<NaturalKey, Observation>,
    store: &dyn KnownStateStore,
    now: DateTime<Utc>,
) -> Result<AppliedTransitions, CoreError> {
    result.check_disjoint()?;

    let mut transitions = AppliedTransitions::default();
    let mut batch = Vec::with_capacity(
        result.new_count() + result.still_active_count() + result.expired_count(),
    );

    for key in &result.new_keys {
        let Some(observation) = observed.get(key) else {
            transitions.withheld += 1;
            continue;
        };
        let mut entry = match store.get(key).await? {
            Some(mut existing) => {
                if existing.is_active {
                    return Err(CoreError::InvariantViolation(format!(
                        "key {key} classified as new but is active in the store"
                    )));
                }
                existing.touch(now);
                transitions.reactivated += 1;
                existing
            }
            None => {
                transitions.created += 1;
                KnownStateEntry::first_seen(key.clone(), now)
            }
        };
        record_observation(&mut entry, observation, now);
        batch.push(entry);
    }

    for key in &result.still_active_keys {
        let mut entry = store
            .get(key)
            .await?
            .unwrap_or_else(|| KnownStateEntry::first_seen(key.clone(), now));
        entry.touch(now);
        if let Some(observation) = observed.get(key) {
            record_observation(&mut entry, observation, now);
        }
        transitions.touched += 1;
        batch.push(entry);
    }

    for key in &result.expired_keys {
        match store.get(key).await? {
            Some(mut entry) => {
                entry.expire();
                transitions.expired += 1;
                batch.push(entry);
            }
            None => warn!(key = %key, "expired key has no stored entry"),
        }
    }

    store.upsert_entries(&batch).await?;
    Ok(transitions)
}

fn record_observation(entry: &mut KnownStateEntry, observation: &Observation, now: DateTime<Utc>) {
    entry.remember_fields(observation.fields.clone());
    if observation.enriched {
        entry.enriched_at = Some(now);
    }
}
