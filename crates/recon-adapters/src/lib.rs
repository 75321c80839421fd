//! Snapshot fetchers and detail enrichers, one per source kind.
//!
//! Adapters only turn a remote source into flat [`Fields`] maps. Validation, keying,
//! reconciliation and persistence happen downstream in the sync pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{Fields, KeySpec, RuleSet, SourceClock};
use recon_storage::{FetchError, HttpFetcher, TableSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod fixture;
pub mod fx;
pub mod jobs;
pub mod listing;
pub mod news;
pub mod pse;
pub mod weather;

pub use fixture::{FixtureAdapter, FixtureSettings};
pub use fx::{FxAdapter, FxPair, FxSettings};
pub use jobs::{JobDetailEnricher, JobSearchAdapter, JobSearchSettings};
pub use listing::{HtmlDetailEnricher, HtmlListingAdapter, ListingSettings, ListingTarget};
pub use news::{NewsAdapter, NewsFeed, NewsSettings};
pub use pse::{PseAdapter, PseSettings};
pub use weather::{Location, LocationKind, WeatherAdapter, WeatherSettings};

pub const CRATE_NAME: &str = "recon-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Raw records from one fetch. `complete` is false when part of the source failed; the
/// records are still persisted but nothing is expired on the strength of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub records: Vec<Fields>,
    pub complete: bool,
    pub warnings: Vec<String>,
}

impl Snapshot {
    pub fn complete(records: Vec<Fields>) -> Self {
        Self {
            records,
            complete: true,
            warnings: Vec::new(),
        }
    }

    /// Builds a snapshot from per-part results. Failed or truncated parts mark the
    /// snapshot incomplete; all parts failing means the source is unavailable.
    pub fn from_parts<P: Into<Part>>(
        parts: Vec<(String, Result<P, AdapterError>)>,
    ) -> Result<Self, AdapterError> {
        let total = parts.len();
        let mut failed = Vec::new();
        let mut snapshot = Snapshot::complete(Vec::new());
        for (name, result) in parts {
            match result.map(Into::into) {
                Ok(part) => {
                    if let Some(reason) = part.truncated {
                        snapshot.complete = false;
                        snapshot.warnings.push(format!("{name}: {reason}"));
                    }
                    snapshot.records.extend(part.records);
                }
                Err(err) => failed.push(format!("{name}: {err}")),
            }
        }
        if total > 0 && failed.len() == total {
            return Err(AdapterError::SourceUnavailable(failed.join("; ")));
        }
        if !failed.is_empty() {
            snapshot.complete = false;
            snapshot.warnings.extend(failed);
        }
        Ok(snapshot)
    }
}

/// Records from one sub-request of a snapshot (a page run, pair, location or feed).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Part {
    pub records: Vec<Fields>,
    /// Set when paging stopped at a cap while the source still had more.
    pub truncated: Option<String>,
}

impl Part {
    pub fn truncated(records: Vec<Fields>, reason: impl Into<String>) -> Self {
        Self {
            records,
            truncated: Some(reason.into()),
        }
    }
}

impl From<Vec<Fields>> for Part {
    fn from(records: Vec<Fields>) -> Self {
        Self {
            records,
            truncated: None,
        }
    }
}

/// How records from one source are keyed, validated and stored.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordProfile {
    pub key: KeySpec,
    pub rules: RuleSet,
    /// Field holding the source-side timestamp, normalized per the source clock.
    pub timestamp_field: Option<String>,
    pub table: TableSpec,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The source gave no usable snapshot this run. Nothing may be expired because of it.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("cannot parse {what}: {message}")]
    Parse { what: String, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn parse(what: impl Into<String>, message: impl ToString) -> Self {
        AdapterError::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    fn source_id(&self) -> &str;

    fn profile(&self) -> RecordProfile;

    /// Returns the current snapshot. Parts that failed must mark it incomplete, since
    /// records missing from a complete snapshot are expired.
    async fn fetch_snapshot(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Snapshot, AdapterError>;
}

/// Expensive per-record detail fetch, run only for new keys unless a full refresh is
/// requested.
#[async_trait]
pub trait DetailEnricher: Send + Sync {
    /// Returns fields to merge over the listing fields.
    async fn enrich(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        listing: &Fields,
    ) -> Result<Fields, AdapterError>;
}

/// Adapter selection as written in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    FxBars(FxSettings),
    Weather(WeatherSettings),
    JobSearch(JobSearchSettings),
    HtmlListing(ListingSettings),
    PseEnergy(PseSettings),
    NewsFeed(NewsSettings),
    Fixture(FixtureSettings),
}

pub struct BuiltAdapter {
    pub fetcher: Box<dyn SnapshotFetcher>,
    pub enricher: Option<Box<dyn DetailEnricher>>,
}

/// `clock` is the source's configured zone. Adapters that ask the remote side for local
/// times request them in this zone.
pub fn build_adapter(source_id: &str, clock: SourceClock, spec: &AdapterSpec) -> BuiltAdapter {
    match spec {
        AdapterSpec::FxBars(settings) => BuiltAdapter {
            fetcher: Box::new(FxAdapter::new(source_id, settings.clone())),
            enricher: None,
        },
        AdapterSpec::Weather(settings) => BuiltAdapter {
            fetcher: Box::new(WeatherAdapter::new(source_id, clock, settings.clone())),
            enricher: None,
        },
        AdapterSpec::JobSearch(settings) => BuiltAdapter {
            fetcher: Box::new(JobSearchAdapter::new(source_id, settings.clone())),
            enricher: Some(Box::new(JobDetailEnricher::new(source_id, settings.clone()))),
        },
        AdapterSpec::HtmlListing(settings) => {
            let enricher: Option<Box<dyn DetailEnricher>> = match settings.detail_selector {
                Some(_) => Some(Box::new(HtmlDetailEnricher::new(source_id, settings.clone()))),
                None => None,
            };
            BuiltAdapter {
                fetcher: Box::new(HtmlListingAdapter::new(source_id, settings.clone())),
                enricher,
            }
        }
        AdapterSpec::PseEnergy(settings) => BuiltAdapter {
            fetcher: Box::new(PseAdapter::new(source_id, clock, settings.clone())),
            enricher: None,
        },
        AdapterSpec::NewsFeed(settings) => BuiltAdapter {
            fetcher: Box::new(NewsAdapter::new(source_id, settings.clone())),
            enricher: None,
        },
        AdapterSpec::Fixture(settings) => BuiltAdapter {
            fetcher: Box::new(FixtureAdapter::new(source_id, settings.clone())),
            enricher: None,
        },
    }
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

pub(crate) fn json_string_list(value: &JsonValue, path: &[&str]) -> Option<String> {
    let items = json_at(value, path)?
        .as_array()?
        .iter()
        .filter_map(|v| match v {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Object(_) => v.get("value").and_then(JsonValue::as_str).map(String::from),
            _ => None,
        })
        .collect::<Vec<_>>();
    if items.is_empty() {
        None
    } else {
        Some(items.join("; "))
    }
}

pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use recon_core::FieldValue;

    use super::*;

    fn warsaw() -> SourceClock {
        SourceClock::parse("Europe/Warsaw").unwrap()
    }

    fn rows(n: usize) -> Vec<Fields> {
        (0..n)
            .map(|i| Fields::from([("id".to_string(), FieldValue::from(i as f64))]))
            .collect()
    }

    #[test]
    fn failed_part_marks_snapshot_incomplete() {
        let snapshot = Snapshot::from_parts(vec![
            ("EUR/PLN".into(), Ok(rows(3))),
            ("EUR/CZK".into(), Err(AdapterError::parse("chart", "missing chart.result"))),
        ])
        .unwrap();
        assert!(!snapshot.complete);
        assert_eq!(snapshot.records.len(), 3);
        assert_eq!(snapshot.warnings.len(), 1);
        assert!(snapshot.warnings[0].starts_with("EUR/CZK: "));
    }

    #[test]
    fn all_parts_failing_is_unavailable() {
        let result = Snapshot::from_parts::<Vec<Fields>>(vec![
            ("a".into(), Err(AdapterError::parse("x", "boom"))),
            ("b".into(), Err(AdapterError::parse("y", "boom"))),
        ]);
        assert!(matches!(result, Err(AdapterError::SourceUnavailable(_))));
    }

    #[test]
    fn empty_parts_give_an_empty_complete_snapshot() {
        let snapshot = Snapshot::from_parts::<Part>(Vec::new()).unwrap();
        assert!(snapshot.complete);
        assert!(snapshot.records.is_empty());
    }

    #[test]
    fn adapter_spec_reads_from_yaml_shape() {
        let spec: AdapterSpec = serde_json::from_value(serde_json::json!({
            "kind": "html_listing",
            "targets": [{"category": "it", "url": "https://example.pl/praca/it"}],
            "detail_selector": "#offer"
        }))
        .unwrap();
        let AdapterSpec::HtmlListing(settings) = &spec else {
            panic!("expected html listing");
        };
        assert_eq!(settings.link_pattern, ",oferta,");
        let built = build_adapter("board", warsaw(), &spec);
        assert_eq!(built.fetcher.source_id(), "board");
        assert!(built.enricher.is_some());

        let fx: AdapterSpec = serde_json::from_value(serde_json::json!({"kind": "fx_bars"})).unwrap();
        assert!(build_adapter("fx", warsaw(), &fx).enricher.is_none());
    }

    #[test]
    fn truncated_part_keeps_records_but_marks_snapshot_incomplete() {
        let snapshot = Snapshot::from_parts(vec![
            ("data".to_string(), Ok(Part::truncated(rows(4), "page cap of 20 reached"))),
            ("sales".to_string(), Ok(Part::from(rows(2)))),
        ])
        .unwrap();
        assert!(!snapshot.complete);
        assert_eq!(snapshot.records.len(), 6);
        assert_eq!(snapshot.warnings, vec!["data: page cap of 20 reached".to_string()]);
    }

    #[test]
    fn news_and_energy_kinds_parse() {
        let news: AdapterSpec = serde_json::from_value(serde_json::json!({
            "kind": "news_feed",
            "feeds": [{"name": "bankier", "url": "https://example.pl/rss.xml"}]
        }))
        .unwrap();
        assert!(matches!(news, AdapterSpec::NewsFeed(_)));
        let pse: AdapterSpec =
            serde_json::from_value(serde_json::json!({"kind": "pse_energy"})).unwrap();
        assert_eq!(build_adapter("pse", warsaw(), &pse).fetcher.profile().table.name, "energy_prices");
    }
}
