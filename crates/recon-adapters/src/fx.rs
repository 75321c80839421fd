//! Hourly FX bars from the Yahoo Finance chart API.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use recon_core::{FieldValue, Fields, KeySpec, NumericRule, OrderingRule, RuleSet};
use recon_storage::{ColumnKind, HttpFetcher, TableSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{json_at, AdapterError, FetchContext, RecordProfile, Snapshot, SnapshotFetcher};

/// Longest history the chart API serves at hourly resolution.
pub const MAX_BACKFILL_DAYS: u32 = 730;

const PRICE_FIELDS: [&str; 4] = ["open", "high", "low", "close"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FxPair {
    /// Display name, e.g. `EUR/PLN`. Part of the natural key.
    pub name: String,
    pub ticker: String,
    /// Plausible price range; bars outside it are rejected.
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl FxPair {
    fn new(name: &str, ticker: &str, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            ticker: ticker.into(),
            min: Some(min),
            max: Some(max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FxSettings {
    pub chart_url: String,
    pub pairs: Vec<FxPair>,
    pub interval: String,
    pub range: String,
    /// Fetch this many days of history instead of `range`. Capped at
    /// [`MAX_BACKFILL_DAYS`].
    pub backfill_days: Option<u32>,
    pub table: String,
}

impl Default for FxSettings {
    fn default() -> Self {
        Self {
            chart_url: "https://query1.finance.yahoo.com/v8/finance/chart".into(),
            pairs: vec![
                FxPair::new("EUR/PLN", "EURPLN=X", 3.8, 5.2),
                FxPair::new("EUR/CZK", "EURCZK=X", 22.0, 28.0),
                FxPair::new("EUR/HUF", "EURHUF=X", 330.0, 480.0),
            ],
            interval: "1h".into(),
            range: "5d".into(),
            backfill_days: None,
            table: "fx_bars".into(),
        }
    }
}

impl FxSettings {
    pub fn query(&self, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let mut query = vec![("interval", self.interval.clone())];
        match self.backfill_days {
            Some(requested) => {
                let days = requested.min(MAX_BACKFILL_DAYS);
                if requested > MAX_BACKFILL_DAYS {
                    warn!(requested, days, "backfill capped");
                }
                let start = now - Duration::days(i64::from(days));
                query.push(("period1", start.timestamp().to_string()));
                query.push(("period2", now.timestamp().to_string()));
            }
            None => query.push(("range", self.range.clone())),
        }
        query
    }
}

#[derive(Debug, Clone)]
pub struct FxAdapter {
    source_id: String,
    settings: FxSettings,
}

impl FxAdapter {
    pub fn new(source_id: impl Into<String>, settings: FxSettings) -> Self {
        Self {
            source_id: source_id.into(),
            settings,
        }
    }
}

#[async_trait]
impl SnapshotFetcher for FxAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn profile(&self) -> RecordProfile {
        let mut rules = RuleSet {
            required: ["timestamp", "currency_pair"]
                .into_iter()
                .chain(PRICE_FIELDS)
                .map(String::from)
                .collect(),
            numeric: PRICE_FIELDS.into_iter().map(NumericRule::positive).collect(),
            ordering: vec![OrderingRule::new("high", "low")],
        };
        rules.numeric.push(NumericRule {
            min: Some(0.0),
            ..NumericRule::new("volume")
        });
        for pair in &self.settings.pairs {
            if pair.min.is_none() && pair.max.is_none() {
                continue;
            }
            for field in PRICE_FIELDS {
                rules.numeric.push(
                    NumericRule {
                        min: pair.min,
                        max: pair.max,
                        ..NumericRule::new(field)
                    }
                    .when("currency_pair", pair.name.clone()),
                );
            }
        }

        let table = TableSpec::new(self.settings.table.clone())
            .column("currency_pair", ColumnKind::Text)
            .column("timestamp", ColumnKind::Timestamp)
            .column("open", ColumnKind::Float)
            .column("high", ColumnKind::Float)
            .column("low", ColumnKind::Float)
            .column("close", ColumnKind::Float)
            .column("volume", ColumnKind::Float)
            .column("volatility_1h", ColumnKind::Float);

        RecordProfile {
            key: KeySpec::composite(["timestamp", "currency_pair"]),
            rules,
            timestamp_field: Some("timestamp".into()),
            table,
        }
    }

    async fn fetch_snapshot(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Snapshot, AdapterError> {
        let query = self.settings.query(ctx.fetched_at);
        let mut parts = Vec::with_capacity(self.settings.pairs.len());
        for pair in &self.settings.pairs {
            let url = format!("{}/{}", self.settings.chart_url.trim_end_matches('/'), pair.ticker);
            let result = match http.get_json::<JsonValue>(&self.source_id, &url, &query).await {
                Ok(body) => parse_chart(&pair.name, &body),
                Err(err) => Err(err.into()),
            };
            match &result {
                Ok(bars) => info!(pair = %pair.name, bars = bars.len(), "fetched fx bars"),
                Err(err) => warn!(pair = %pair.name, error = %err, "fx pair failed"),
            }
            parts.push((pair.name.clone(), result));
        }
        Snapshot::from_parts(parts)
    }
}

/// Flattens one chart response into bar records. Null prices are kept as nulls so the
/// validator can reject the bar with a reason.
pub fn parse_chart(pair: &str, body: &JsonValue) -> Result<Vec<Fields>, AdapterError> {
    if let Some(err) = json_at(body, &["chart", "error"]).filter(|e| !e.is_null()) {
        return Err(AdapterError::parse(format!("chart for {pair}"), err));
    }
    let result = json_at(body, &["chart", "result"])
        .and_then(|r| r.get(0))
        .ok_or_else(|| AdapterError::parse(format!("chart for {pair}"), "missing chart.result"))?;

    let Some(timestamps) = result.get("timestamp").and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };
    let quote = json_at(result, &["indicators", "quote"]).and_then(|q| q.get(0));
    let value_at = |series: &str, index: usize| -> FieldValue {
        quote
            .and_then(|q| q.get(series))
            .and_then(|s| s.get(index))
            .and_then(JsonValue::as_f64)
            .map(FieldValue::Number)
            .unwrap_or(FieldValue::Null)
    };

    let mut bars = Vec::with_capacity(timestamps.len());
    for (index, ts) in timestamps.iter().enumerate() {
        let Some(epoch) = ts.as_i64() else {
            continue;
        };
        let mut fields = Fields::new();
        fields.insert("timestamp".into(), FieldValue::text(epoch.to_string()));
        fields.insert("currency_pair".into(), FieldValue::text(pair));
        for field in PRICE_FIELDS {
            fields.insert(field.into(), value_at(field, index));
        }
        fields.insert("volume".into(), value_at("volume", index));
        fields.insert("volatility_1h".into(), volatility(&fields).into());
        bars.push(fields);
    }
    Ok(bars)
}

/// `(high - low) / open`, rounded to 8 decimals.
fn volatility(fields: &Fields) -> Option<f64> {
    let get = |name: &str| fields.get(name).and_then(FieldValue::as_f64);
    let (open, high, low) = (get("open")?, get("high")?, get("low")?);
    if !(open.is_finite() && high.is_finite() && low.is_finite()) || open <= 0.0 {
        return None;
    }
    Some(((high - low) / open * 1e8).round() / 1e8)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use recon_core::{validate, Validation};
    use serde_json::json;

    use super::*;

    fn chart() -> JsonValue {
        json!({
            "chart": {
                "result": [{
                    "meta": {"symbol": "EURPLN=X"},
                    "timestamp": [1749988800, 1749992400, 1749996000],
                    "indicators": {"quote": [{
                        "open":   [4.2500, null,   4.2600],
                        "high":   [4.2700, 4.2650, 4.2500],
                        "low":    [4.2400, 4.2550, 4.2550],
                        "close":  [4.2600, 4.2600, 4.2580],
                        "volume": [0,      0,      null]
                    }]}
                }],
                "error": null
            }
        })
    }

    #[test]
    fn chart_rows_become_bar_records() {
        let bars = parse_chart("EUR/PLN", &chart()).unwrap();
        assert_eq!(bars.len(), 3);
        let first = &bars[0];
        assert_eq!(first.get("timestamp"), Some(&FieldValue::text("1749988800")));
        assert_eq!(first.get("currency_pair"), Some(&FieldValue::text("EUR/PLN")));
        assert_eq!(
            first.get("volatility_1h"),
            Some(&FieldValue::Number(0.00705882))
        );
        assert_eq!(bars[1].get("open"), Some(&FieldValue::Null));
        assert_eq!(bars[1].get("volatility_1h"), Some(&FieldValue::Null));
    }

    #[test]
    fn profile_rules_reject_bad_bars() {
        let adapter = FxAdapter::new("fx", FxSettings::default());
        let rules = adapter.profile().rules;
        let bars = parse_chart("EUR/PLN", &chart()).unwrap();

        assert!(validate(&bars[0], &rules).is_accepted());
        assert!(!validate(&bars[1], &rules).is_accepted(), "null open");
        let Validation::Rejected(rejection) = validate(&bars[2], &rules) else {
            panic!("high below low must be rejected");
        };
        assert_eq!(rejection.fields, vec!["high".to_string(), "low".to_string()]);

        let mut out_of_range = bars[0].clone();
        out_of_range.insert("close".into(), FieldValue::Number(7.5));
        out_of_range.insert("high".into(), FieldValue::Number(7.5));
        let Validation::Rejected(rejection) = validate(&out_of_range, &rules) else {
            panic!("out of range must be rejected");
        };
        assert!(rejection.reason.contains("maximum 5.2"));
    }

    #[test]
    fn chart_error_is_a_parse_failure() {
        let body = json!({"chart": {"result": null, "error": {"code": "Not Found"}}});
        assert!(matches!(
            parse_chart("EUR/XXX", &body),
            Err(AdapterError::Parse { .. })
        ));
    }

    #[test]
    fn backfill_is_capped() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let settings = FxSettings {
            backfill_days: Some(5000),
            ..FxSettings::default()
        };
        let query = settings.query(now);
        let period1 = query
            .iter()
            .find(|(k, _)| *k == "period1")
            .map(|(_, v)| v.parse::<i64>().unwrap())
            .unwrap();
        assert_eq!(now.timestamp() - period1, i64::from(MAX_BACKFILL_DAYS) * 86_400);

        let month = FxSettings {
            backfill_days: Some(30),
            ..FxSettings::default()
        }
        .query(now);
        assert!(month.contains(&("period1", (now.timestamp() - 30 * 86_400).to_string())));

        let default_query = FxSettings::default().query(now);
        assert!(default_query.contains(&("range", "5d".to_string())));
    }
}
