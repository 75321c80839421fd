//! Quarter-hourly market data from the PSE reporting API (`api.raporty.pse.pl`).
//!
//! Each run asks for one or more business dates, lagging today by `delay_days` in the
//! source clock's zone. Responses page through `nextLink`.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use recon_core::{FieldValue, Fields, KeySpec, RuleSet, SourceClock};
use recon_storage::{ColumnKind, HttpFetcher, TableSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{
    json_str, text_or_none, AdapterError, FetchContext, Part, RecordProfile, Snapshot,
    SnapshotFetcher,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PseSettings {
    pub base_url: String,
    /// Report name, e.g. `rce-pln` for balancing market prices.
    pub endpoint: String,
    /// Numeric columns copied from each row.
    pub value_fields: Vec<String>,
    /// The report for day D is published on D + `delay_days`.
    pub delay_days: u32,
    /// Business dates per run, newest last.
    pub days: u32,
    pub max_pages: u32,
    pub table: String,
}

impl Default for PseSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.raporty.pse.pl/api".into(),
            endpoint: "rce-pln".into(),
            value_fields: vec!["rce_pln".into()],
            delay_days: 1,
            days: 1,
            max_pages: 20,
            table: "energy_prices".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PseAdapter {
    source_id: String,
    clock: SourceClock,
    settings: PseSettings,
}

impl PseAdapter {
    pub fn new(source_id: impl Into<String>, clock: SourceClock, settings: PseSettings) -> Self {
        Self {
            source_id: source_id.into(),
            clock,
            settings,
        }
    }

    /// Business dates to request for a run at `today` (source-local).
    pub fn business_dates(&self, today: NaiveDate) -> Vec<NaiveDate> {
        let newest = today - Duration::days(i64::from(self.settings.delay_days));
        (0..self.settings.days.max(1))
            .rev()
            .map(|back| newest - Duration::days(i64::from(back)))
            .collect()
    }

    async fn fetch_day(&self, http: &HttpFetcher, day: NaiveDate) -> Result<Part, AdapterError> {
        let mut url = format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.endpoint
        );
        let mut query = vec![(
            "$filter",
            format!("business_date eq '{}'", day.format("%Y-%m-%d")),
        )];
        let mut rows = Vec::new();
        for page in 1..=self.settings.max_pages.max(1) {
            let body: JsonValue = http.get_json(&self.source_id, &url, &query).await?;
            let page_rows = parse_page(&body, &self.settings.value_fields)?;
            debug!(endpoint = %self.settings.endpoint, %day, page, rows = page_rows.len(), "pse page");
            rows.extend(page_rows);

            let Some(next) = json_str(&body, &["nextLink"]).and_then(text_or_none) else {
                return Ok(rows.into());
            };
            // nextLink already carries the filter.
            url = next;
            query.clear();
        }
        warn!(endpoint = %self.settings.endpoint, %day, "page cap reached");
        Ok(Part::truncated(
            rows,
            format!("nextLink still set after {} pages", self.settings.max_pages.max(1)),
        ))
    }
}

#[async_trait]
impl SnapshotFetcher for PseAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn profile(&self) -> RecordProfile {
        let mut table = TableSpec::new(self.settings.table.clone())
            .column("dtime", ColumnKind::Timestamp)
            .column("business_date", ColumnKind::Text)
            .column("period", ColumnKind::Text);
        for field in &self.settings.value_fields {
            table = table.column(field.clone(), ColumnKind::Float);
        }
        RecordProfile {
            key: KeySpec::composite(["dtime"]),
            rules: RuleSet {
                required: vec!["dtime".into(), "business_date".into()],
                ..RuleSet::default()
            },
            timestamp_field: Some("dtime".into()),
            table,
        }
    }

    async fn fetch_snapshot(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Snapshot, AdapterError> {
        let today = ctx.fetched_at.with_timezone(&self.clock.tz()).date_naive();
        let mut parts = Vec::new();
        for day in self.business_dates(today) {
            let result = self.fetch_day(http, day).await;
            match &result {
                Ok(part) => info!(%day, rows = part.records.len(), "fetched pse report"),
                Err(err) => warn!(%day, error = %err, "pse report failed"),
            }
            parts.push((day.to_string(), result));
        }
        Snapshot::from_parts(parts)
    }
}

/// Rows of one response page. Numbers may arrive as strings; blanks become nulls.
pub fn parse_page(body: &JsonValue, value_fields: &[String]) -> Result<Vec<Fields>, AdapterError> {
    let rows = match body {
        JsonValue::Array(rows) => rows,
        _ => body
            .get("value")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::parse("pse page", "missing value array"))?,
    };
    Ok(rows
        .iter()
        .map(|row| {
            let mut fields = Fields::new();
            for name in ["dtime", "business_date", "period"] {
                fields.insert(name.into(), json_str(row, &[name]).and_then(text_or_none).into());
            }
            for name in value_fields {
                fields.insert(name.clone(), number(row.get(name)).into());
            }
            fields
        })
        .collect())
}

fn number(value: Option<&JsonValue>) -> Option<f64> {
    let parsed: Option<f64> = match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use recon_core::{derive_key, format_utc, normalize_timestamp, NormalizedTime};
    use serde_json::json;

    use super::*;

    fn adapter(settings: PseSettings) -> PseAdapter {
        PseAdapter::new("pse", SourceClock::parse("Europe/Warsaw").unwrap(), settings)
    }

    #[test]
    fn business_dates_lag_by_publication_delay() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        let one = adapter(PseSettings::default()).business_dates(today);
        assert_eq!(one, vec![NaiveDate::from_ymd_opt(2025, 6, 14).unwrap()]);

        let week = adapter(PseSettings {
            delay_days: 7,
            days: 3,
            ..PseSettings::default()
        })
        .business_dates(today);
        assert_eq!(
            week,
            vec![
                NaiveDate::from_ymd_opt(2025, 6, 6).unwrap(),
                NaiveDate::from_ymd_opt(2025, 6, 7).unwrap(),
                NaiveDate::from_ymd_opt(2025, 6, 8).unwrap(),
            ]
        );
    }

    #[test]
    fn page_rows_carry_numbers_and_local_times() {
        let body = json!({
            "value": [
                {"dtime": "2025-06-14 00:15:00", "business_date": "2025-06-14", "period": "00:00 - 00:15", "rce_pln": "412.5"},
                {"dtime": "2025-06-14 00:30:00", "business_date": "2025-06-14", "period": "00:15 - 00:30", "rce_pln": -12.0},
                {"dtime": "2025-06-14 00:45:00", "business_date": "2025-06-14", "rce_pln": " "}
            ],
            "nextLink": null
        });
        let rows = parse_page(&body, &["rce_pln".to_string()]).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("rce_pln"), Some(&FieldValue::Number(412.5)));
        assert_eq!(rows[1].get("rce_pln"), Some(&FieldValue::Number(-12.0)));
        assert_eq!(rows[2].get("rce_pln"), Some(&FieldValue::Null));
        assert_eq!(rows[2].get("period"), Some(&FieldValue::Null));

        let clock = SourceClock::parse("Europe/Warsaw").unwrap();
        let NormalizedTime::Utc(ts) = normalize_timestamp("2025-06-14 00:15:00", &clock) else {
            panic!("dtime must parse");
        };
        let mut keyed = rows[0].clone();
        keyed.insert("dtime".into(), FieldValue::text(format_utc(ts)));
        let profile = adapter(PseSettings::default()).profile();
        assert_eq!(derive_key(&keyed, &profile.key).unwrap().as_str(), "2025-06-13T22:15:00Z");
    }

    #[test]
    fn page_without_rows_is_a_parse_error() {
        assert!(parse_page(&json!({"error": "bad filter"}), &[]).is_err());
    }
}
