//! Natural key derivation and timestamp normalization.

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::record::{FieldValue, Fields, NaturalKey, NormalizedTime};

/// How a source's records are identified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySpec {
    /// Several fields taken together, e.g. `(timestamp, currency_pair)`.
    Composite { fields: Vec<String> },
    /// A URL, canonicalised with [`normalize_url`] before use.
    Url { field: String },
    /// An opaque stable reference issued by the source API.
    Reference { field: String },
}

impl KeySpec {
    pub fn composite<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        KeySpec::Composite {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn url(field: impl Into<String>) -> Self {
        KeySpec::Url {
            field: field.into(),
        }
    }

    pub fn reference(field: impl Into<String>) -> Self {
        KeySpec::Reference {
            field: field.into(),
        }
    }

    /// Fields the key is computed from.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            KeySpec::Composite { fields } => fields.iter().map(String::as_str).collect(),
            KeySpec::Url { field } | KeySpec::Reference { field } => vec![field.as_str()],
        }
    }
}

/// Derives the natural key from `fields` alone, so the result never depends on fetch
/// order or listing position.
pub fn derive_key(fields: &Fields, spec: &KeySpec) -> Result<NaturalKey, CoreError> {
    match spec {
        KeySpec::Composite { fields: names } => {
            let parts = names
                .iter()
                .map(|name| key_component(fields, name))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(NaturalKey::from_parts(&parts))
        }
        KeySpec::Url { field } => {
            let raw = key_component(fields, field)?;
            normalize_url(&raw)
                .map(NaturalKey::new)
                .ok_or_else(|| CoreError::KeyDerivation {
                    field: field.clone(),
                    problem: format!("not an http(s) URL: {raw:?}"),
                })
        }
        KeySpec::Reference { field } => key_component(fields, field).map(NaturalKey::new),
    }
}

fn key_component(fields: &Fields, name: &str) -> Result<String, CoreError> {
    let problem = |p: &str| CoreError::KeyDerivation {
        field: name.to_string(),
        problem: p.to_string(),
    };
    match fields.get(name) {
        None => Err(problem("missing")),
        Some(FieldValue::Null) => Err(problem("null")),
        Some(FieldValue::Text(s)) if s.trim().is_empty() => Err(problem("empty")),
        Some(FieldValue::Text(s)) => Ok(s.trim().to_string()),
        Some(FieldValue::Number(n)) if !n.is_finite() => Err(problem("not finite")),
        Some(FieldValue::Number(n)) => Ok(n.to_string()),
        Some(FieldValue::Bool(b)) => Ok(b.to_string()),
    }
}

const TRACKING_PARAMS: &[&str] = &["_dt", "fbclid", "gclid", "modal", "ref", "mc_cid", "mc_eid"];

/// Canonical form of an http(s) URL: https scheme, no `www.` prefix, no fragment,
/// tracking parameters stripped, remaining query pairs sorted, no trailing slash.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut parsed = url::Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.set_scheme("https").ok()?;
    parsed.set_fragment(None);

    let host = parsed.host_str()?.to_ascii_lowercase();
    if let Some(stripped) = host.strip_prefix("www.") {
        let stripped = stripped.to_string();
        parsed.set_host(Some(&stripped)).ok()?;
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    Some(parsed.to_string())
}

/// Per-source timezone used for offset-naive timestamps. There is deliberately no
/// `Default`: every source names its zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceClock {
    tz: Tz,
}

impl SourceClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn parse(name: &str) -> Result<Self, String> {
        name.parse::<Tz>()
            .map(Self::new)
            .map_err(|e| format!("unknown timezone {name:?}: {e}"))
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    fn localize(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
            // DST fold: the earlier of the two instants.
            LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            LocalResult::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ParseStrategy {
    Rfc3339,
    Rfc2822,
    Offset(&'static str),
    Naive(&'static str),
    Epoch,
}

const STRATEGIES: &[ParseStrategy] = &[
    ParseStrategy::Rfc3339,
    ParseStrategy::Rfc2822,
    ParseStrategy::Offset("%Y-%m-%dT%H:%M:%S%z"),
    ParseStrategy::Offset("%Y-%m-%d %H:%M:%S%z"),
    ParseStrategy::Naive("%Y-%m-%dT%H:%M:%S"),
    ParseStrategy::Naive("%Y-%m-%dT%H:%M:%S%.f"),
    ParseStrategy::Naive("%Y-%m-%d %H:%M:%S"),
    ParseStrategy::Naive("%Y-%m-%dT%H:%M"),
    ParseStrategy::Naive("%Y-%m-%d %H:%M"),
    ParseStrategy::Naive("%a, %d %b %Y %H:%M:%S"),
    ParseStrategy::Epoch,
];

impl ParseStrategy {
    fn apply(self, raw: &str, clock: &SourceClock) -> Option<DateTime<Utc>> {
        match self {
            ParseStrategy::Rfc3339 => DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            ParseStrategy::Rfc2822 => DateTime::parse_from_rfc2822(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            ParseStrategy::Offset(fmt) => DateTime::parse_from_str(raw, fmt)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            ParseStrategy::Naive(fmt) => NaiveDateTime::parse_from_str(raw, fmt)
                .ok()
                .and_then(|naive| clock.localize(naive)),
            ParseStrategy::Epoch => parse_epoch(raw),
        }
    }
}

/// Unix epoch in seconds (up to 11 digits) or milliseconds (12 to 14 digits).
fn parse_epoch(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: i64 = raw.parse().ok()?;
    match raw.len() {
        1..=11 => DateTime::from_timestamp(value, 0),
        12..=14 => DateTime::from_timestamp_millis(value),
        _ => None,
    }
}

/// Tries each known format in order and returns the first success. Offset-aware inputs
/// convert directly; offset-naive inputs are read in the source's clock.
pub fn normalize_timestamp(raw: &str, clock: &SourceClock) -> NormalizedTime {
    let trimmed = raw.trim();
    STRATEGIES
        .iter()
        .find_map(|strategy| strategy.apply(trimmed, clock))
        .map(NormalizedTime::Utc)
        .unwrap_or_else(|| NormalizedTime::Unknown(raw.to_string()))
}

/// Canonical UTC text form used inside keys and persisted fields.
pub fn format_utc(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warsaw() -> SourceClock {
        SourceClock::parse("Europe/Warsaw").unwrap()
    }

    fn utc(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn naive_timestamps_use_the_source_timezone() {
        let summer = normalize_timestamp("2025-06-15 14:00:00", &warsaw());
        assert_eq!(summer, NormalizedTime::Utc(utc("2025-06-15T12:00:00Z")));

        let winter = normalize_timestamp("2025-01-15T14:00", &warsaw());
        assert_eq!(winter, NormalizedTime::Utc(utc("2025-01-15T13:00:00Z")));
    }

    #[test]
    fn explicit_offsets_convert_directly() {
        let clock = warsaw();
        assert_eq!(
            normalize_timestamp("2025-06-15T14:00:00+02:00", &clock).known(),
            Some(utc("2025-06-15T12:00:00Z"))
        );
        assert_eq!(
            normalize_timestamp("Sun, 15 Jun 2025 14:00:00 +0000", &clock).known(),
            Some(utc("2025-06-15T14:00:00Z"))
        );
    }

    #[test]
    fn rss_date_without_offset_is_local() {
        let ts = normalize_timestamp("Sun, 15 Jun 2025 14:00:00", &warsaw());
        assert_eq!(ts.known(), Some(utc("2025-06-15T12:00:00Z")));
    }

    #[test]
    fn unparseable_and_dst_gap_resolve_to_unknown() {
        assert_eq!(
            normalize_timestamp("yesterday-ish", &warsaw()),
            NormalizedTime::Unknown("yesterday-ish".into())
        );
        // 02:30 does not exist in Warsaw on the spring-forward night.
        assert!(normalize_timestamp("2025-03-30 02:30:00", &warsaw()).is_unknown());
    }

    #[test]
    fn dst_fold_picks_the_earlier_instant() {
        let ts = normalize_timestamp("2025-10-26 02:30:00", &warsaw());
        assert_eq!(ts.known(), Some(utc("2025-10-26T00:30:00Z")));
    }

    #[test]
    fn epoch_seconds_and_millis() {
        let clock = warsaw();
        assert_eq!(
            normalize_timestamp("1749988800", &clock).known(),
            Some(utc("2025-06-15T12:00:00Z"))
        );
        assert_eq!(
            normalize_timestamp("1749988800000", &clock).known(),
            Some(utc("2025-06-15T12:00:00Z"))
        );
    }

    #[test]
    fn unknown_timezone_names_are_refused() {
        assert!(SourceClock::parse("Mars/Olympus").is_err());
    }

    #[test]
    fn url_normalization_merges_tracking_and_cosmetic_variants() {
        let a = normalize_url("http://www.pracuj.pl/praca/rust-dev,oferta,1004604482?utm_source=x#top");
        let b = normalize_url("https://pracuj.pl/praca/rust-dev,oferta,1004604482/");
        assert_eq!(a, b);
        assert_eq!(
            a.as_deref(),
            Some("https://pracuj.pl/praca/rust-dev,oferta,1004604482")
        );
    }

    #[test]
    fn url_normalization_keeps_meaningful_query_sorted() {
        let a = normalize_url("https://example.com/jobs?page=2&category=backend").unwrap();
        let b = normalize_url("https://example.com/jobs?category=backend&page=2&gclid=abc").unwrap();
        assert_eq!(a, b);
        assert!(normalize_url("ftp://example.com/file").is_none());
        assert!(normalize_url("not a url").is_none());
    }

    #[test]
    fn composite_keys_are_derived_from_fields_only() {
        let mut fields = Fields::new();
        fields.insert("timestamp".into(), FieldValue::text("2025-06-15T12:00:00Z"));
        fields.insert("currency_pair".into(), FieldValue::text("EUR/PLN"));
        fields.insert("open".into(), FieldValue::Number(4.25));
        let spec = KeySpec::composite(["timestamp", "currency_pair"]);

        let key = derive_key(&fields, &spec).unwrap();
        assert_eq!(key.as_str(), "2025-06-15T12:00:00Z|EUR/PLN");

        fields.insert("open".into(), FieldValue::Number(4.30));
        assert_eq!(derive_key(&fields, &spec).unwrap(), key);
    }

    #[test]
    fn missing_key_component_is_an_error() {
        let fields = Fields::new();
        let err = derive_key(&fields, &KeySpec::reference("reference")).unwrap_err();
        assert!(matches!(err, CoreError::KeyDerivation { ref field, .. } if field == "reference"));
    }

    #[test]
    fn numeric_references_are_stringified() {
        let mut fields = Fields::new();
        fields.insert("offer_id".into(), FieldValue::Number(1004604482.0));
        let key = derive_key(&fields, &KeySpec::reference("offer_id")).unwrap();
        assert_eq!(key.as_str(), "1004604482");
    }
}
