//! Records as fetched from a source, before and after validation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single named value inside a record.
///
/// `Number` may hold NaN or infinities when it comes straight from a fetcher; the
/// validator is what turns those into rejections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Flat, ordered mapping of field name to value.
pub type Fields = BTreeMap<String, FieldValue>;

/// Stable identity of a logical record across runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Joins key components with `|`, escaping `\` and `|` inside components so that
    /// distinct component lists never collide.
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> Self {
        let joined = parts
            .iter()
            .map(|p| p.as_ref().replace('\\', "\\\\").replace('|', "\\|"))
            .collect::<Vec<_>>()
            .join("|");
        Self(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of timestamp normalization. Parsing never guesses: an unparseable input
/// stays `Unknown` with the raw text kept for triage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum NormalizedTime {
    Utc(DateTime<Utc>),
    Unknown(String),
}

impl NormalizedTime {
    pub fn known(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Utc(ts) => Some(*ts),
            Self::Unknown(_) => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

/// A validated, keyed record ready for reconciliation and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub natural_key: NaturalKey,
    pub fields: Fields,
    pub source_timestamp: Option<NormalizedTime>,
    pub fetch_timestamp: DateTime<Utc>,
}

impl Record {
    pub fn new(natural_key: NaturalKey, fields: Fields, fetch_timestamp: DateTime<Utc>) -> Self {
        Self {
            natural_key,
            fields,
            source_timestamp: None,
            fetch_timestamp,
        }
    }

    pub fn with_source_timestamp(mut self, ts: NormalizedTime) -> Self {
        self.source_timestamp = Some(ts);
        self
    }

    pub fn has_unknown_timestamp(&self) -> bool {
        self.source_timestamp
            .as_ref()
            .map(NormalizedTime::is_unknown)
            .unwrap_or(false)
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.fields)
    }
}

/// SHA-256 over the canonical JSON encoding of the fields. `Fields` is ordered, so the
/// hash does not depend on insertion order.
pub fn content_hash(fields: &Fields) -> String {
    let encoded = serde_json::to_vec(fields).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hex::encode(hasher.finalize())
}
