//! Headlines from RSS/Atom feeds, keyed by canonical article URL.
//!
//! Feeds have no history paging; each fetch is the feed's current window.

use std::collections::BTreeSet;

use async_trait::async_trait;
use recon_core::{format_utc, normalize_url, FieldValue, Fields, KeySpec, RuleSet};
use recon_storage::{ColumnKind, HttpFetcher, TableSpec};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{text_or_none, AdapterError, FetchContext, RecordProfile, Snapshot, SnapshotFetcher};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsFeed {
    /// Stored as the `source` column.
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsSettings {
    pub feeds: Vec<NewsFeed>,
    /// Headlines containing any of these (case-insensitive) are dropped.
    pub spam_phrases: Vec<String>,
    pub min_title_length: usize,
    pub table: String,
}

impl Default for NewsSettings {
    fn default() -> Self {
        Self {
            feeds: Vec::new(),
            spam_phrases: Vec::new(),
            min_title_length: 15,
            table: "news_headlines".into(),
        }
    }
}

impl NewsSettings {
    /// Why a headline is spam, if it is.
    pub fn spam_reason(&self, title: &str) -> Option<String> {
        let title = title.trim();
        if title.chars().count() < self.min_title_length {
            return Some(format!("shorter than {} chars", self.min_title_length));
        }
        let lower = title.to_lowercase();
        self.spam_phrases
            .iter()
            .find(|phrase| lower.contains(&phrase.to_lowercase()))
            .map(|phrase| format!("contains {phrase:?}"))
    }
}

#[derive(Debug, Clone)]
pub struct NewsAdapter {
    source_id: String,
    settings: NewsSettings,
}

impl NewsAdapter {
    pub fn new(source_id: impl Into<String>, settings: NewsSettings) -> Self {
        Self {
            source_id: source_id.into(),
            settings,
        }
    }
}

#[async_trait]
impl SnapshotFetcher for NewsAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn profile(&self) -> RecordProfile {
        let table = TableSpec::new(self.settings.table.clone())
            .column("url", ColumnKind::Text)
            .column("source", ColumnKind::Text)
            .column("title", ColumnKind::Text)
            .column("published_at", ColumnKind::Timestamp);
        RecordProfile {
            key: KeySpec::url("url"),
            rules: RuleSet {
                required: vec!["url".into(), "title".into()],
                ..RuleSet::default()
            },
            timestamp_field: Some("published_at".into()),
            table,
        }
    }

    async fn fetch_snapshot(
        &self,
        http: &HttpFetcher,
        _ctx: &FetchContext,
    ) -> Result<Snapshot, AdapterError> {
        let mut seen = BTreeSet::new();
        let mut parts = Vec::with_capacity(self.settings.feeds.len());
        for feed in &self.settings.feeds {
            let result = match http.get_bytes(&self.source_id, &feed.url, &[]).await {
                Ok(response) => parse_feed(&feed.name, &response.body, &self.settings, &mut seen),
                Err(err) => Err(err.into()),
            };
            match &result {
                Ok(rows) => info!(feed = %feed.name, headlines = rows.len(), "fetched feed"),
                Err(err) => warn!(feed = %feed.name, error = %err, "feed failed"),
            }
            parts.push((feed.name.clone(), result));
        }
        Snapshot::from_parts(parts)
    }
}

/// Parses one feed document. `seen` holds canonical URLs already taken from earlier
/// feeds in this run; the first feed to carry an article keeps it.
pub fn parse_feed(
    name: &str,
    body: &[u8],
    settings: &NewsSettings,
    seen: &mut BTreeSet<String>,
) -> Result<Vec<Fields>, AdapterError> {
    let feed = feed_rs::parser::parse(body).map_err(|e| AdapterError::parse(format!("feed {name}"), e))?;

    let (mut spam, mut duplicates) = (0usize, 0usize);
    let mut rows = Vec::new();
    for entry in feed.entries {
        let Some(link) = entry
            .links
            .first()
            .map(|l| l.href.clone())
            .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))
        else {
            continue;
        };
        let Some(canonical) = normalize_url(&link) else {
            continue;
        };
        if !seen.insert(canonical) {
            duplicates += 1;
            continue;
        }
        let title = entry
            .title
            .map(|t| t.content)
            .and_then(text_or_none)
            .unwrap_or_default();
        if let Some(reason) = settings.spam_reason(&title) {
            debug!(feed = name, %title, %reason, "spam headline dropped");
            spam += 1;
            continue;
        }

        let mut fields = Fields::new();
        fields.insert("url".into(), FieldValue::text(link));
        fields.insert("source".into(), FieldValue::text(name));
        fields.insert("title".into(), FieldValue::text(title));
        fields.insert(
            "published_at".into(),
            entry.published.or(entry.updated).map(format_utc).into(),
        );
        rows.push(fields);
    }
    info!(feed = name, accepted = rows.len(), spam, duplicates, "feed parsed");
    Ok(rows)
}
