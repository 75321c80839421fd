//! Paginated HTML listing pages keyed by canonical offer URL.

use std::collections::BTreeSet;

use async_trait::async_trait;
use recon_core::{normalize_url, FieldValue, Fields, KeySpec, RuleSet};
use recon_storage::{ColumnKind, HttpFetcher, TableSpec};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    text_or_none, AdapterError, DetailEnricher, FetchContext, Part, RecordProfile, Snapshot,
    SnapshotFetcher,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub category: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSettings {
    pub targets: Vec<ListingTarget>,
    /// Substring that marks an offer link, e.g. `,oferta,`.
    pub link_pattern: String,
    pub page_param: String,
    pub max_pages: u32,
    /// Selector for the offer body on detail pages. Detail enrichment is off without it.
    pub detail_selector: Option<String>,
    pub table: String,
}

impl Default for ListingSettings {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            link_pattern: ",oferta,".into(),
            page_param: "pn".into(),
            max_pages: 10,
            detail_selector: None,
            table: "listing_offers".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HtmlListingAdapter {
    source_id: String,
    settings: ListingSettings,
}

impl HtmlListingAdapter {
    pub fn new(source_id: impl Into<String>, settings: ListingSettings) -> Self {
        Self {
            source_id: source_id.into(),
            settings,
        }
    }

    async fn fetch_target(
        &self,
        http: &HttpFetcher,
        target: &ListingTarget,
    ) -> Result<Part, AdapterError> {
        let mut seen = BTreeSet::new();
        let mut rows = Vec::new();
        let max_pages = self.settings.max_pages.max(1);
        for page in 1..=max_pages {
            let query = if page == 1 {
                Vec::new()
            } else {
                vec![(self.settings.page_param.as_str(), page.to_string())]
            };
            let response = http.get_bytes(&self.source_id, &target.url, &query).await?;
            let offers = parse_listing(
                &response.text(),
                response.final_url.as_str(),
                &self.settings.link_pattern,
            )?;
            let before = rows.len();
            for mut offer in offers {
                let Some(url) = offer.get("url").and_then(FieldValue::as_str) else {
                    continue;
                };
                if seen.insert(url.to_string()) {
                    offer.insert("category".into(), FieldValue::text(&target.category));
                    rows.push(offer);
                }
            }
            debug!(category = %target.category, page, added = rows.len() - before, "listing page");
            // A page with nothing new means we ran past the last one.
            if rows.len() == before {
                return Ok(rows.into());
            }
        }
        warn!(category = %target.category, max_pages, "page cap reached with offers still coming");
        Ok(Part::truncated(
            rows,
            format!("page cap of {max_pages} reached with new offers on the last page"),
        ))
    }
}

fn profile(table: &str) -> RecordProfile {
    let table = TableSpec::new(table)
        .column("url", ColumnKind::Text)
        .column("offer_id", ColumnKind::Text)
        .column("category", ColumnKind::Text)
        .column("job_title", ColumnKind::Text)
        .column("description", ColumnKind::Text)
        .column("body_html", ColumnKind::Text);
    RecordProfile {
        key: KeySpec::url("url"),
        rules: RuleSet {
            required: vec!["url".into()],
            ..RuleSet::default()
        },
        timestamp_field: None,
        table,
    }
}

#[async_trait]
impl SnapshotFetcher for HtmlListingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn profile(&self) -> RecordProfile {
        profile(&self.settings.table)
    }

    async fn fetch_snapshot(
        &self,
        http: &HttpFetcher,
        _ctx: &FetchContext,
    ) -> Result<Snapshot, AdapterError> {
        let mut parts = Vec::with_capacity(self.settings.targets.len());
        for target in &self.settings.targets {
            let result = self.fetch_target(http, target).await;
            match &result {
                Ok(part) => info!(category = %target.category, offers = part.records.len(), "fetched listing"),
                Err(err) => warn!(category = %target.category, error = %err, "listing failed"),
            }
            parts.push((target.category.clone(), result));
        }
        Snapshot::from_parts(parts)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::parse(format!("selector {css}"), e))
}

/// Extracts offer links from one listing page. Links are resolved against `base_url` and
/// canonicalised; the first occurrence of each offer wins.
pub fn parse_listing(
    html: &str,
    base_url: &str,
    link_pattern: &str,
) -> Result<Vec<Fields>, AdapterError> {
    let base = Url::parse(base_url).map_err(|e| AdapterError::parse("listing url", e))?;
    let document = Html::parse_document(html);
    let anchors = selector("a[href]")?;

    let mut seen = BTreeSet::new();
    let mut offers = Vec::new();
    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !href.contains(link_pattern) {
            continue;
        }
        let Some(url) = base.join(href).ok().and_then(|u| normalize_url(u.as_str())) else {
            continue;
        };
        if !seen.insert(url.clone()) {
            continue;
        }
        let title = text_or_none(anchor.text().collect::<Vec<_>>().join(" "))
            .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "));

        let mut fields = Fields::new();
        fields.insert("offer_id".into(), offer_id(&url, link_pattern).into());
        fields.insert("url".into(), FieldValue::text(url));
        fields.insert("job_title".into(), title.into());
        offers.push(fields);
    }
    Ok(offers)
}

/// Leading digits after the link pattern, e.g. `123` in `/praca/x,oferta,123?s=1`.
fn offer_id(url: &str, link_pattern: &str) -> Option<String> {
    let (_, rest) = url.split_once(link_pattern)?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    text_or_none(digits)
}

/// Fetches an offer page and pulls its title, meta description and body.
#[derive(Debug, Clone)]
pub struct HtmlDetailEnricher {
    source_id: String,
    settings: ListingSettings,
}

impl HtmlDetailEnricher {
    pub fn new(source_id: impl Into<String>, settings: ListingSettings) -> Self {
        Self {
            source_id: source_id.into(),
            settings,
        }
    }
}

#[async_trait]
impl DetailEnricher for HtmlDetailEnricher {
    async fn enrich(
        &self,
        http: &HttpFetcher,
        _ctx: &FetchContext,
        listing: &Fields,
    ) -> Result<Fields, AdapterError> {
        let url = listing
            .get("url")
            .and_then(FieldValue::as_str)
            .ok_or_else(|| AdapterError::parse("listing", "missing url"))?;
        let body_selector = self.settings.detail_selector.as_deref().unwrap_or("main");
        let response = http.get_bytes(&self.source_id, url, &[]).await?;
        parse_detail(&response.text(), body_selector)
    }
}

pub fn parse_detail(html: &str, body_selector: &str) -> Result<Fields, AdapterError> {
    let document = Html::parse_document(html);
    let h1 = selector("h1")?;
    let meta = selector("meta[name=\"description\"]")?;
    let body = selector(body_selector)?;

    let title = document
        .select(&h1)
        .next()
        .and_then(|el| text_or_none(el.text().collect::<String>()));
    let description = document
        .select(&meta)
        .next()
        .and_then(|el| el.value().attr("content"))
        .and_then(text_or_none);
    let body_html = document
        .select(&body)
        .next()
        .and_then(|el| text_or_none(el.inner_html()));

    let mut fields = Fields::new();
    // Keep the listing title when the detail page has no heading.
    if let Some(title) = title {
        fields.insert("job_title".into(), FieldValue::text(title));
    }
    fields.insert("description".into(), description.into());
    fields.insert("body_html".into(), body_html.into());
    Ok(fields)
}
