//! Job postings from the No Fluff Jobs search API, with per-posting detail enrichment.

use async_trait::async_trait;
use chrono::DateTime;
use recon_core::{format_utc, FieldValue, Fields, KeySpec, NumericRule, OrderingRule, RuleSet};
use recon_storage::{ColumnKind, HttpFetcher, TableSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{
    json_at, json_str, json_string_list, text_or_none, AdapterError, DetailEnricher, FetchContext,
    Part, RecordProfile, Snapshot, SnapshotFetcher,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSearchSettings {
    pub search_url: String,
    pub posting_url: String,
    /// Prefix of the public job page; the posting slug is appended.
    pub job_page_url: String,
    pub categories: Vec<String>,
    pub currency: String,
    pub max_pages: u32,
    pub table: String,
}

impl Default for JobSearchSettings {
    fn default() -> Self {
        Self {
            search_url: "https://nofluffjobs.com/api/search/posting".into(),
            posting_url: "https://nofluffjobs.com/api/posting".into(),
            job_page_url: "https://nofluffjobs.com/pl/job".into(),
            categories: [
                "data",
                "artificial-intelligence",
                "project-manager",
                "business-analyst",
                "marketing",
                "sales",
                "finance",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            currency: "PLN".into(),
            max_pages: 20,
            table: "job_postings".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSearchAdapter {
    source_id: String,
    settings: JobSearchSettings,
}

impl JobSearchAdapter {
    pub fn new(source_id: impl Into<String>, settings: JobSearchSettings) -> Self {
        Self {
            source_id: source_id.into(),
            settings,
        }
    }

    async fn fetch_category(
        &self,
        http: &HttpFetcher,
        category: &str,
    ) -> Result<Part, AdapterError> {
        let body = json!({
            "criteriaSearch": {
                "category": [category],
                "withSalaryMatch": ["true"],
            }
        });
        let mut rows = Vec::new();
        let mut page = 1u32;
        loop {
            let query = [
                ("salaryCurrency", self.settings.currency.clone()),
                ("salaryPeriod", "month".to_string()),
                ("page", page.to_string()),
            ];
            let response: JsonValue = http
                .post_json(&self.source_id, &self.settings.search_url, &query, &body)
                .await?;
            let postings = response
                .get("postings")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| AdapterError::parse(format!("search page {page}"), "missing postings"))?;
            rows.extend(
                postings
                    .iter()
                    .filter_map(|p| flatten_posting(p, category, &self.settings.job_page_url)),
            );

            let total_pages = response
                .get("totalPages")
                .and_then(JsonValue::as_u64)
                .unwrap_or(1);
            debug!(category, page, total_pages, rows = rows.len(), "search page");
            if postings.is_empty() || u64::from(page) >= total_pages {
                break;
            }
            if page >= self.settings.max_pages {
                warn!(category, page, total_pages, "page cap reached");
                return Ok(Part::truncated(
                    rows,
                    format!("stopped at page {page} of {total_pages}"),
                ));
            }
            page += 1;
        }
        Ok(rows.into())
    }
}

fn profile(table: &str) -> RecordProfile {
    let rules = RuleSet {
        required: vec!["reference".into(), "job_title".into(), "url".into()],
        numeric: vec![
            NumericRule {
                min: Some(0.0),
                ..NumericRule::new("salary_from")
            },
            NumericRule {
                min: Some(0.0),
                ..NumericRule::new("salary_to")
            },
        ],
        ordering: vec![OrderingRule::new("salary_to", "salary_from")],
    };
    let table = TableSpec::new(table)
        .column("reference", ColumnKind::Text)
        .column("posting_id", ColumnKind::Text)
        .column("category", ColumnKind::Text)
        .column("job_title", ColumnKind::Text)
        .column("company", ColumnKind::Text)
        .column("location", ColumnKind::Text)
        .column("work_mode", ColumnKind::Text)
        .column("salary_from", ColumnKind::Float)
        .column("salary_to", ColumnKind::Float)
        .column("salary_currency", ColumnKind::Text)
        .column("salary_type", ColumnKind::Text)
        .column("url", ColumnKind::Text)
        .column("published_at", ColumnKind::Timestamp)
        .column("skills_required", ColumnKind::Text)
        .column("skills_nice_to_have", ColumnKind::Text)
        .column("requirements_expected", ColumnKind::Text)
        .column("body_html", ColumnKind::Text)
        .column("nfj_category", ColumnKind::Text)
        .column("position_level", ColumnKind::Text)
        .column("contract_types", ColumnKind::Text);
    RecordProfile {
        key: KeySpec::reference("reference"),
        rules,
        timestamp_field: Some("published_at".into()),
        table,
    }
}

#[async_trait]
impl SnapshotFetcher for JobSearchAdapter {
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
        let mut parts = Vec::with_capacity(self.settings.categories.len());
        for category in &self.settings.categories {
            let result = self.fetch_category(http, category).await;
            match &result {
                Ok(part) => info!(category = %category, postings = part.records.len(), "fetched postings"),
                Err(err) => warn!(category = %category, error = %err, "category failed"),
            }
            parts.push((category.clone(), result));
        }
        Snapshot::from_parts(parts)
    }
}

/// Flattens one search hit. Hits without an id are skipped since they cannot be keyed or
/// enriched.
pub fn flatten_posting(posting: &JsonValue, category: &str, job_page_url: &str) -> Option<Fields> {
    let id = json_str(posting, &["id"]).and_then(text_or_none)?;
    let reference = json_str(posting, &["reference"])
        .and_then(text_or_none)
        .unwrap_or_else(|| id.clone());
    let slug = json_str(posting, &["url"])
        .or_else(|| json_str(posting, &["defaultUrl"]))
        .and_then(text_or_none)
        .unwrap_or_else(|| id.clone());

    let mut fields = Fields::new();
    fields.insert("reference".into(), FieldValue::text(reference));
    fields.insert("posting_id".into(), FieldValue::text(&id));
    fields.insert("category".into(), FieldValue::text(category));
    fields.insert("job_title".into(), json_str(posting, &["title"]).and_then(text_or_none).into());
    fields.insert("company".into(), json_str(posting, &["name"]).and_then(text_or_none).into());
    fields.insert("location".into(), location_of(posting).into());
    fields.insert("work_mode".into(), work_mode_of(posting).into());
    fields.insert("url".into(), FieldValue::text(format!("{}/{slug}", job_page_url.trim_end_matches('/'))));

    let salary = posting.get("salary");
    let salary_num = |name: &str| salary.and_then(|s| s.get(name)).and_then(JsonValue::as_f64);
    let salary_text = |name: &str| {
        salary
            .and_then(|s| s.get(name))
            .and_then(JsonValue::as_str)
            .map(String::from)
    };
    fields.insert("salary_from".into(), salary_num("from").into());
    fields.insert("salary_to".into(), salary_num("to").into());
    fields.insert("salary_currency".into(), salary_text("currency").into());
    fields.insert("salary_type".into(), salary_text("type").into());

    let published = posting
        .get("posted")
        .and_then(JsonValue::as_i64)
        .and_then(DateTime::from_timestamp_millis)
        .map(format_utc);
    fields.insert("published_at".into(), published.into());
    Some(fields)
}

fn location_of(posting: &JsonValue) -> Option<String> {
    let places = json_at(posting, &["location", "places"])?.as_array()?;
    let mut cities: Vec<String> = places
        .iter()
        .filter_map(|p| json_str(p, &["city"]).and_then(text_or_none))
        .collect();
    cities.dedup();
    if cities.is_empty() {
        None
    } else {
        Some(cities.join("; "))
    }
}

fn work_mode_of(posting: &JsonValue) -> Option<String> {
    let location = posting.get("location")?;
    if location.get("fullyRemote").and_then(JsonValue::as_bool) == Some(true) {
        return Some("remote".into());
    }
    let hybrid = location
        .get("hybridDesc")
        .and_then(JsonValue::as_str)
        .is_some_and(|d| !d.trim().is_empty());
    Some(if hybrid { "hybrid" } else { "office" }.into())
}

/// Fetches the full posting for a listing row.
#[derive(Debug, Clone)]
pub struct JobDetailEnricher {
    source_id: String,
    settings: JobSearchSettings,
}

impl JobDetailEnricher {
    pub fn new(source_id: impl Into<String>, settings: JobSearchSettings) -> Self {
        Self {
            source_id: source_id.into(),
            settings,
        }
    }
}

#[async_trait]
impl DetailEnricher for JobDetailEnricher {
    async fn enrich(
        &self,
        http: &HttpFetcher,
        _ctx: &FetchContext,
        listing: &Fields,
    ) -> Result<Fields, AdapterError> {
        let id = listing
            .get("posting_id")
            .and_then(FieldValue::as_str)
            .ok_or_else(|| AdapterError::parse("listing", "missing posting_id"))?;
        let url = format!("{}/{id}", self.settings.posting_url.trim_end_matches('/'));
        let detail: JsonValue = http.get_json(&self.source_id, &url, &[]).await?;
        Ok(parse_detail(&detail))
    }
}

pub fn parse_detail(detail: &JsonValue) -> Fields {
    let mut fields = Fields::new();
    fields.insert(
        "skills_required".into(),
        json_string_list(detail, &["requirements", "musts"]).into(),
    );
    fields.insert(
        "skills_nice_to_have".into(),
        json_string_list(detail, &["requirements", "nices"]).into(),
    );
    fields.insert(
        "requirements_expected".into(),
        json_str(detail, &["requirements", "description"]).and_then(text_or_none).into(),
    );

    let sections = [
        (
            "Description",
            json_str(detail, &["details", "description"]).and_then(text_or_none),
        ),
        ("Daily tasks", json_string_list(detail, &["specs", "dailyTasks"])),
        (
            "Requirements",
            json_str(detail, &["requirements", "description"]).and_then(text_or_none),
        ),
    ];
    let mut body = String::new();
    for (heading, html) in sections {
        if let Some(html) = html {
            body.push_str(&format!("<h3>{heading}</h3>\n{html}\n"));
        }
    }
    fields.insert("body_html".into(), text_or_none(&body).into());

    fields.insert(
        "nfj_category".into(),
        json_str(detail, &["basics", "category"]).and_then(text_or_none).into(),
    );
    fields.insert(
        "position_level".into(),
        json_string_list(detail, &["basics", "seniority"]).into(),
    );
    let contracts = json_at(detail, &["essentials", "originalSalary", "types"])
        .and_then(JsonValue::as_object)
        .map(|types| types.keys().cloned().collect::<Vec<_>>().join("; "))
        .and_then(text_or_none);
    fields.insert("contract_types".into(), contracts.into());
    fields
}

#[cfg(test)]
mod tests {
    use recon_core::{derive_key, validate};

    use super::*;

    const PAGE: &str = "https://nofluffjobs.com/pl/job";

    fn posting() -> JsonValue {
        json!({
            "id": "XKQ2PLMN",
            "reference": "XKQ2PLMN",
            "url": "senior-data-engineer-acme-warszawa",
            "title": "Senior Data Engineer ",
            "name": "Acme",
            "posted": 1749988800000i64,
            "location": {
                "places": [{"city": "Warszawa"}, {"city": "Warszawa"}, {"city": "Krakow"}],
                "fullyRemote": false,
                "hybridDesc": "2 days in office"
            },
            "salary": {"from": 25000, "to": 32000, "currency": "PLN", "type": "b2b"}
        })
    }

    #[test]
    fn search_hit_is_flattened() {
        let fields = flatten_posting(&posting(), "data", PAGE).unwrap();
        assert_eq!(fields.get("job_title"), Some(&FieldValue::text("Senior Data Engineer")));
        assert_eq!(fields.get("location"), Some(&FieldValue::text("Warszawa; Krakow")));
        assert_eq!(fields.get("work_mode"), Some(&FieldValue::text("hybrid")));
        assert_eq!(fields.get("salary_from"), Some(&FieldValue::Number(25000.0)));
        assert_eq!(
            fields.get("url"),
            Some(&FieldValue::text(
                "https://nofluffjobs.com/pl/job/senior-data-engineer-acme-warszawa"
            ))
        );
        assert_eq!(
            fields.get("published_at"),
            Some(&FieldValue::text("2025-06-15T12:00:00Z"))
        );

        let profile = profile("job_postings");
        assert!(validate(&fields, &profile.rules).is_accepted());
        assert_eq!(derive_key(&fields, &profile.key).unwrap().as_str(), "XKQ2PLMN");
    }

    #[test]
    fn hits_without_id_are_skipped() {
        assert!(flatten_posting(&json!({"title": "No id"}), "data", PAGE).is_none());
    }

    #[test]
    fn inverted_salary_range_is_rejected() {
        let mut hit = posting();
        hit["salary"] = json!({"from": 32000, "to": 25000, "currency": "PLN"});
        let fields = flatten_posting(&hit, "data", PAGE).unwrap();
        assert!(!validate(&fields, &profile("job_postings").rules).is_accepted());
    }

    #[test]
    fn detail_sections_are_collected() {
        let detail = json!({
            "basics": {"category": "data", "seniority": ["Senior"]},
            "requirements": {
                "musts": [{"value": "SQL"}, {"value": "Python"}],
                "nices": ["dbt"],
                "description": "<p>5 years</p>"
            },
            "details": {"description": "<p>We build pipelines.</p>"},
            "specs": {"dailyTasks": ["Model data", "Review code"]},
            "essentials": {"originalSalary": {"types": {"b2b": {}, "permanent": {}}}}
        });
        let fields = parse_detail(&detail);
        assert_eq!(fields.get("skills_required"), Some(&FieldValue::text("SQL; Python")));
        assert_eq!(fields.get("skills_nice_to_have"), Some(&FieldValue::text("dbt")));
        assert_eq!(fields.get("position_level"), Some(&FieldValue::text("Senior")));
        assert_eq!(fields.get("contract_types"), Some(&FieldValue::text("b2b; permanent")));
        let body = fields.get("body_html").and_then(FieldValue::as_str).unwrap();
        assert!(body.starts_with("<h3>Description</h3>"));
        assert!(body.contains("<h3>Daily tasks</h3>\nModel data; Review code"));
        assert!(body.contains("<h3>Requirements</h3>\n<p>5 years</p>"));
    }

    #[test]
    fn empty_detail_yields_nulls() {
        let fields = parse_detail(&json!({}));
        assert!(fields.values().all(FieldValue::is_null));
    }
}
