//! Postgres upsert target and known-state store.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{
    FieldValue, Fields, KnownStateEntry, KnownStateStore, NaturalKey, Record, StoreError,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Connection, Row};
use tracing::info;

use crate::retry::{execute_with_retry, RetryError, RetryPolicy};
use crate::writer::{PersistError, UpsertBackend};

const RESERVED_COLUMNS: &[&str] = &["natural_key", "source_timestamp", "fetched_at", "updated_at"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    #[default]
    Text,
    Float,
    Boolean,
    Timestamp,
    Json,
}

impl ColumnKind {
    fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Text => "TEXT",
            ColumnKind::Float => "DOUBLE PRECISION",
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Timestamp => "TIMESTAMPTZ",
            ColumnKind::Json => "JSONB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ColumnKind,
}

/// Target table for one source. The natural key is the primary key; every record field
/// listed in `columns` maps to a column of the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_identifier(&self.name)?;
        let mut seen = BTreeSet::new();
        for column in &self.columns {
            validate_identifier(&column.name)?;
            if RESERVED_COLUMNS.contains(&column.name.as_str()) {
                return Err(format!("column `{}` is reserved", column.name));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(format!("column `{}` listed twice", column.name));
            }
        }
        Ok(())
    }

    pub fn create_table_sql(&self) -> String {
        let mut lines = vec!["    natural_key TEXT PRIMARY KEY".to_string()];
        lines.extend(
            self.columns
                .iter()
                .map(|c| format!("    \"{}\" {}", c.name, c.kind.sql_type())),
        );
        lines.push("    source_timestamp TIMESTAMPTZ".into());
        lines.push("    fetched_at TIMESTAMPTZ NOT NULL".into());
        lines.push("    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()".into());
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\n{}\n)",
            self.name,
            lines.join(",\n")
        )
    }

    /// `INSERT .. ON CONFLICT (natural_key) DO UPDATE`. Parameters: `$1` natural key,
    /// then one per column, then source timestamp and fetch timestamp.
    pub fn upsert_sql(&self) -> String {
        let n = self.columns.len();
        let mut names = vec!["natural_key".to_string()];
        names.extend(self.columns.iter().map(|c| format!("\"{}\"", c.name)));
        names.extend(["source_timestamp", "fetched_at", "updated_at"].map(String::from));

        let mut params: Vec<String> = (1..=n + 3).map(|i| format!("${i}")).collect();
        params.push("NOW()".into());

        let mut updates: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("\"{0}\" = EXCLUDED.\"{0}\"", c.name))
            .collect();
        updates.push("source_timestamp = EXCLUDED.source_timestamp".into());
        updates.push("fetched_at = EXCLUDED.fetched_at".into());
        updates.push("updated_at = NOW()".into());

        format!(
            "INSERT INTO \"{}\" ({}) VALUES ({}) ON CONFLICT (natural_key) DO UPDATE SET {}",
            self.name,
            names.join(", "),
            params.join(", "),
            updates.join(", ")
        )
    }
}

fn validate_identifier(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && name.len() <= 63 {
        Ok(())
    } else {
        Err(format!("invalid SQL identifier {name:?}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum BoundValue {
    Text(Option<String>),
    Float(Option<f64>),
    Boolean(Option<bool>),
    Timestamp(Option<DateTime<Utc>>),
    Json(Option<serde_json::Value>),
}

fn bind_value(
    key: &NaturalKey,
    column: &ColumnSpec,
    value: Option<&FieldValue>,
) -> Result<BoundValue, PersistError> {
    let reject = |found: &FieldValue| PersistError::Rejected {
        key: key.to_string(),
        reason: format!("`{}` cannot hold {:?}", column.name, found),
    };
    let value = match value {
        None | Some(FieldValue::Null) => None,
        Some(v) => Some(v),
    };
    Ok(match column.kind {
        ColumnKind::Text => BoundValue::Text(value.map(|v| match v {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Null => String::new(),
        })),
        ColumnKind::Float => BoundValue::Float(
            value
                .map(|v| match v {
                    FieldValue::Number(n) => Ok(*n),
                    FieldValue::Text(s) => s.trim().parse::<f64>().map_err(|_| reject(v)),
                    other => Err(reject(other)),
                })
                .transpose()?,
        ),
        ColumnKind::Boolean => BoundValue::Boolean(
            value
                .map(|v| v.as_bool().ok_or_else(|| reject(v)))
                .transpose()?,
        ),
        ColumnKind::Timestamp => BoundValue::Timestamp(
            value
                .map(|v| {
                    v.as_str()
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.with_timezone(&Utc))
                        .ok_or_else(|| reject(v))
                })
                .transpose()?,
        ),
        ColumnKind::Json => BoundValue::Json(
            value
                .map(|v| serde_json::to_value(v).map_err(|_| reject(v)))
                .transpose()?,
        ),
    })
}

/// SQLSTATE classes that mean the server is unreachable or not accepting work yet.
fn is_connection_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03" | "53300")
}

fn is_connectivity(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().map(|c| is_connection_sqlstate(&c)).unwrap_or(false),
        _ => false,
    }
}

/// Errors while opening a connection or pool. Only unreachable servers are retried.
pub fn classify_connect_error(err: sqlx::Error) -> PersistError {
    if is_connectivity(&err) {
        PersistError::Connectivity(err.to_string())
    } else {
        PersistError::Refused(err.to_string())
    }
}

pub fn classify_sqlx_error(err: sqlx::Error, key: &str) -> PersistError {
    if is_connectivity(&err) {
        PersistError::Connectivity(err.to_string())
    } else {
        PersistError::Record {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgUpsertBackend {
    database_url: String,
    connect_timeout: Duration,
    statement_timeout: Duration,
    table: TableSpec,
    upsert_sql: String,
}

impl PgUpsertBackend {
    pub fn new(
        database_url: impl Into<String>,
        table: TableSpec,
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        table
            .validate()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("table spec for `{}`", table.name))?;
        let upsert_sql = table.upsert_sql();
        Ok(Self {
            database_url: database_url.into(),
            connect_timeout,
            statement_timeout: connect_timeout,
            table,
            upsert_sql,
        })
    }

    pub fn table(&self) -> &TableSpec {
        &self.table
    }
}

#[async_trait]
impl UpsertBackend for PgUpsertBackend {
    type Conn = PgConnection;

    async fn connect(&self) -> Result<PgConnection, PersistError> {
        match tokio::time::timeout(self.connect_timeout, PgConnection::connect(&self.database_url))
            .await
        {
            Err(_) => Err(PersistError::Connectivity(format!(
                "connect timed out after {}s",
                self.connect_timeout.as_secs()
            ))),
            Ok(Err(err)) => Err(classify_connect_error(err)),
            Ok(Ok(conn)) => Ok(conn),
        }
    }

    async fn upsert_record(
        &self,
        conn: &mut PgConnection,
        record: &Record,
    ) -> Result<(), PersistError> {
        let values = self
            .table
            .columns
            .iter()
            .map(|column| bind_value(&record.natural_key, column, record.fields.get(&column.name)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut query = sqlx::query(&self.upsert_sql).bind(record.natural_key.as_str());
        for value in values {
            query = match value {
                BoundValue::Text(v) => query.bind(v),
                BoundValue::Float(v) => query.bind(v),
                BoundValue::Boolean(v) => query.bind(v),
                BoundValue::Timestamp(v) => query.bind(v),
                BoundValue::Json(v) => query.bind(v.map(Json)),
            };
        }
        let source_timestamp = record.source_timestamp.as_ref().and_then(|ts| ts.known());
        query = query.bind(source_timestamp).bind(record.fetch_timestamp);

        match tokio::time::timeout(self.statement_timeout, query.execute(&mut *conn)).await {
            Err(_) => Err(PersistError::Connectivity(format!(
                "statement timed out after {}s",
                self.statement_timeout.as_secs()
            ))),
            Ok(Err(err)) => Err(classify_sqlx_error(err, record.natural_key.as_str())),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

pub const KNOWN_STATE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS known_state (
    source_id TEXT NOT NULL,
    natural_key TEXT NOT NULL,
    first_seen_at TIMESTAMPTZ NOT NULL,
    last_seen_at TIMESTAMPTZ NOT NULL,
    is_active BOOLEAN NOT NULL,
    content_hash TEXT,
    fields JSONB,
    enriched_at TIMESTAMPTZ,
    PRIMARY KEY (source_id, natural_key)
)
"#;

const KNOWN_STATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS known_state_active_idx ON known_state (source_id, is_active)";

/// Opens a pool, retrying connection failures per `retry`.
pub async fn connect_pool(
    database_url: &str,
    connect_timeout: Duration,
    retry: &RetryPolicy,
) -> Result<PgPool, PersistError> {
    execute_with_retry(retry, "connect pool", move |_| async move {
        PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .map_err(classify_connect_error)
    })
    .await
    .map_err(RetryError::into_inner)
}

/// Creates the known-state table and one table per source if missing.
pub async fn ensure_schema(pool: &PgPool, tables: &[TableSpec]) -> anyhow::Result<()> {
    sqlx::query(KNOWN_STATE_DDL)
        .execute(pool)
        .await
        .context("creating known_state")?;
    sqlx::query(KNOWN_STATE_INDEX)
        .execute(pool)
        .await
        .context("creating known_state index")?;
    for table in tables {
        table.validate().map_err(anyhow::Error::msg)?;
        sqlx::query(&table.create_table_sql())
            .execute(pool)
            .await
            .with_context(|| format!("creating table {}", table.name))?;
        info!(table = %table.name, "table ready");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgKnownStateStore {
    pool: PgPool,
    source_id: String,
    statement_timeout: Duration,
}

impl PgKnownStateStore {
    pub fn new(pool: PgPool, source_id: impl Into<String>) -> Self {
        Self {
            pool,
            source_id: source_id.into(),
            statement_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Runs one query under the statement timeout. The pool's acquire timeout only
    /// covers getting a connection.
    async fn bounded<T>(
        &self,
        what: &str,
        query: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.statement_timeout, query).await {
            Err(_) => Err(StoreError::Backend(format!(
                "{what} for {} timed out after {:?}",
                self.source_id, self.statement_timeout
            ))),
            Ok(result) => result.map_err(backend_error),
        }
    }
}

fn backend_error(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn row_to_entry(row: &PgRow) -> Result<KnownStateEntry, StoreError> {
    let corrupt = |err: sqlx::Error| StoreError::Corrupt(err.to_string());
    let fields: Option<Json<Fields>> = row.try_get("fields").map_err(corrupt)?;
    Ok(KnownStateEntry {
        key: NaturalKey::new(row.try_get::<String, _>("natural_key").map_err(corrupt)?),
        first_seen_at: row.try_get("first_seen_at").map_err(corrupt)?,
        last_seen_at: row.try_get("last_seen_at").map_err(corrupt)?,
        is_active: row.try_get("is_active").map_err(corrupt)?,
        content_hash: row.try_get("content_hash").map_err(corrupt)?,
        fields: fields.map(|Json(f)| f),
        enriched_at: row.try_get("enriched_at").map_err(corrupt)?,
    })
}

#[async_trait]
impl KnownStateStore for PgKnownStateStore {
    async fn load_all_active(&self) -> Result<BTreeSet<NaturalKey>, StoreError> {
        let query = sqlx::query(
            r#"
            SELECT natural_key
              FROM known_state
             WHERE source_id = $1
               AND is_active
            "#,
        )
        .bind(&self.source_id);
        let rows = self
            .bounded("loading active keys", query.fetch_all(&self.pool))
            .await?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("natural_key")
                    .map(NaturalKey::new)
                    .map_err(|err| StoreError::Corrupt(err.to_string()))
            })
            .collect()
    }

    async fn get(&self, key: &NaturalKey) -> Result<Option<KnownStateEntry>, StoreError> {
        let query = sqlx::query(
            r#"
            SELECT natural_key, first_seen_at, last_seen_at, is_active,
                   content_hash, fields, enriched_at
              FROM known_state
             WHERE source_id = $1
               AND natural_key = $2
            "#,
        )
        .bind(&self.source_id)
        .bind(key.as_str());
        let row = self
            .bounded("reading a known key", query.fetch_optional(&self.pool))
            .await?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn upsert_entries(&self, entries: &[KnownStateEntry]) -> Result<(), StoreError> {
        for entry in entries {
            let query = sqlx::query(
                r#"
                INSERT INTO known_state
                    (source_id, natural_key, first_seen_at, last_seen_at, is_active,
                     content_hash, fields, enriched_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (source_id, natural_key) DO UPDATE
                   SET last_seen_at = EXCLUDED.last_seen_at,
                       is_active = EXCLUDED.is_active,
                       content_hash = EXCLUDED.content_hash,
                       fields = EXCLUDED.fields,
                       enriched_at = EXCLUDED.enriched_at
                "#,
            )
            .bind(&self.source_id)
            .bind(entry.key.as_str())
            .bind(entry.first_seen_at)
            .bind(entry.last_seen_at)
            .bind(entry.is_active)
            .bind(entry.content_hash.as_deref())
            .bind(entry.fields.as_ref().map(Json))
            .bind(entry.enriched_at);
            self.bounded("writing known state", query.execute(&self.pool))
                .await?;
        }
        Ok(())
    }

    async fn all_entries(&self) -> Result<Vec<KnownStateEntry>, StoreError> {
        let query = sqlx::query(
            r#"
            SELECT natural_key, first_seen_at, last_seen_at, is_active,
                   content_hash, fields, enriched_at
              FROM known_state
             WHERE source_id = $1
             ORDER BY natural_key
            "#,
        )
        .bind(&self.source_id);
        let rows = self
            .bounded("reading known state", query.fetch_all(&self.pool))
            .await?;
        rows.iter().map(row_to_entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{RetryDisposition, Retryable};

    fn fx_table() -> TableSpec {
        TableSpec::new("fx_bars")
            .column("currency_pair", ColumnKind::Text)
            .column("open", ColumnKind::Float)
            .column("bar_time", ColumnKind::Timestamp)
    }

    #[test]
    fn upsert_sql_targets_the_natural_key() {
        let sql = fx_table().upsert_sql();
        assert!(sql.starts_with(
            "INSERT INTO \"fx_bars\" (natural_key, \"currency_pair\", \"open\", \"bar_time\", source_timestamp, fetched_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, NOW())"
        ));
        assert!(sql.contains("ON CONFLICT (natural_key) DO UPDATE SET \"currency_pair\" = EXCLUDED.\"currency_pair\""));
        assert!(sql.ends_with("updated_at = NOW()"));
    }

    #[test]
    fn create_table_sql_has_primary_key_and_typed_columns() {
        let sql = fx_table().create_table_sql();
        assert!(sql.contains("natural_key TEXT PRIMARY KEY"));
        assert!(sql.contains("\"open\" DOUBLE PRECISION"));
        assert!(sql.contains("\"bar_time\" TIMESTAMPTZ"));
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(fx_table().validate().is_ok());
        assert!(TableSpec::new("fx; DROP TABLE x").validate().is_err());
        assert!(TableSpec::new("jobs")
            .column("updated_at", ColumnKind::Timestamp)
            .validate()
            .is_err());
        assert!(TableSpec::new("jobs")
            .column("title", ColumnKind::Text)
            .column("title", ColumnKind::Text)
            .validate()
            .is_err());
    }

    #[test]
    fn values_are_coerced_to_column_kinds() {
        let key = NaturalKey::new("k");
        let float = ColumnSpec {
            name: "open".into(),
            kind: ColumnKind::Float,
        };
        assert_eq!(
            bind_value(&key, &float, Some(&FieldValue::text("4.25"))).unwrap(),
            BoundValue::Float(Some(4.25))
        );
        assert_eq!(bind_value(&key, &float, None).unwrap(), BoundValue::Float(None));
        assert!(matches!(
            bind_value(&key, &float, Some(&FieldValue::Bool(true))),
            Err(PersistError::Rejected { .. })
        ));

        let ts = ColumnSpec {
            name: "bar_time".into(),
            kind: ColumnKind::Timestamp,
        };
        assert!(matches!(
            bind_value(&key, &ts, Some(&FieldValue::text("2025-06-15T12:00:00Z"))).unwrap(),
            BoundValue::Timestamp(Some(_))
        ));
        assert!(bind_value(&key, &ts, Some(&FieldValue::text("soon"))).is_err());
    }

    #[test]
    fn connection_failures_are_told_apart_from_record_failures() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(matches!(
            classify_sqlx_error(io, "k"),
            PersistError::Connectivity(_)
        ));
        assert!(matches!(
            classify_sqlx_error(sqlx::Error::PoolTimedOut, "k"),
            PersistError::Connectivity(_)
        ));
        assert!(matches!(
            classify_sqlx_error(sqlx::Error::RowNotFound, "k"),
            PersistError::Record { .. }
        ));
        assert!(is_connection_sqlstate("08006"));
        assert!(is_connection_sqlstate("57P03"));
        assert!(!is_connection_sqlstate("23505"));
    }

    #[test]
    fn only_unreachable_servers_are_worth_reconnecting() {
        assert!(matches!(
            classify_connect_error(sqlx::Error::PoolTimedOut),
            PersistError::Connectivity(_)
        ));
        let refused = classify_connect_error(sqlx::Error::Configuration("bad url".into()));
        assert!(matches!(refused, PersistError::Refused(_)));
        assert_eq!(refused.disposition(), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn malformed_database_url_is_refused_without_waiting() {
        let backend =
            PgUpsertBackend::new("not a database url", fx_table(), Duration::from_secs(5)).unwrap();
        assert!(matches!(backend.connect().await, Err(PersistError::Refused(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn pool_for_a_malformed_url_is_not_retried() {
        let started = tokio::time::Instant::now();
        let err = connect_pool("not a database url", Duration::from_secs(5), &RetryPolicy::connection())
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Refused(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stalled_state_queries_time_out() {
        // Accepts the socket but never answers the startup message.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _held = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy(&format!("postgres://recon:recon@{addr}/recon"))
            .unwrap();
        let store = PgKnownStateStore::new(pool, "fx_hourly")
            .with_statement_timeout(Duration::from_millis(200));

        let err = store.load_all_active().await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        let err = store.all_entries().await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }
}
