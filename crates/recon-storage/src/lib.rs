//! Persistence and I/O plumbing for the sync engine: retry policies, the HTTP fetcher,
//! known-state stores and the retrying upsert writer.

pub mod file_state;
pub mod http;
pub mod memory;
pub mod postgres;
pub mod retry;
pub mod writer;

pub use file_state::FileStateStore;
pub use http::{
    classify_reqwest_error, classify_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher,
};
pub use memory::{MemoryTable, StoredRow};
pub use postgres::{
    classify_connect_error, classify_sqlx_error, connect_pool, ensure_schema, ColumnKind, ColumnSpec, PgKnownStateStore,
    PgUpsertBackend, TableSpec,
};
pub use retry::{
    execute_with_retry, Backoff, RetryDisposition, RetryError, RetryPolicy, Retryable,
};
pub use writer::{PersistError, RetryingWriter, UpsertBackend};

pub const CRATE_NAME: &str = "recon-storage";
