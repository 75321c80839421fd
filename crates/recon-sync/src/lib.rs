//! Sync orchestration: loads the source registry, runs each stream through the
//! reconciliation pipeline, and writes reports.

pub mod config;
pub mod export;
pub mod pipeline;
pub mod report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use recon_adapters::{build_adapter, AdapterSpec, FetchContext};
use recon_core::{KnownStateStore, MemoryStateStore, UpsertWriter};
use recon_storage::{
    connect_pool, ensure_schema, FileStateStore, HttpClientConfig, HttpFetcher, MemoryTable,
    PgKnownStateStore, PgUpsertBackend, RetryPolicy, RetryingWriter,
};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use config::{
    PersistMode, SourceConfig, SourceRegistry, StateBackend, SyncConfig, UnknownTimestampPolicy,
};
pub use export::{export_known_state, ExportManifest, ExportManifestFile};
pub use pipeline::{
    EnrichmentCounts, ReconciliationCounts, RunStage, SourceRuntime, StreamOptions, StreamReport,
    StreamStatus,
};
pub use report::{
    health_checks, report_markdown, write_reports, HealthProblem, HistoryEntry, RunHistory,
    RunSummary,
};

pub const CRATE_NAME: &str = "recon-sync";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only these source ids; all enabled sources when empty.
    pub sources: Vec<String>,
    pub full_refresh: bool,
    /// Fetch, validate and reconcile against a copy of known state, storing nothing.
    pub dry_run: bool,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn load_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.config.sources_path()).await
    }

    pub async fn run_once(&self, options: &RunOptions) -> Result<RunSummary> {
        let registry = self.load_registry().await?;
        let sources = registry.select(&options.sources)?;
        info!(
            sources = sources.len(),
            dry_run = options.dry_run,
            full_refresh = options.full_refresh,
            "starting sync"
        );
        let runtimes = self.build_runtimes(sources, options.dry_run).await?;
        let summary = self.run_streams(&runtimes, options).await;
        self.finish_run(summary, &registry.sources).await
    }

    /// Runs each stream in turn. A failing stream never stops the others.
    pub async fn run_streams(&self, runtimes: &[SourceRuntime], options: &RunOptions) -> RunSummary {
        let ctx = FetchContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        };
        let stream_options = StreamOptions {
            full_refresh: options.full_refresh,
        };

        let mut streams = Vec::with_capacity(runtimes.len());
        for runtime in runtimes {
            streams.push(runtime.run(&self.http, &ctx, stream_options).await);
        }

        let mut summary = RunSummary::new(
            ctx.run_id,
            ctx.fetched_at,
            streams,
            self.config.max_error_messages,
        );
        summary.dry_run = options.dry_run;
        summary.full_refresh = options.full_refresh;
        summary
    }

    /// Health checks, reports and history. Dry runs leave the history untouched.
    pub async fn finish_run(
        &self,
        mut summary: RunSummary,
        sources: &[SourceConfig],
    ) -> Result<RunSummary> {
        let reports_dir = &self.config.reports_dir;
        let mut history = RunHistory::load(reports_dir).await?;
        summary.health = health_checks(&summary, sources, &history);
        for problem in &summary.health {
            warn!(source_id = %problem.source_id, problem = %problem.message, "health check");
        }
        for stream in summary.hard_failures() {
            error!(source_id = %stream.source_id, status = ?stream.status, "stream hit an invariant violation");
        }

        write_reports(reports_dir, &summary).await?;
        if !summary.dry_run {
            history.record(&summary, self.config.history_limit);
            history.save(reports_dir).await?;
        }
        info!(
            run_id = %summary.run_id,
            attempted = summary.totals.attempted,
            upserted = summary.totals.upserted,
            rejected = summary.totals.rejected,
            errored = summary.totals.errored,
            success = summary.success(),
            "sync finished"
        );
        Ok(summary)
    }

    pub async fn build_runtimes(
        &self,
        sources: Vec<SourceConfig>,
        dry_run: bool,
    ) -> Result<Vec<SourceRuntime>> {
        let cap = self.config.max_error_messages;
        let mut pool = None;
        let mut runtimes = Vec::with_capacity(sources.len());
        for mut source in sources {
            self.resolve_paths(&mut source.adapter);
            let adapter = build_adapter(&source.source_id, source.clock()?, &source.adapter);
            let durable = self.state_store(&source, &mut pool).await?;

            let (store, writer): (Arc<dyn KnownStateStore>, Arc<dyn UpsertWriter>) = if dry_run {
                let entries = durable
                    .all_entries()
                    .await
                    .with_context(|| format!("reading known state for {}", source.source_id))?;
                (
                    Arc::new(MemoryStateStore::with_entries(entries)),
                    Arc::new(RetryingWriter::new(MemoryTable::new()).with_error_cap(cap)),
                )
            } else {
                let backend = PgUpsertBackend::new(
                    self.config.require_database_url()?,
                    adapter.fetcher.profile().table,
                    self.config.db_connect_timeout(),
                )?;
                (durable, Arc::new(RetryingWriter::new(backend).with_error_cap(cap)))
            };
            runtimes.push(SourceRuntime::new(source, adapter, store, writer, cap)?);
        }
        Ok(runtimes)
    }

    /// Creates the known-state table and every registered source's table.
    pub async fn migrate(&self) -> Result<Vec<String>> {
        let registry = self.load_registry().await?;
        let tables = registry
            .sources
            .iter()
            .map(|s| Ok(build_adapter(&s.source_id, s.clock()?, &s.adapter).fetcher.profile().table))
            .collect::<Result<Vec<_>>>()?;
        let pool = self.pool(&mut None).await?;
        ensure_schema(&pool, &tables).await?;
        Ok(tables.into_iter().map(|t| t.name).collect())
    }

    /// Writes known state for the selected sources to
    /// `<reports_dir>/exports/<timestamp>/`. Returns the manifest path.
    pub async fn export(&self, only: &[String]) -> Result<PathBuf> {
        let registry = self.load_registry().await?;
        let mut pool = None;
        let mut exported = Vec::new();
        for source in registry.select(only)? {
            let store = self.state_store(&source, &mut pool).await?;
            let entries = store
                .all_entries()
                .await
                .with_context(|| format!("reading known state for {}", source.source_id))?;
            exported.push((source.source_id, entries));
        }
        let out_dir = self
            .config
            .reports_dir
            .join("exports")
            .join(Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
        export_known_state(&out_dir, &exported).await
    }

    async fn state_store(
        &self,
        source: &SourceConfig,
        pool: &mut Option<PgPool>,
    ) -> Result<Arc<dyn KnownStateStore>> {
        Ok(match source.state {
            StateBackend::File => Arc::new(FileStateStore::new(
                &self.config.state_dir,
                source.source_id.clone(),
            )),
            StateBackend::Postgres => Arc::new(
                PgKnownStateStore::new(self.pool(pool).await?, source.source_id.clone())
                    .with_statement_timeout(self.config.db_connect_timeout()),
            ),
        })
    }

    async fn pool(&self, cached: &mut Option<PgPool>) -> Result<PgPool> {
        if let Some(pool) = cached {
            return Ok(pool.clone());
        }
        let pool = connect_pool(
            self.config.require_database_url()?,
            self.config.db_connect_timeout(),
            &RetryPolicy::connection(),
        )
        .await
        .context("connecting to postgres")?;
        *cached = Some(pool.clone());
        Ok(pool)
    }

    fn resolve_paths(&self, spec: &mut AdapterSpec) {
        if let AdapterSpec::Fixture(settings) = spec {
            if settings.path.is_relative() {
                settings.path = self.config.workspace_root.join(&settings.path);
            }
        }
    }
}

/// Builds the cron job when the scheduler is enabled. Ticks that fire while a sync is
/// still running are skipped.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    options: RunOptions,
) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let options = options.clone();
        let running = Arc::clone(&running);
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous sync still running; skipping this tick");
                return;
            };
            match pipeline.run_once(&options).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    upserted = summary.totals.upserted,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Starts the scheduler and blocks until Ctrl-C.
pub async fn run_scheduler(pipeline: Arc<SyncPipeline>, options: RunOptions) -> Result<()> {
    let cron = pipeline.config.sync_cron.clone();
    let Some(mut sched) = maybe_build_scheduler(pipeline, options).await? else {
        warn!("scheduler disabled; set RECON_SCHEDULER_ENABLED=true");
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}

pub async fn run_sync_once_from_env(options: &RunOptions) -> Result<RunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_once(options).await
}
