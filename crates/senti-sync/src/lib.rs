//! Sync pipeline: configuration, universe, orchestration, summaries, import, scheduling.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use senti_core::{today_utc, ExchangeCode};
use senti_oracle::{GeminiConfig, GeminiOracle, SentimentOracle};
use senti_storage::{
    BlobLayout, BlobSentimentStore, FsBlobBackend, GithubContentsBackend, GithubTarget,
    PartitionManager, PartitionPlan, PartitionReport, PgPartitionCatalog, PgSentimentStore,
    RetryingHttpClient, SchemaError, SentimentStore,
};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod import;
pub mod orchestrator;
pub mod scheduler;
pub mod summary;
pub mod universe;

pub use config::{BackendKind, ConfigError, SyncConfig};
pub use import::{import_tree, ImportSummary};
pub use orchestrator::{Orchestrator, OrchestratorOptions};
pub use summary::{exit_for, ExchangeReport, RunExit, SymbolReport, SyncRunSummary};
pub use universe::{UniverseDocument, UniversePlan};

/// A run that could not start. Carries the exit code it maps to.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SetupError {
    pub exit: RunExit,
    pub message: String,
}

impl SetupError {
    fn new(exit: RunExit, err: impl std::fmt::Display) -> Self {
        Self {
            exit,
            message: format!("{err:#}"),
        }
    }
}

impl From<ConfigError> for SetupError {
    fn from(err: ConfigError) -> Self {
        Self::new(RunExit::Config, err)
    }
}

/// Reference migrations, then the partitioned record table.
pub async fn prepare_schema(
    store: &PgSentimentStore,
    config: &SyncConfig,
    today: NaiveDate,
) -> Result<PartitionReport, SchemaError> {
    store.run_migrations().await?;
    let plan = PartitionPlan::through_years_ahead(
        config.partition_first_year,
        today,
        config.partition_years_ahead,
    )?;
    PartitionManager::new(PgPartitionCatalog::new(store.pool().clone()), plan)
        .ensure()
        .await
}

/// Open the configured store. Postgres also gets its schema checked, so a bad layout stops
/// the run before any oracle call.
pub async fn open_store(
    config: &SyncConfig,
    today: NaiveDate,
) -> Result<Arc<dyn SentimentStore>, SetupError> {
    let layout = BlobLayout::new(config.blob_root.clone());
    match config.backend {
        BackendKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::Missing("DATABASE_URL"))?;
            let max_conns = u32::try_from(config.concurrency + 2).unwrap_or(u32::MAX);
            let store = PgSentimentStore::connect(url, max_conns)
                .await
                .map_err(|err| {
                    SetupError::new(RunExit::StoreInit, format!("connecting to postgres: {err}"))
                })?;
            let report = prepare_schema(&store, config, today)
                .await
                .map_err(|err| SetupError::new(RunExit::Schema, err))?;
            info!(
                layout_before = report.layout_before,
                applied = report.statements_applied,
                partitions = report.partitions.len(),
                "schema ready"
            );
            Ok(Arc::new(store))
        }
        BackendKind::Github => {
            let settings = config.github.clone().ok_or(ConfigError::Missing("GITHUB_TOKEN"))?;
            let http = RetryingHttpClient::new(config.store_http())
                .map_err(|err| SetupError::new(RunExit::StoreInit, err))?;
            let backend = GithubContentsBackend::new(
                Arc::new(http),
                GithubTarget {
                    api_url: settings.api_url,
                    owner: settings.owner,
                    repo: settings.repo,
                    branch: settings.branch,
                    token: settings.token,
                },
            );
            Ok(Arc::new(BlobSentimentStore::new(backend, layout)))
        }
        BackendKind::Fs => {
            tokio::fs::create_dir_all(&config.fs_root).await.map_err(|err| {
                SetupError::new(
                    RunExit::StoreInit,
                    format!("creating {}: {err}", config.fs_root.display()),
                )
            })?;
            let backend = FsBlobBackend::new(config.fs_root.clone());
            Ok(Arc::new(BlobSentimentStore::new(backend, layout)))
        }
    }
}

/// `GEMINI_API_KEY`/`GOOGLE_API_KEY` first, then the variable named by the universe document.
fn resolve_gemini_key<F>(
    config: &SyncConfig,
    universe: Option<&UniverseDocument>,
    lookup: F,
) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    config.gemini_api_key.clone().or_else(|| {
        universe
            .and_then(UniverseDocument::gemini_key_env)
            .and_then(|name| lookup(name))
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    })
}

pub fn open_oracle(
    config: &SyncConfig,
    universe: Option<&UniverseDocument>,
) -> Result<Arc<dyn SentimentOracle>, SetupError> {
    let api_key =
        resolve_gemini_key(config, universe, |name| std::env::var(name).ok()).unwrap_or_default();
    let http = RetryingHttpClient::new(config.oracle_http())
        .map_err(|err| SetupError::new(RunExit::OracleInit, err))?;
    let oracle = GeminiOracle::new(
        Arc::new(http),
        GeminiConfig {
            api_key,
            model: config.gemini_model.clone(),
            base_url: config.gemini_base_url.clone(),
            grounded_search: config.grounded_search,
        },
    )
    .map_err(|err| SetupError::new(RunExit::OracleInit, err))?;
    info!(model = oracle.model(), grounded = config.grounded_search, "oracle ready");
    Ok(Arc::new(oracle))
}

pub struct SyncPipeline {
    store: Arc<dyn SentimentStore>,
    oracle: Arc<dyn SentimentOracle>,
    exchanges: Vec<ExchangeCode>,
    options: OrchestratorOptions,
    universe: Option<UniversePlan>,
    reports_dir: Option<PathBuf>,
}

impl SyncPipeline {
    pub fn new(
        store: Arc<dyn SentimentStore>,
        oracle: Arc<dyn SentimentOracle>,
        exchanges: Vec<ExchangeCode>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            store,
            oracle,
            exchanges,
            options,
            universe: None,
            reports_dir: None,
        }
    }

    pub fn with_universe(mut self, plan: UniversePlan) -> Self {
        self.universe = Some(plan);
        self
    }

    pub fn with_reports_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.reports_dir = dir;
        self
    }

    /// One sweep over every tracked exchange. Per-symbol failures end up in the summary;
    /// only a universe that cannot be applied stops the run.
    pub async fn run_once(&self, today: NaiveDate) -> Result<SyncRunSummary, SetupError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id, backend = self.store.backend_name());

        async {
            if let Some(plan) = &self.universe {
                if let Err(err) = plan.apply(self.store.as_ref()).await {
                    let message = format!("applying universe: {err}");
                    return Err(SetupError::new(RunExit::StoreInit, message));
                }
            }

            let orchestrator =
                Orchestrator::new(self.store.clone(), self.oracle.clone(), self.options);
            let stop = orchestrator.stop_handle();
            let watcher = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("stop requested; finishing in-flight symbols");
                    stop.store(true, Ordering::SeqCst);
                }
            });

            info!(exchanges = self.exchanges.len(), %today, "sync started");
            let exchanges = orchestrator.run(&self.exchanges, today).await;
            watcher.abort();

            let summary = SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                backend: self.store.backend_name().to_string(),
                today,
                stopped: orchestrator.stop_requested(),
                exit: exit_for(&exchanges),
                exchanges,
            };
            info!(
                rows = summary.rows_written(),
                exit = summary.exit.code(),
                stopped = summary.stopped,
                "sync finished"
            );

            if let Some(dir) = &self.reports_dir {
                match summary.write_reports(dir).await {
                    Ok(path) => info!(path = %path.display(), "reports written"),
                    Err(err) => error!(error = %format!("{err:#}"), "writing reports failed"),
                }
            }
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

pub async fn run_with_config(config: SyncConfig) -> Result<SyncRunSummary, SetupError> {
    let today = today_utc();
    let universe = match &config.universe_path {
        Some(path) => Some(UniverseDocument::load(path).await?),
        None => None,
    };
    let plan = universe.as_ref().map(|doc| doc.plan(&config.exchanges)).transpose()?;

    let oracle = open_oracle(&config, universe.as_ref())?;
    let store = open_store(&config, today).await?;

    let mut pipeline = SyncPipeline::new(
        store,
        oracle,
        config.exchanges.clone(),
        OrchestratorOptions {
            max_days_per_symbol: config.max_days_per_symbol,
            concurrency: config.concurrency,
        },
    )
    .with_reports_dir(config.reports_dir.clone());
    if let Some(plan) = plan {
        pipeline = pipeline.with_universe(plan);
    }
    pipeline.run_once(today).await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary, SetupError> {
    let config = SyncConfig::from_env()?;
    run_with_config(config).await
}

/// Apply migrations and partitions without syncing.
pub async fn migrate_from_env() -> Result<PartitionReport> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to migrate")?;
    let store = PgSentimentStore::connect(url, 2).await.context("connecting to postgres")?;
    prepare_schema(&store, &config, today_utc())
        .await
        .context("preparing schema")
}

pub async fn import_from_env(data_root: &Path) -> Result<ImportSummary> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    let store = open_store(&config, today_utc())
        .await
        .map_err(|err| anyhow::anyhow!("opening store: {err}"))?;
    import_tree(store.as_ref(), data_root)
        .await
        .with_context(|| format!("importing {}", data_root.display()))
}
