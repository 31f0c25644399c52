//! Canonicalization engine: persistence, evidence ledger, asset canonicalizer,
//! trial linker, change feed, read model and snapshot export.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pipewatch_adapters::{
    AdapterError, CtgFetchSettings, CtgTrialsFetcher, PipelineSnapshot, SponsorFilter,
    TrialsSource,
};
use pipewatch_storage::{HttpClientConfig, HttpFetcher};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{error, info_span, Instrument};

pub mod canonicalize;
pub mod config;
pub mod db;
pub mod export;
pub mod feed;
pub mod index;
pub mod ledger;
pub mod link;
pub mod read;
pub mod trials;

pub use canonicalize::{FailedFragment, PipelineRunSummary, SkipReason, SkippedFragment};
pub use config::{CompanyConfig, ConfigError, EngineConfig, LinkingConfig, SyncConfig};
pub use db::{IngestionRun, RunStatus, RunType};
pub use export::{export_snapshot, ExportManifest};
pub use ledger::EvidenceLedger;
pub use link::{LinkOutcome, ReviewSuggestion};
pub use read::{AssetView, EventQuery, TrialView};
pub use trials::{AmbiguousIntervention, TrialsRunSummary};

pub const CRATE_NAME: &str = "pipewatch-sync";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("snapshot for {0} has no fragments")]
    EmptySnapshot(String),
    #[error("company {0:?} is not configured")]
    UnknownCompany(String),
    #[error("a run is already in progress for {company_id}{}", .run_id.map(|id| format!(" (run {id})")).unwrap_or_default())]
    RunInProgress {
        company_id: String,
        run_id: Option<i64>,
    },
    #[error("evidence write failed: {0}")]
    EvidenceWrite(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid stored row: {0}")]
    InvalidRow(String),
    #[error("source failed: {0}")]
    Source(#[from] AdapterError),
}

/// Runs pipeline and trials ingestion for configured companies.
#[derive(Debug, Clone)]
pub struct Engine {
    pool: SqlitePool,
    config: Arc<EngineConfig>,
    ledger: EvidenceLedger,
}

impl Engine {
    pub fn new(pool: SqlitePool, config: Arc<EngineConfig>, evidence_root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            config,
            ledger: EvidenceLedger::new(evidence_root.into()),
        }
    }

    /// Connects, migrates and loads `companies.yaml` per the environment settings.
    pub async fn from_sync_config(sync: &SyncConfig) -> anyhow::Result<Self> {
        let config = EngineConfig::load(&sync.companies_path, Duration::from_secs(sync.lock_ttl_secs))
            .with_context(|| format!("loading {}", sync.companies_path.display()))?;
        let pool = db::connect(&sync.database_url).await?;
        db::migrate(&pool).await.context("running migrations")?;
        Ok(Self::new(pool, Arc::new(config), sync.evidence_dir.clone()))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    fn company(&self, company_id: &str) -> Result<&CompanyConfig, IngestError> {
        self.config
            .company(company_id)
            .ok_or_else(|| IngestError::UnknownCompany(company_id.to_string()))
    }

    /// Applies one authoritative pipeline listing for a company.
    pub async fn ingest_pipeline(
        &self,
        company_id: &str,
        snapshot: PipelineSnapshot,
    ) -> Result<PipelineRunSummary, IngestError> {
        let company = self.company(company_id)?;
        if snapshot.fragments.is_empty() {
            return Err(IngestError::EmptySnapshot(company_id.to_string()));
        }
        db::ensure_company(&self.pool, &company.company()).await?;
        let run_id = db::begin_run(&self.pool, company_id, RunType::Pipeline, self.config.lock_ttl()).await?;

        let result = async {
            let canonicalizer = canonicalize::Canonicalizer::new(
                &self.pool,
                &self.ledger,
                self.config.normalizer(),
                company_id,
                run_id,
                &company.alias_seeds,
                &snapshot.alias_seeds,
            )
            .await?;
            canonicalizer.run(snapshot).await
        }
        .instrument(info_span!("pipeline_run", company_id, run_id))
        .await;

        self.close_run(company_id, run_id, result, |s| serde_json::to_string(&s.report))
            .await
    }

    /// Fetches studies for the company's known aliases and links them.
    pub async fn ingest_trials(
        &self,
        company_id: &str,
        source: &dyn TrialsSource,
    ) -> Result<TrialsRunSummary, IngestError> {
        let company = self.company(company_id)?;
        db::ensure_company(&self.pool, &company.company()).await?;
        let run_id = db::begin_run(&self.pool, company_id, RunType::Trials, self.config.lock_ttl()).await?;

        let result = async {
            trials::TrialLinker::new(
                &self.pool,
                &self.ledger,
                self.config.normalizer(),
                self.config.linking().review_threshold,
                company_id,
                run_id,
            )
            .await?
            .run(source)
            .await
        }
        .instrument(info_span!("trials_run", company_id, run_id))
        .await;

        self.close_run(company_id, run_id, result, |s| serde_json::to_string(&s.report))
            .await
    }

    async fn close_run<T>(
        &self,
        company_id: &str,
        run_id: i64,
        result: Result<T, IngestError>,
        notes: impl FnOnce(&T) -> serde_json::Result<String>,
    ) -> Result<T, IngestError> {
        match result {
            Ok(summary) => {
                let notes = notes(&summary)?;
                db::finish_run(&self.pool, company_id, run_id, RunStatus::Ok, &notes).await?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(finish_err) =
                    db::finish_run(&self.pool, company_id, run_id, RunStatus::Error, &err.to_string()).await
                {
                    error!(company_id, run_id, error = %finish_err, "could not mark run as failed");
                }
                Err(err)
            }
        }
    }

    /// Live ClinicalTrials.gov source filtered to the company's sponsor aliases.
    pub fn live_trials_source(&self, company_id: &str, sync: &SyncConfig) -> anyhow::Result<CtgTrialsFetcher> {
        let company = self.company(company_id)?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(sync.http_timeout_secs),
            user_agent: Some(sync.user_agent.clone()),
            ..HttpClientConfig::default()
        })?;
        let settings = CtgFetchSettings {
            min_term_len: self.config.normalizer().rules().min_alias_len,
            ..CtgFetchSettings::default()
        };
        Ok(CtgTrialsFetcher::new(
            Arc::new(http),
            SponsorFilter::new(&company.sponsor_aliases),
            settings,
        ))
    }
}
