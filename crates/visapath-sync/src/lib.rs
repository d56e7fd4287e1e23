//! Sponsor-register ingestion and job-ad enrichment pipelines over a graph store.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;
use visapath_core::{normalize, MatchDecision, RawRecord, RecordKind};
use visapath_storage::GraphStore;

mod config;
mod enrich;
mod matcher;
mod orchestrator;
mod upsert;

pub use config::{BatchConfig, ConfigError, MatchConfig, SyncConfig};
pub use enrich::{EnrichSummary, EnrichmentWriter, JobAdEnrichment};
pub use matcher::{name_similarity, FuzzyMatcher};
pub use orchestrator::{BatchFailure, BatchOrchestrator, BatchOutcome, BatchSink, RunSummary};
pub use upsert::{RegistryLoad, UpsertEngine};

pub const CRATE_NAME: &str = "visapath-sync";

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn GraphStore>,
    cancel: Arc<AtomicBool>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn GraphStore>) -> Self {
        Self {
            config,
            store,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Setting this flag stops further batches from being scheduled; running ones finish.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Fail fast when the store is unreachable, then make sure the uniqueness constraints exist.
    pub async fn prepare_store(&self) -> Result<()> {
        self.store.verify_connectivity().await.with_context(|| {
            format!(
                "graph store ({}) is not reachable at {:?}",
                self.store.backend(),
                self.config.graph.uri
            )
        })?;
        self.store
            .ensure_constraints()
            .await
            .context("establishing uniqueness constraints")?;
        Ok(())
    }

    pub async fn load_registry(
        &self,
        records: Vec<RawRecord>,
        load_ts: DateTime<Utc>,
    ) -> Result<RunSummary> {
        self.prepare_store().await?;
        info!(records = records.len(), %load_ts, backend = self.store.backend(), "loading sponsor register");

        let engine = UpsertEngine::new(Arc::clone(&self.store), self.config.retry);
        let sink = RegistryLoad::new(engine, load_ts);
        let orchestrator = self.orchestrator(self.config.batches.registry_batch_size);
        let normalized = records.iter().map(|raw| normalize(raw, RecordKind::Registry));
        Ok(orchestrator.run(normalized, &sink).await)
    }

    pub async fn load_registry_file(
        &self,
        path: &Path,
        load_ts: DateTime<Utc>,
    ) -> Result<RunSummary> {
        let records = visapath_adapters::load_registry(path)?;
        self.load_registry(records, load_ts).await
    }

    /// Match every job ad against the organisations currently in the store and write it.
    pub async fn enrich_job_ads(&self, records: Vec<RawRecord>) -> Result<RunSummary> {
        self.prepare_store().await?;
        let matcher = self.matcher().await?;
        info!(
            records = records.len(),
            candidates = matcher.candidate_count(),
            threshold = matcher.threshold(),
            "enriching job ads"
        );

        let writer = EnrichmentWriter::new(Arc::clone(&self.store), self.config.retry);
        let sink = JobAdEnrichment::new(writer, Arc::new(matcher));
        let orchestrator = self.orchestrator(self.config.batches.job_batch_size);
        let normalized = records.iter().map(|raw| normalize(raw, RecordKind::JobAd));
        Ok(orchestrator.run(normalized, &sink).await)
    }

    pub async fn enrich_job_files(&self, paths: &[PathBuf]) -> Result<RunSummary> {
        let records = visapath_adapters::load_job_ads(paths)?;
        self.enrich_job_ads(records).await
    }

    /// Match decision for a single company name against the current graph.
    pub async fn match_company(&self, company: &str) -> Result<Option<MatchDecision>> {
        let matcher = self.matcher().await?;
        Ok(matcher.match_company(company))
    }

    async fn matcher(&self) -> Result<FuzzyMatcher> {
        FuzzyMatcher::from_store(self.store.as_ref(), self.config.matching.threshold)
            .await
            .context("reading organisation keys for matching")
    }

    fn orchestrator(&self, batch_size: usize) -> BatchOrchestrator {
        BatchOrchestrator::new(batch_size, self.config.batches.workers)
            .with_cancel_flag(Arc::clone(&self.cancel))
    }
}
