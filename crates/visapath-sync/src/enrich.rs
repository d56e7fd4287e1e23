//! Enrichment Writer: job ads matched onto sponsors and written with their POSTED_BY edge.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::debug;
use visapath_core::{clean_company_name, CanonicalRecord, JobAdWrite, JOB_AD_RESERVED};
use visapath_storage::{GraphStore, RetryPolicy, StoreError};

use crate::matcher::FuzzyMatcher;
use crate::orchestrator::{BatchOutcome, BatchSink};

const COMPANY_FIELD: &str = "company";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichSummary {
    pub written: usize,
    pub matched: usize,
    pub unmatched: usize,
}

#[derive(Clone)]
pub struct EnrichmentWriter {
    store: Arc<dyn GraphStore>,
    retry: RetryPolicy,
}

impl EnrichmentWriter {
    pub fn new(store: Arc<dyn GraphStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn prepare(record: &CanonicalRecord, matcher: &FuzzyMatcher) -> JobAdWrite {
        let company = record.get_str(COMPANY_FIELD).unwrap_or_default();
        let mut props = record.props.clone();
        for reserved in JOB_AD_RESERVED {
            props.remove(reserved);
        }
        JobAdWrite {
            id: record.key.clone(),
            props,
            company_clean: clean_company_name(company),
            matched: matcher.match_company(company),
        }
    }

    /// Rows for one batch, one per job ad id. When an id repeats (overlapping search
    /// pages), the last occurrence wins and takes the position it appeared at.
    pub fn prepare_batch(job_ads: &[CanonicalRecord], matcher: &FuzzyMatcher) -> Vec<JobAdWrite> {
        let mut last_seen: HashMap<&str, usize> = HashMap::with_capacity(job_ads.len());
        for (idx, record) in job_ads.iter().enumerate() {
            last_seen.insert(record.key.as_str(), idx);
        }
        let rows: Vec<JobAdWrite> = job_ads
            .iter()
            .enumerate()
            .filter(|(idx, record)| last_seen.get(record.key.as_str()) == Some(idx))
            .map(|(_, record)| Self::prepare(record, matcher))
            .collect();
        if rows.len() < job_ads.len() {
            debug!(
                duplicates = job_ads.len() - rows.len(),
                "repeated job ad ids collapsed to their last occurrence"
            );
        }
        rows
    }

    /// Match and write one batch of job ads as a single transaction.
    pub async fn enrich(
        &self,
        job_ads: &[CanonicalRecord],
        matcher: &FuzzyMatcher,
    ) -> Result<EnrichSummary, StoreError> {
        let rows = Self::prepare_batch(job_ads, matcher);
        let matched = rows.iter().filter(|row| row.matched.is_some()).count();
        let matched_at = Utc::now();

        let store = &self.store;
        let rows = rows.as_slice();
        let written = self
            .retry
            .run("write_job_ads", move || async move {
                store.write_job_ads(rows, matched_at).await
            })
            .await?;
        debug!(written, matched, "job-ad batch committed");

        Ok(EnrichSummary {
            written,
            matched,
            unmatched: written.saturating_sub(matched),
        })
    }
}

/// An enrichment run: every batch is matched against the same candidate index.
pub struct JobAdEnrichment {
    writer: EnrichmentWriter,
    matcher: Arc<FuzzyMatcher>,
}

impl JobAdEnrichment {
    pub fn new(writer: EnrichmentWriter, matcher: Arc<FuzzyMatcher>) -> Self {
        Self { writer, matcher }
    }
}

#[async_trait]
impl BatchSink for JobAdEnrichment {
    fn label(&self) -> &'static str {
        "job_ads"
    }

    async fn write_batch(&self, batch: &[CanonicalRecord]) -> Result<BatchOutcome, StoreError> {
        let summary = self.writer.enrich(batch, &self.matcher).await?;
        Ok(BatchOutcome {
            written: summary.written,
            matched: summary.matched,
        })
    }
}
