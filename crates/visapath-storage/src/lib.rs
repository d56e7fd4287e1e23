//! Graph store adapter: transactional writes, constraint setup, retry and timeouts.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;
use visapath_core::{JobAdNode, JobAdWrite, OrganisationNode, OrganisationUpsert};

mod memory;
mod neo4j;

pub use memory::{GraphCounts, InjectedFailure, MemoryGraphStore};
pub use neo4j::Neo4jStore;

pub const CRATE_NAME: &str = "visapath-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store rejected the statement: {0}")]
    Rejected(String),
    #[error("cannot reach graph store: {0}")]
    Connectivity(String),
    #[error("invalid graph store configuration: {0}")]
    Config(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Transient(_) | StoreError::Timeout(_) => RetryDisposition::Retryable,
            StoreError::Rejected(_) | StoreError::Connectivity(_) | StoreError::Config(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }

    /// Errors that mean the store is unusable, as opposed to one batch going wrong.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, StoreError::Connectivity(_) | StoreError::Config(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Connection settings for the Neo4j backend.
#[derive(Debug, Clone)]
pub struct GraphConnectionConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: usize,
    pub fetch_size: usize,
    pub op_timeout: Duration,
}

impl Default for GraphConnectionConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            user: "neo4j".to_string(),
            password: String::new(),
            database: "neo4j".to_string(),
            max_connections: 50,
            fetch_size: 500,
            op_timeout: Duration::from_secs(30),
        }
    }
}

/// Transactional property-graph backend.
///
/// Every write method applies its whole slice as one transaction: either all rows land or
/// none do.
#[async_trait]
pub trait GraphStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn verify_connectivity(&self) -> Result<(), StoreError>;

    /// Declare uniqueness constraints. Safe to call on every run.
    async fn ensure_constraints(&self) -> Result<(), StoreError>;

    /// Merge Organisation/Location/Route nodes and their edges. Returns rows applied.
    async fn upsert_organisations(
        &self,
        rows: &[OrganisationUpsert],
        load_ts: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Merge JobAd nodes, replace their POSTED_BY edge and recompute `route`.
    async fn write_job_ads(
        &self,
        rows: &[JobAdWrite],
        matched_at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// All Organisation keys, sorted.
    async fn organisation_keys(&self) -> Result<Vec<String>, StoreError>;

    async fn organisation(&self, key: &str) -> Result<Option<OrganisationNode>, StoreError>;

    async fn job_ad(&self, id: &str) -> Result<Option<JobAdNode>, StoreError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Run `op` as a fresh attempt each time, retrying only retryable failures.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.max_retries =>
                {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        op = label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Bound a store call; running out of time is reported as [`StoreError::Timeout`].
pub async fn with_timeout<T, Fut>(limit: Duration, fut: Fut) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
