use std::time::Duration;

use thiserror::Error;
use visapath_storage::{GraphConnectionConfig, RetryPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {key}")]
    Missing { key: &'static str },
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchConfig {
    /// A candidate is accepted only when its score is strictly above this.
    pub threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self { threshold: 0.80 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub registry_batch_size: usize,
    pub job_batch_size: usize,
    pub workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            registry_batch_size: 1000,
            job_batch_size: 500,
            workers: 1,
        }
    }
}

/// Process-wide settings, built once at startup and passed down.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub graph: GraphConnectionConfig,
    pub matching: MatchConfig,
    pub batches: BatchConfig,
    pub retry: RetryPolicy,
}

impl SyncConfig {
    /// Read settings from the environment, after loading `.env` if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`SyncConfig::from_env`], but connection settings may be absent because no
    /// store will be contacted.
    pub fn from_env_offline() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| {
            let value = std::env::var(key).ok().filter(|v| !v.trim().is_empty());
            match key {
                "NEO4J_URI" => value.or_else(|| Some("memory://dry-run".to_string())),
                "NEO4J_PASSWORD" => value.or_else(|| Some("unused".to_string())),
                _ => value,
            }
        })
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let graph = GraphConnectionConfig {
            uri: get("NEO4J_URI").ok_or(ConfigError::Missing { key: "NEO4J_URI" })?,
            user: get("NEO4J_USER").unwrap_or(defaults.graph.user),
            password: get("NEO4J_PASSWORD").ok_or(ConfigError::Missing {
                key: "NEO4J_PASSWORD",
            })?,
            database: get("NEO4J_DATABASE").unwrap_or(defaults.graph.database),
            max_connections: parse_or(
                "VISAPATH_MAX_CONNECTIONS",
                get("VISAPATH_MAX_CONNECTIONS"),
                defaults.graph.max_connections,
            )?,
            fetch_size: parse_or(
                "VISAPATH_FETCH_SIZE",
                get("VISAPATH_FETCH_SIZE"),
                defaults.graph.fetch_size,
            )?,
            op_timeout: Duration::from_secs(parse_or(
                "VISAPATH_STORE_TIMEOUT_SECS",
                get("VISAPATH_STORE_TIMEOUT_SECS"),
                defaults.graph.op_timeout.as_secs(),
            )?),
        };

        let threshold: f64 = parse_or(
            "VISAPATH_MATCH_THRESHOLD",
            get("VISAPATH_MATCH_THRESHOLD"),
            defaults.matching.threshold,
        )?;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid {
                key: "VISAPATH_MATCH_THRESHOLD",
                value: threshold.to_string(),
            });
        }

        let batches = BatchConfig {
            registry_batch_size: positive(
                "VISAPATH_REGISTRY_BATCH_SIZE",
                get("VISAPATH_REGISTRY_BATCH_SIZE"),
                defaults.batches.registry_batch_size,
            )?,
            job_batch_size: positive(
                "VISAPATH_JOB_BATCH_SIZE",
                get("VISAPATH_JOB_BATCH_SIZE"),
                defaults.batches.job_batch_size,
            )?,
            workers: positive(
                "VISAPATH_WORKERS",
                get("VISAPATH_WORKERS"),
                defaults.batches.workers,
            )?,
        };

        let retry = RetryPolicy {
            base_delay: Duration::from_millis(parse_or(
                "VISAPATH_RETRY_DELAY_MS",
                get("VISAPATH_RETRY_DELAY_MS"),
                defaults.retry.base_delay.as_millis() as u64,
            )?),
            ..defaults.retry
        };

        Ok(Self {
            graph,
            matching: MatchConfig { threshold },
            batches,
            retry,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn positive(key: &'static str, raw: Option<String>, default: usize) -> Result<usize, ConfigError> {
    let value = parse_or(key, raw, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
        });
    }
    Ok(value)
}
