//! Configuration loader for the `tso-ingest` pipeline.
//!
//! This module centralizes all runtime configuration values and their
//! defaults, loading from environment variables (with optional `.env` file
//! support provided by the caller). Consolidating the `env::var` calls here
//! keeps the rest of the crate free of environment lookups.

use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::orchestrator::RunOptions;

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent
/// configuration snapshot for the lifetime of the run.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Per-request HTTP timeout, seconds.
    pub http_timeout_secs: u32,

    /// Ingestion units in flight across all operators.
    pub worker_limit: u32,

    /// Ingestion units in flight against a single operator's site.
    pub per_operator_limit: u32,

    /// Retry attempts after the first try, transient failures only.
    pub retry_max: u32,

    /// First retry backoff, milliseconds; doubles per attempt.
    pub retry_base_ms: u32,

    /// Wall-clock budget for a whole run, seconds. Zero or unset means
    /// no deadline.
    pub run_deadline_secs: Option<u32>,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `INGEST_HTTP_TIMEOUT_SECS` – per-request timeout (default: 60)
/// - `INGEST_WORKER_LIMIT` – global concurrency cap (default: 6)
/// - `INGEST_PER_OPERATOR_LIMIT` – per-operator concurrency cap (default: 2)
/// - `INGEST_RETRY_MAX` – transient-failure retries (default: 3)
/// - `INGEST_RETRY_BASE_MS` – first backoff delay (default: 500)
/// - `INGEST_RUN_DEADLINE_SECS` – run deadline, 0 disables (default: 0)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let http_timeout_secs = parse_env_u32!("INGEST_HTTP_TIMEOUT_SECS", 60);
    let worker_limit = parse_env_u32!("INGEST_WORKER_LIMIT", 6);
    let per_operator_limit = parse_env_u32!("INGEST_PER_OPERATOR_LIMIT", 2);
    let retry_max = parse_env_u32!("INGEST_RETRY_MAX", 3);
    let retry_base_ms = parse_env_u32!("INGEST_RETRY_BASE_MS", 500);
    let deadline = parse_env_u32!("INGEST_RUN_DEADLINE_SECS", 0);

    Ok(Config {
        db_url,
        db_pool_max,
        http_timeout_secs,
        worker_limit,
        per_operator_limit,
        retry_max,
        retry_base_ms,
        run_deadline_secs: (deadline > 0).then_some(deadline),
    })
}

impl Config {
    /// Run options derived from this configuration snapshot.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            worker_limit: self.worker_limit.max(1) as usize,
            per_operator_limit: self.per_operator_limit.max(1) as usize,
            retry_max: self.retry_max,
            retry_base: Duration::from_millis(self.retry_base_ms as u64),
            deadline: self
                .run_deadline_secs
                .map(|s| Duration::from_secs(s as u64)),
        }
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        // Mask the password in the database URL for security
        let masked_db_url = if let Some(at_pos) = self.db_url.rfind('@') {
            if let Some(colon_pos) = self.db_url[..at_pos].rfind(':') {
                format!(
                    "{}:****{}",
                    &self.db_url[..colon_pos],
                    &self.db_url[at_pos..]
                )
            } else {
                self.db_url.clone()
            }
        } else {
            self.db_url.clone()
        };

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL              : {}", masked_db_url);
        tracing::info!("  DB_POOL_MAX               : {}", self.db_pool_max);
        tracing::info!("  INGEST_HTTP_TIMEOUT_SECS  : {}", self.http_timeout_secs);
        tracing::info!("  INGEST_WORKER_LIMIT       : {}", self.worker_limit);
        tracing::info!("  INGEST_PER_OPERATOR_LIMIT : {}", self.per_operator_limit);
        tracing::info!("  INGEST_RETRY_MAX          : {}", self.retry_max);
        tracing::info!("  INGEST_RETRY_BASE_MS      : {}", self.retry_base_ms);
        match self.run_deadline_secs {
            Some(secs) => tracing::info!("  INGEST_RUN_DEADLINE_SECS  : {}", secs),
            None => tracing::info!("  INGEST_RUN_DEADLINE_SECS  : none"),
        }
    }
}
