//! Application entry point for the `tso-ingest` pipeline.
//!
//! This binary drives one ingestion run end to end:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool
//! - Creating the storage schema if it does not exist
//! - Running the requested operator/date-range ingestion
//! - Printing the per-unit run report as JSON on stdout
//!
//! # Usage
//! ```text
//! tso-ingest <demand|supply> <start> <end> [operator ...]
//! ```
//! Dates are `YYYY-MM-DD`, the range is inclusive, and omitting operators
//! runs every registered one. The process exits non-zero when any unit
//! fails or is cancelled.
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `DB_POOL_MAX` (optional) – maximum number of DB connections (default: 5)
//! - `INGEST_LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `INGEST_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! This module follows the Explicit Module Boundary Pattern (EMBP): it
//! only touches the library's re-exported gateway types.
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{env, process};

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use tso_ingest::{
    config, DataType, HttpFetcher, IngestRequest, OperatorRegistry, Orchestrator, PgStore,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let registry = Arc::new(OperatorRegistry::builtin());
    let request = parse_args(env::args().skip(1), &registry)?;

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .with_context(|| format!("Failed to connect to database '{}'", cfg.db_url))?;

    tracing::info!("Successfully connected to database");

    let store = PgStore::new(pool);
    store.create_schema().await?;

    let fetcher =
        HttpFetcher::new(Duration::from_secs(cfg.http_timeout_secs as u64))
            .context("Failed to build HTTP client")?;

    // Ctrl-C requests a graceful stop: in-flight units finish, queued
    // units come back as cancelled.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling queued units");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let orchestrator = Orchestrator::new(
        registry,
        Arc::new(fetcher),
        Arc::new(store),
        cfg.run_options(),
    );
    let report = orchestrator.run(request, cancel).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.all_persisted() {
        process::exit(1);
    }
    Ok(())
}

// ---

fn parse_args(
    mut args: impl Iterator<Item = String>,
    registry: &OperatorRegistry,
) -> Result<IngestRequest> {
    const USAGE: &str = "usage: tso-ingest <demand|supply> <start> <end> [operator ...]";

    let data_type = args.next().ok_or_else(|| anyhow!(USAGE))?;
    let data_type = DataType::parse(&data_type)
        .ok_or_else(|| anyhow!("unknown data type '{data_type}'\n{USAGE}"))?;
    let start = parse_date(&args.next().ok_or_else(|| anyhow!(USAGE))?)?;
    let end = parse_date(&args.next().ok_or_else(|| anyhow!(USAGE))?)?;
    if start > end {
        return Err(anyhow!("start date {start} is after end date {end}"));
    }

    let mut operator_ids: Vec<String> = args.collect();
    if operator_ids.is_empty() {
        operator_ids = registry.operator_ids().map(String::from).collect();
    }

    Ok(IngestRequest {
        operator_ids,
        start,
        end,
        data_type,
    })
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
        .map_err(|_| anyhow!("invalid date '{s}', expected YYYY-MM-DD"))
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `INGEST_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `INGEST_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() {
    // ---
    let span_events = match env::var("INGEST_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stderr().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to INGEST_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("INGEST_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
