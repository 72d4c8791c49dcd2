//! Bounded concurrent execution of ingestion units.
//!
//! A run expands an operator/date-range request into independent units
//! (one operator, one date, one data type), drives each through fetch,
//! parse, normalize, and persist, and reports every unit's terminal state.
//! Concurrency is capped twice: a global worker limit and a per-operator
//! limit, so one slow TSO site never monopolizes the pool and no TSO sees
//! a burst of parallel requests.
//!
//! Retries apply only to transient failures (`IngestError::is_retryable`),
//! with exponential backoff. Structural failures such as a schema mismatch
//! fail the unit immediately; retrying them would re-download the same
//! broken file. A stop request (Ctrl-C or an expired run deadline) is
//! honored before each unit starts and at every retry boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::acquire::Fetch;
use crate::error::IngestError;
use crate::models::{DataType, IngestionUnit, RunReport, Stage, UnitReport, UnitState};
use crate::normalize::normalize;
use crate::parser;
use crate::registry::OperatorRegistry;
use crate::store::{RecordStore, StorageTarget, UpsertCounts};

// ---

/// Tuning knobs for one run. Defaults match the configuration defaults.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Units in flight across all operators.
    pub worker_limit: usize,
    /// Units in flight against any single operator's site.
    pub per_operator_limit: usize,
    /// Retry attempts after the first try, transient failures only.
    pub retry_max: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_base: Duration,
    /// Wall-clock budget for the whole run. Units that have not started
    /// when it expires finish as cancelled.
    pub deadline: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            worker_limit: 6,
            per_operator_limit: 2,
            retry_max: 3,
            retry_base: Duration::from_millis(500),
            deadline: None,
        }
    }
}

/// What to ingest: an inclusive date range for a set of operators.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub operator_ids: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub data_type: DataType,
}

// ---

pub struct Orchestrator<F, S> {
    registry: Arc<OperatorRegistry>,
    fetcher: Arc<F>,
    store: Arc<S>,
    opts: RunOptions,
}

impl<F, S> Orchestrator<F, S>
where
    F: Fetch + 'static,
    S: RecordStore + 'static,
{
    pub fn new(
        registry: Arc<OperatorRegistry>,
        fetcher: Arc<F>,
        store: Arc<S>,
        opts: RunOptions,
    ) -> Self {
        Orchestrator {
            registry,
            fetcher,
            store,
            opts,
        }
    }

    /// Execute a run to completion. Every expanded unit appears in the
    /// report exactly once; unit failures never abort the run. The only
    /// up-front error is an operator id the registry does not know.
    pub async fn run(
        &self,
        request: IngestRequest,
        cancel: Arc<AtomicBool>,
    ) -> Result<RunReport, IngestError> {
        // Unknown operators fail the whole request before any I/O.
        for id in &request.operator_ids {
            self.registry.profile(id)?;
        }

        let units = expand_units(&request);
        info!(
            units = units.len(),
            operators = request.operator_ids.len(),
            data_type = %request.data_type,
            "run starting"
        );

        let global = Arc::new(Semaphore::new(self.opts.worker_limit));
        let per_operator: HashMap<String, Arc<Semaphore>> = request
            .operator_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    Arc::new(Semaphore::new(self.opts.per_operator_limit)),
                )
            })
            .collect();
        let deadline = self.opts.deadline.map(|d| Instant::now() + d);

        let mut tasks: JoinSet<(usize, UnitReport)> = JoinSet::new();
        for (index, unit) in units.into_iter().enumerate() {
            let registry = Arc::clone(&self.registry);
            let fetcher = Arc::clone(&self.fetcher);
            let store = Arc::clone(&self.store);
            let cancel = Arc::clone(&cancel);
            let global = Arc::clone(&global);
            let operator_gate = Arc::clone(&per_operator[&unit.operator_id]);
            let opts = self.opts;

            tasks.spawn(async move {
                // Acquire outer gate first so per-operator permits are
                // only contended by units that hold a worker slot.
                let _worker = global.acquire_owned().await.ok();
                let _operator = operator_gate.acquire_owned().await.ok();

                let expired = deadline.is_some_and(|d| Instant::now() >= d);
                if cancel.load(Ordering::SeqCst) || expired {
                    return (index, UnitReport::pending(&unit).cancelled());
                }

                let report = run_unit(&registry, &*fetcher, &*store, &opts, &unit, &cancel).await;
                (index, report)
            });
        }

        let mut reports: Vec<Option<UnitReport>> = Vec::new();
        reports.resize_with(tasks.len(), || None);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => reports[index] = Some(report),
                Err(e) => error!(error = %e, "unit task panicked"),
            }
        }

        let report = RunReport {
            units: reports.into_iter().flatten().collect(),
        };
        info!(
            persisted = report.count_in(UnitState::Persisted),
            failed = report.count_in(UnitState::Failed),
            cancelled = report.count_in(UnitState::Cancelled),
            "run finished"
        );
        Ok(report)
    }
}

/// One unit per (operator, date), in request order then date order.
fn expand_units(request: &IngestRequest) -> Vec<IngestionUnit> {
    let mut units = Vec::new();
    for id in &request.operator_ids {
        let mut date = request.start;
        while date <= request.end {
            units.push(IngestionUnit {
                operator_id: id.clone(),
                date,
                data_type: request.data_type,
            });
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
    }
    units
}

// ---

async fn run_unit<F: Fetch, S: RecordStore>(
    registry: &OperatorRegistry,
    fetcher: &F,
    store: &S,
    opts: &RunOptions,
    unit: &IngestionUnit,
    cancel: &AtomicBool,
) -> UnitReport {
    let mut report = UnitReport::pending(unit);

    let profile = match registry.profile(&unit.operator_id) {
        Ok(p) => p,
        Err(e) => return report.fail(Stage::Fetch, e),
    };
    let url = match registry.resolve(&unit.operator_id, unit.data_type, unit.date) {
        Ok(u) => u,
        Err(e) => return report.fail(Stage::Fetch, e),
    };

    // Fetch and extract together: a truncated archive is indistinguishable
    // from a truncated download, so both are refetched.
    let mut attempt = 0u32;
    let csv_text = loop {
        let outcome = match fetcher.fetch(&url).await {
            Ok(payload) => payload.csv_text(unit.date),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(text) => break text,
            Err(e) if e.is_retryable() && attempt < opts.retry_max => {
                // The current attempt is the stage boundary: once a stop is
                // requested, remaining retries are abandoned.
                if cancel.load(Ordering::SeqCst) {
                    warn!(
                        operator = %unit.operator_id,
                        date = %unit.date,
                        error = %e,
                        "cancel requested, abandoning fetch retries"
                    );
                    return report.cancelled();
                }
                let delay = opts.retry_base * 2u32.saturating_pow(attempt);
                attempt += 1;
                warn!(
                    operator = %unit.operator_id,
                    date = %unit.date,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return report.fail(Stage::Fetch, e),
        }
    };
    report.state = UnitState::Fetched;

    let mut parsed = match parser::parse(profile, &csv_text) {
        Ok(p) => p,
        Err(e) => return report.fail(Stage::Parse, e),
    };
    // A monthly or yearly file parses to every date it covers; the unit
    // only owns its own date.
    let own_date = unit.date.format("%Y%m%d").to_string();
    parsed.records.retain(|r| r.date == own_date);
    report.rows = parsed.records.len();
    report.skipped_rows = parsed.skipped_rows;
    report.state = UnitState::Parsed;

    let mut records = Vec::with_capacity(parsed.records.len());
    for raw in parsed.records {
        match normalize(profile, raw) {
            Ok(rec) => records.push(rec),
            Err(e) => return report.fail(Stage::Normalize, e),
        }
    }
    report.state = UnitState::Normalized;

    // The per-area mirror sees the same keys and the same change guard as
    // the unified table, so the unified counts stand for the unit.
    let mut counts = UpsertCounts::default();
    for target in [StorageTarget::Unified, StorageTarget::PerArea] {
        let mut attempt = 0u32;
        let batch = loop {
            match store.upsert(&records, target).await {
                Ok(c) => break c,
                Err(e) if e.is_retryable() && attempt < opts.retry_max => {
                    if cancel.load(Ordering::SeqCst) {
                        warn!(
                            operator = %unit.operator_id,
                            date = %unit.date,
                            error = %e,
                            "cancel requested, abandoning persist retries"
                        );
                        return report.cancelled();
                    }
                    let delay = opts.retry_base * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        operator = %unit.operator_id,
                        date = %unit.date,
                        attempt,
                        error = %e,
                        "persist failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return report.fail(Stage::Persist, e),
            }
        };
        if target == StorageTarget::Unified {
            counts = batch;
        }
    }
    report.inserted = counts.inserted;
    report.updated = counts.updated;
    report.state = UnitState::Persisted;

    info!(
        operator = %unit.operator_id,
        date = %unit.date,
        rows = report.rows,
        skipped = report.skipped_rows,
        inserted = report.inserted,
        updated = report.updated,
        "unit persisted"
    );
    report
}
