//! Idempotent persistence into PostgreSQL.
//!
//! Two storage targets share one key space per table: the cross-operator
//! `unified` table (one column group per area) and the per-area tables
//! `area_1` … `area_9`. Writes are transactional per batch and conflict on
//! `master_key`, where the incoming record replaces the stored one
//! entirely. The `IS DISTINCT FROM` guard makes a byte-identical re-ingest
//! count as neither inserted nor updated, which is what makes re-runs
//! observably idempotent.
//!
//! Schema creation is applied once on startup and is a no-op if the tables
//! already exist.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;

use sqlx::PgPool;
use tracing::debug;

use crate::error::IngestError;
use crate::models::{CanonicalRecord, GenField};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageTarget {
    /// Cross-operator aggregate table, one column group per area.
    Unified,
    /// One table per area with plain field column names.
    PerArea,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

/// The storage boundary of the pipeline. Mockable for pipeline tests; the
/// production implementation is [`PgStore`].
pub trait RecordStore: Send + Sync {
    fn upsert(
        &self,
        records: &[CanonicalRecord],
        target: StorageTarget,
    ) -> impl Future<Output = Result<UpsertCounts, IngestError>> + Send;
}

// ---

/// Production gateway over an explicit connection pool, scoped to the run.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    /// Create or update the storage schema (idempotent).
    ///
    /// Safe to call on every startup; no-op if objects already exist.
    pub async fn create_schema(&self) -> Result<(), IngestError> {
        // ---
        let mut tx = self.pool.begin().await?;

        sqlx::query(&unified_ddl()).execute(&mut *tx).await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_unified_date
                ON unified (date);
            "#,
        )
        .execute(&mut *tx)
        .await?;

        for area in 1..=9u8 {
            sqlx::query(&per_area_ddl(area)).execute(&mut *tx).await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_area_{area}_date ON area_{area} (date);"
            ))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

impl RecordStore for PgStore {
    async fn upsert(
        &self,
        records: &[CanonicalRecord],
        target: StorageTarget,
    ) -> Result<UpsertCounts, IngestError> {
        // ---
        if records.is_empty() {
            return Ok(UpsertCounts::default());
        }

        let mut counts = UpsertCounts::default();
        let mut tx = self.pool.begin().await?;

        for ((table, area_code), recs) in batch_groups(records, target) {
            let keys: Vec<String> = recs.iter().map(|r| r.master_key.clone()).collect();
            let existing: HashSet<String> = sqlx::query_scalar(&format!(
                "SELECT master_key FROM {table} WHERE master_key = ANY($1)"
            ))
            .bind(&keys)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect();

            let sql = upsert_sql(target, area_code);
            for rec in recs {
                let mut query = sqlx::query(&sql)
                    .bind(&rec.master_key)
                    .bind(&rec.date)
                    .bind(rec.slot as i32);
                for value in rec.values {
                    query = query.bind(value);
                }
                let affected = query.execute(&mut *tx).await?.rows_affected();
                // rows_affected is 0 when the conflict guard found the
                // stored record identical
                if affected == 1 {
                    if existing.contains(&rec.master_key) {
                        counts.updated += 1;
                    } else {
                        counts.inserted += 1;
                    }
                }
            }
        }

        tx.commit().await?;
        debug!(
            inserted = counts.inserted,
            updated = counts.updated,
            total = records.len(),
            "batch upserted"
        );
        Ok(counts)
    }
}

// ---

pub(crate) fn table_name(target: StorageTarget, area_code: u8) -> String {
    match target {
        StorageTarget::Unified => "unified".to_string(),
        StorageTarget::PerArea => format!("area_{area_code}"),
    }
}

/// Split a batch by destination table AND column group. A unified batch
/// may span areas, and each area's records must go through a statement
/// built for that area's columns.
fn batch_groups(
    records: &[CanonicalRecord],
    target: StorageTarget,
) -> BTreeMap<(String, u8), Vec<&CanonicalRecord>> {
    let mut groups: BTreeMap<(String, u8), Vec<&CanonicalRecord>> = BTreeMap::new();
    for rec in records {
        groups
            .entry((table_name(target, rec.area_code), rec.area_code))
            .or_default()
            .push(rec);
    }
    groups
}

/// Quoted value-column identifiers for one record's column group.
/// Quoting is mandatory: unified columns start with a digit and `LNG` is
/// case-sensitive.
fn value_columns(target: StorageTarget, area_code: u8) -> Vec<String> {
    GenField::ALL
        .iter()
        .map(|f| match target {
            StorageTarget::Unified => format!("\"{}_{}\"", area_code, f.column_name()),
            StorageTarget::PerArea => format!("\"{}\"", f.column_name()),
        })
        .collect()
}

fn unified_ddl() -> String {
    let mut cols = vec![
        "master_key TEXT PRIMARY KEY".to_string(),
        "date TEXT NOT NULL".to_string(),
        "slot INTEGER NOT NULL".to_string(),
    ];
    for area in 1..=9u8 {
        for col in value_columns(StorageTarget::Unified, area) {
            cols.push(format!("{col} DOUBLE PRECISION"));
        }
    }
    format!(
        "CREATE TABLE IF NOT EXISTS unified (\n    {}\n);",
        cols.join(",\n    ")
    )
}

fn per_area_ddl(area_code: u8) -> String {
    let mut cols = vec![
        "master_key TEXT PRIMARY KEY".to_string(),
        "date TEXT NOT NULL".to_string(),
        "slot INTEGER NOT NULL".to_string(),
    ];
    for col in value_columns(StorageTarget::PerArea, area_code) {
        cols.push(format!("{col} DOUBLE PRECISION"));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS area_{area_code} (\n    {}\n);",
        cols.join(",\n    ")
    )
}

/// Change-aware upsert statement for one (target, area) column group.
///
/// `$1..$3` are master_key, date, slot; `$4..$21` the field values.
fn upsert_sql(target: StorageTarget, area_code: u8) -> String {
    let table = table_name(target, area_code);
    let value_cols = value_columns(target, area_code);

    let mut insert_cols = vec![
        "master_key".to_string(),
        "date".to_string(),
        "slot".to_string(),
    ];
    insert_cols.extend(value_cols.iter().cloned());

    let placeholders: Vec<String> = (1..=insert_cols.len()).map(|i| format!("${i}")).collect();

    let mut set_clauses = vec![
        "date = EXCLUDED.date".to_string(),
        "slot = EXCLUDED.slot".to_string(),
    ];
    for col in &value_cols {
        set_clauses.push(format!("{col} = EXCLUDED.{col}"));
    }

    let stored_tuple: Vec<String> = value_cols.iter().map(|c| format!("{table}.{c}")).collect();
    let incoming_tuple: Vec<String> = value_cols
        .iter()
        .map(|c| format!("EXCLUDED.{c}"))
        .collect();

    format!(
        "INSERT INTO {table} ({})\nVALUES ({})\nON CONFLICT (master_key) DO UPDATE SET\n    {}\nWHERE ({}) IS DISTINCT FROM ({})",
        insert_cols.join(", "),
        placeholders.join(", "),
        set_clauses.join(",\n    "),
        stored_tuple.join(", "),
        incoming_tuple.join(", "),
    )
}
