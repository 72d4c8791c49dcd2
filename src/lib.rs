//! Ingestion pipeline for Japanese TSO area supply/demand data.
//!
//! Nine regional transmission system operators publish half-hourly or
//! quarter-hourly area supply/demand results, each in its own CSV or ZIP
//! layout on its own URL scheme. This crate normalizes those publications
//! into one relational representation keyed by a deterministic
//! `{date}_{slot}_{area}` master key, so re-running an ingestion is always
//! safe.
//!
//! The stages, in dependency order:
//! - [`registry`]: static operator profiles and URL template resolution
//! - [`acquire`]: HTTP fetch, ZIP detection/extraction, text decoding
//! - [`parser`]: per-operator format parsing into raw records
//! - [`normalize`]: unit conversion and slot validation
//! - [`store`]: idempotent batch upserts into PostgreSQL
//! - [`orchestrator`]: the bounded worker pool driving units through all
//!   of the above, producing a per-unit run report
//!
//! This module follows the Explicit Module Boundary Pattern (EMBP): the
//! binary only touches the re-exports below, never module internals.

pub mod acquire;
pub mod config;
pub mod error;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod parser;
pub mod registry;
pub mod store;

pub use acquire::{Fetch, HttpFetcher, RawPayload};
pub use config::Config;
pub use error::IngestError;
pub use models::{CanonicalRecord, DataType, GenField, RunReport, UnitReport};
pub use orchestrator::{IngestRequest, Orchestrator, RunOptions};
pub use registry::{OperatorProfile, OperatorRegistry};
pub use store::{PgStore, RecordStore, StorageTarget, UpsertCounts};
