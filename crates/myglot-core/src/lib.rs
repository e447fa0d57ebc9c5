//! myglot-core — MySQL query performance collection.
//!
//! Provides:
//! - `version` — server version parsing and version-dependent SQL dialect
//! - `config` — query monitoring settings with clamped thresholds
//! - `source` — SQL access abstraction, mock implementation
//! - `collector` — preconditions, slow/individual queries, plans, waits, locks, custom queries
//! - `model` — collected records and their telemetry attributes
//! - `publish` — chunked publishing to telemetry sinks
//! - `pipeline` — one full collection cycle
//!
//! With `mysql` feature (default):
//! - `source::MySqlConnector` — `sqlx` connection pools

pub mod collector;
pub mod config;
pub mod model;
pub mod pipeline;
pub mod publish;
pub mod source;
pub mod version;

pub use pipeline::{Pipeline, PipelineError, RunSummary};
