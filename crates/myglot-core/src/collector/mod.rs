//! MySQL query performance collectors.
//!
//! Reads `performance_schema` instrumentation:
//! - `events_statements_summary_by_digest`: slow statement digests
//! - `events_statements_current` / `_history` / `_history_long`: individual executions
//! - `events_waits_current` / `_history`: wait events per digest
//! - `data_lock_waits` + `innodb_trx` + `threads`: blocking sessions
//!
//! ## Stage dependencies
//!
//! ```text
//!   preconditions ──► slow queries ──digests──► individual queries ──groups──► plans
//!                 ├─► wait events
//!                 ├─► blocking sessions
//!                 └─► custom queries
//! ```
//!
//! Every collector returns `Result`; the pipeline decides whether a failure
//! empties one stage or skips its dependents.

mod blocking;
mod custom;
mod individual_queries;
mod plans;
mod preconditions;
mod queries;
mod slow_queries;
mod waits;

pub use custom::run_custom_queries;
pub use plans::{PlanWalk, extract_plans, flatten_plan, is_explainable};
pub use preconditions::{
    CheckOutcome, PreconditionError, PreconditionReport, REQUIRED_CONSUMERS, REQUIRED_INSTRUMENTS,
    validate_preconditions,
};
pub use slow_queries::SlowQueryBatch;

use crate::config::QueryMonitoringConfig;
use crate::source::{SqlParam, SqlSource};
use crate::version::Dialect;

/// Runs the aggregate and per-digest collectors against one connection.
pub struct QueryCollector<'a, S: SqlSource + ?Sized> {
    source: &'a S,
    config: &'a QueryMonitoringConfig,
    dialect: Dialect,
}

impl<'a, S: SqlSource + ?Sized> QueryCollector<'a, S> {
    pub fn new(source: &'a S, config: &'a QueryMonitoringConfig, dialect: Dialect) -> Self {
        Self {
            source,
            config,
            dialect,
        }
    }

    /// Excluded schema names as bind parameters, in the order of the `IN` list.
    fn excluded_params(&self) -> Vec<SqlParam> {
        let mut params: Vec<SqlParam> = self
            .config
            .excluded_databases
            .iter()
            .map(SqlParam::from)
            .collect();
        if params.is_empty() {
            params.push(SqlParam::from(""));
        }
        params
    }

    fn excluded_count(&self) -> usize {
        self.config.excluded_databases.len().max(1)
    }
}
