//! Server checks run before any collector.
//!
//! Version, reachability and the `performance_schema` switch are terminal:
//! without them every later query is meaningless. Consumer and instrument
//! checks only degrade the run, with one best-effort remediation attempt.

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::source::{DbError, SqlParam, SqlSource, fetch_with_timeout, with_timeout};
use crate::version::{Dialect, ServerVersion};

use super::queries::placeholders;

/// Consumers feeding the statement and wait collectors.
pub const REQUIRED_CONSUMERS: [&str; 6] = [
    "events_statements_current",
    "events_statements_history",
    "events_statements_history_long",
    "events_waits_current",
    "events_waits_history",
    "events_waits_history_long",
];

/// Fewer enabled consumers than this triggers remediation.
pub const MIN_ENABLED_CONSUMERS: usize = 5;

/// `setup_instruments` name patterns that must be enabled and timed.
pub const REQUIRED_INSTRUMENTS: [&str; 3] = ["wait/%", "statement/%", "%lock%"];

/// `sys` schema procedure patterns covering [`REQUIRED_CONSUMERS`].
const CONSUMER_PROCEDURE_PATTERNS: [&str; 2] = ["events_statements", "events_waits"];

/// Terminal precondition failure. The run produces no output.
#[derive(Debug, Clone, PartialEq)]
pub enum PreconditionError {
    /// The version query failed.
    Unreachable(DbError),
    UnsupportedVersion(ServerVersion),
    /// `performance_schema` is OFF (or its state could not be read).
    InstrumentationDisabled,
}

impl fmt::Display for PreconditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreconditionError::Unreachable(e) => write!(f, "server unreachable: {}", e),
            PreconditionError::UnsupportedVersion(v) => write!(
                f,
                "MySQL {} is not supported, query monitoring requires 8.0 or later",
                v
            ),
            PreconditionError::InstrumentationDisabled => write!(
                f,
                "performance_schema is disabled; set performance_schema=ON in my.cnf and restart the server"
            ),
        }
    }
}

impl std::error::Error for PreconditionError {}

/// Result of a non-terminal check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Already in the required state.
    Satisfied,
    /// Was not, and remediation succeeded.
    Remediated,
    /// Still not satisfied; collection continues with partial data.
    Degraded,
}

impl CheckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckOutcome::Satisfied => "satisfied",
            CheckOutcome::Remediated => "remediated",
            CheckOutcome::Degraded => "degraded",
        }
    }
}

/// Server facts established by a successful validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreconditionReport {
    pub version: ServerVersion,
    pub dialect: Dialect,
    pub consumers: CheckOutcome,
    pub instruments: CheckOutcome,
}

/// Runs the checks in order, stopping at the first terminal failure.
pub async fn validate_preconditions<S: SqlSource + ?Sized>(
    source: &S,
    timeout: Duration,
) -> Result<PreconditionReport, PreconditionError> {
    let version = resolve_version(source, timeout).await?;
    if !version.is_supported() {
        error!(version = %version, "unsupported MySQL version");
        return Err(PreconditionError::UnsupportedVersion(version));
    }

    if !instrumentation_enabled(source, timeout).await {
        error!(
            "performance_schema is disabled. Add `performance_schema=ON` under [mysqld] \
             in my.cnf and restart MySQL; it cannot be enabled at runtime"
        );
        return Err(PreconditionError::InstrumentationDisabled);
    }

    let consumers = check_consumers(source, timeout).await;
    let instruments = check_instruments(source, timeout).await;

    info!(
        version = %version,
        consumers = consumers.as_str(),
        instruments = instruments.as_str(),
        "preconditions validated"
    );
    Ok(PreconditionReport {
        version,
        dialect: Dialect::for_version(version),
        consumers,
        instruments,
    })
}

async fn resolve_version<S: SqlSource + ?Sized>(
    source: &S,
    timeout: Duration,
) -> Result<ServerVersion, PreconditionError> {
    let rows = fetch_with_timeout(source, timeout, "SELECT VERSION() AS version", &[])
        .await
        .map_err(PreconditionError::Unreachable)?;
    let raw = rows
        .first()
        .and_then(|r| r.value_at(0).as_text())
        .unwrap_or_default();
    let version = ServerVersion::parse_or_legacy(&raw);
    debug!(raw = %raw, version = %version, "server version resolved");
    Ok(version)
}

async fn instrumentation_enabled<S: SqlSource + ?Sized>(source: &S, timeout: Duration) -> bool {
    let sql = "SELECT VARIABLE_VALUE AS value \
               FROM performance_schema.global_variables \
               WHERE VARIABLE_NAME = 'performance_schema'";
    match fetch_with_timeout(source, timeout, sql, &[]).await {
        Ok(rows) => rows
            .first()
            .and_then(|r| r.text("value"))
            .is_some_and(|v| matches!(v.trim().to_ascii_uppercase().as_str(), "ON" | "1")),
        Err(e) => {
            warn!(error = %e, "failed to read performance_schema state");
            false
        }
    }
}

/// Names of required consumers reported enabled.
async fn enabled_consumers<S: SqlSource + ?Sized>(
    source: &S,
    timeout: Duration,
) -> Result<Vec<String>, DbError> {
    let sql = format!(
        "SELECT NAME AS name, ENABLED AS enabled \
         FROM performance_schema.setup_consumers \
         WHERE NAME IN ({})",
        placeholders(REQUIRED_CONSUMERS.len())
    );
    let params: Vec<SqlParam> = REQUIRED_CONSUMERS.iter().map(|c| SqlParam::from(*c)).collect();
    let rows = fetch_with_timeout(source, timeout, &sql, &params).await?;
    Ok(rows
        .iter()
        .filter(|r| r.text("enabled").is_some_and(|v| v.eq_ignore_ascii_case("YES")))
        .filter_map(|r| r.text("name"))
        .collect())
}

async fn check_consumers<S: SqlSource + ?Sized>(source: &S, timeout: Duration) -> CheckOutcome {
    let enabled = match enabled_consumers(source, timeout).await {
        Ok(enabled) => enabled,
        Err(e) => {
            warn!(error = %e, "failed to read setup_consumers");
            return CheckOutcome::Degraded;
        }
    };
    if enabled.len() >= MIN_ENABLED_CONSUMERS {
        return CheckOutcome::Satisfied;
    }

    let missing: Vec<&str> = REQUIRED_CONSUMERS
        .iter()
        .copied()
        .filter(|c| !enabled.iter().any(|e| e == c))
        .collect();
    warn!(
        enabled = enabled.len(),
        required = MIN_ENABLED_CONSUMERS,
        missing = ?missing,
        "performance_schema consumers disabled, attempting to enable"
    );

    match enable_consumers(source, timeout, &missing).await {
        Ok(()) => {
            info!(consumers = ?missing, "performance_schema consumers enabled");
            CheckOutcome::Remediated
        }
        Err(e) => {
            warn!(
                error = %e,
                "could not enable consumers; grant UPDATE on performance_schema.setup_consumers \
                 or enable them in my.cnf. Collected data may be incomplete"
            );
            CheckOutcome::Degraded
        }
    }
}

/// Tries the `sys` procedure first, then one `UPDATE` per consumer.
async fn enable_consumers<S: SqlSource + ?Sized>(
    source: &S,
    timeout: Duration,
    missing: &[&str],
) -> Result<(), DbError> {
    let mut procedure = Ok(());
    for pattern in CONSUMER_PROCEDURE_PATTERNS {
        procedure = with_timeout(
            timeout,
            source.execute("CALL sys.ps_setup_enable_consumer(?)", &[SqlParam::from(pattern)]),
        )
        .await
        .map(|_| ());
        if procedure.is_err() {
            break;
        }
    }
    match procedure {
        Ok(()) => return Ok(()),
        Err(e) => debug!(error = %e, "sys.ps_setup_enable_consumer failed, updating setup_consumers"),
    }

    for consumer in missing {
        with_timeout(
            timeout,
            source.execute(
                "UPDATE performance_schema.setup_consumers SET ENABLED = 'YES' WHERE NAME = ?",
                &[SqlParam::from(*consumer)],
            ),
        )
        .await?;
    }
    Ok(())
}

/// Instruments without timing support (memory/%) report `TIMED` as NULL and
/// are never counted or updated.
const INSTRUMENT_READINESS_SQL: &str = "SELECT COUNT(*) AS total, \
     CAST(COALESCE(SUM(ENABLED = 'YES' AND TIMED = 'YES'), 0) AS UNSIGNED) AS ready \
     FROM performance_schema.setup_instruments \
     WHERE NAME LIKE ? AND TIMED IS NOT NULL";

const ENABLE_INSTRUMENTS_SQL: &str = "UPDATE performance_schema.setup_instruments \
     SET ENABLED = 'YES', TIMED = 'YES' \
     WHERE NAME LIKE ? AND TIMED IS NOT NULL";

async fn check_instruments<S: SqlSource + ?Sized>(source: &S, timeout: Duration) -> CheckOutcome {
    let mut outcome = CheckOutcome::Satisfied;

    for pattern in REQUIRED_INSTRUMENTS {
        let rows = match fetch_with_timeout(
            source,
            timeout,
            INSTRUMENT_READINESS_SQL,
            &[SqlParam::from(pattern)],
        )
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(pattern, error = %e, "failed to read setup_instruments");
                outcome = CheckOutcome::Degraded;
                continue;
            }
        };
        let row = rows.first();
        let total = row.and_then(|r| r.u64("total")).unwrap_or(0);
        let ready = row.and_then(|r| r.u64("ready")).unwrap_or(0);
        if ready >= total {
            continue;
        }

        warn!(pattern, total, ready, "instruments not enabled and timed, attempting to enable");
        match with_timeout(
            timeout,
            source.execute(ENABLE_INSTRUMENTS_SQL, &[SqlParam::from(pattern)]),
        )
        .await
        {
            Ok(updated) => {
                debug!(pattern, updated, "instruments enabled");
                if outcome == CheckOutcome::Satisfied {
                    outcome = CheckOutcome::Remediated;
                }
            }
            Err(e) => {
                warn!(pattern, error = %e, "could not enable instruments, collected data may be incomplete");
                outcome = CheckOutcome::Degraded;
            }
        }
    }

    outcome
}
