//! Query-monitoring configuration.
//!
//! Every numeric threshold is clamped into a documented range; out-of-range
//! input is corrected with a warning rather than rejected.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Schemas never monitored, merged into every excluded-database set.
pub const DEFAULT_EXCLUDED_DATABASES: [&str; 5] =
    ["", "mysql", "information_schema", "performance_schema", "sys"];

pub const DEFAULT_SLOW_QUERY_FETCH_INTERVAL: u64 = 30;
pub const MIN_SLOW_QUERY_FETCH_INTERVAL: u64 = 1;
pub const MAX_SLOW_QUERY_FETCH_INTERVAL: u64 = 3600;

pub const DEFAULT_RESPONSE_TIME_THRESHOLD_MS: u64 = 500;
pub const MIN_RESPONSE_TIME_THRESHOLD_MS: u64 = 0;
pub const MAX_RESPONSE_TIME_THRESHOLD_MS: u64 = 60_000;

pub const DEFAULT_QUERY_COUNT_THRESHOLD: u64 = 20;
pub const MIN_QUERY_COUNT_THRESHOLD: u64 = 1;
/// Hard ceiling on rows fetched by any aggregate collector.
pub const MAX_QUERY_COUNT_THRESHOLD: u64 = 100;

/// Per-source ceiling on individual executions fetched for one digest.
pub const INDIVIDUAL_QUERY_CEILING: u64 = 10;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PLAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Records per publish operation.
pub const DEFAULT_PUBLISH_CHUNK_SIZE: usize = 100;

/// Configuration error, reported at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Excluded-database list is not a JSON array of strings.
    InvalidExcludedDatabases(String),
    /// Custom query list is not valid JSON.
    InvalidCustomQueries(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidExcludedDatabases(msg) => {
                write!(f, "excluded databases must be a JSON array of strings: {}", msg)
            }
            ConfigError::InvalidCustomQueries(msg) => {
                write!(f, "invalid custom query configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parameters for opening MySQL connections.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    /// Default database of the main connection, if any.
    pub database: Option<String>,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: None,
            database: None,
            max_connections: 4,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// A user-defined query run alongside the built-in collectors.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CustomQuery {
    pub query: String,
    /// Event type for published rows. Defaults to `MysqlCustomQuerySample`.
    #[serde(default)]
    pub event_type: Option<String>,
    /// Runs on a connection scoped to this database when set.
    #[serde(default)]
    pub database: Option<String>,
}

impl CustomQuery {
    pub fn event_type(&self) -> &str {
        self.event_type
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("MysqlCustomQuerySample")
    }
}

/// Parses a JSON array of custom query definitions.
pub fn parse_custom_queries(raw: &str) -> Result<Vec<CustomQuery>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let queries: Vec<CustomQuery> =
        serde_json::from_str(raw).map_err(|e| ConfigError::InvalidCustomQueries(e.to_string()))?;
    Ok(queries
        .into_iter()
        .filter(|q| {
            let keep = !q.query.trim().is_empty();
            if !keep {
                warn!("ignoring custom query with empty text");
            }
            keep
        })
        .collect())
}

/// Schemas excluded from every collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedDatabases {
    names: BTreeSet<String>,
}

impl Default for ExcludedDatabases {
    fn default() -> Self {
        Self {
            names: DEFAULT_EXCLUDED_DATABASES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ExcludedDatabases {
    /// Parses a JSON array (e.g. `["shop","audit"]`) and merges the defaults in.
    ///
    /// An empty or blank string yields the defaults only.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut set = Self::default();
        if raw.trim().is_empty() {
            return Ok(set);
        }
        let names: Vec<String> = serde_json::from_str(raw)
            .map_err(|e| ConfigError::InvalidExcludedDatabases(e.to_string()))?;
        for name in names {
            set.names.insert(name.trim().to_string());
        }
        Ok(set)
    }

    pub fn with<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::default();
        set.names.extend(names.into_iter().map(Into::into));
        set
    }

    pub fn contains(&self, database: &str) -> bool {
        self.names.contains(database)
    }

    /// Names in deterministic order, for binding as SQL parameters.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn clamp_logged(name: &str, value: u64, min: u64, max: u64) -> u64 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!(setting = name, value, min, max, used = clamped, "setting out of range, clamped");
    }
    clamped
}

/// Settings for one query-performance collection cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMonitoringConfig {
    pub enabled: bool,
    /// Window, in seconds, a digest must have been seen within.
    slow_query_fetch_interval: u64,
    /// Minimum execution time, in milliseconds, of an individual execution.
    response_time_threshold_ms: u64,
    /// Ceiling for slow-query, wait-event and blocking-session result counts.
    query_count_threshold: u64,
    pub excluded_databases: ExcludedDatabases,
    pub query_timeout: Duration,
    pub plan_timeout: Duration,
    pub publish_chunk_size: usize,
    pub custom_queries: Vec<CustomQuery>,
}

impl Default for QueryMonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            slow_query_fetch_interval: DEFAULT_SLOW_QUERY_FETCH_INTERVAL,
            response_time_threshold_ms: DEFAULT_RESPONSE_TIME_THRESHOLD_MS,
            query_count_threshold: DEFAULT_QUERY_COUNT_THRESHOLD,
            excluded_databases: ExcludedDatabases::default(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            plan_timeout: DEFAULT_PLAN_TIMEOUT,
            publish_chunk_size: DEFAULT_PUBLISH_CHUNK_SIZE,
            custom_queries: Vec::new(),
        }
    }
}

impl QueryMonitoringConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_slow_query_fetch_interval(mut self, seconds: u64) -> Self {
        self.slow_query_fetch_interval = clamp_logged(
            "slow_query_fetch_interval",
            seconds,
            MIN_SLOW_QUERY_FETCH_INTERVAL,
            MAX_SLOW_QUERY_FETCH_INTERVAL,
        );
        self
    }

    pub fn with_response_time_threshold_ms(mut self, ms: u64) -> Self {
        self.response_time_threshold_ms = clamp_logged(
            "query_response_time_threshold",
            ms,
            MIN_RESPONSE_TIME_THRESHOLD_MS,
            MAX_RESPONSE_TIME_THRESHOLD_MS,
        );
        self
    }

    pub fn with_query_count_threshold(mut self, count: u64) -> Self {
        self.query_count_threshold = clamp_logged(
            "query_count_threshold",
            count,
            MIN_QUERY_COUNT_THRESHOLD,
            MAX_QUERY_COUNT_THRESHOLD,
        );
        self
    }

    pub fn with_excluded_databases(mut self, excluded: ExcludedDatabases) -> Self {
        self.excluded_databases = excluded;
        self
    }

    pub fn with_timeouts(mut self, query: Duration, plan: Duration) -> Self {
        self.query_timeout = query;
        self.plan_timeout = plan;
        self
    }

    pub fn with_publish_chunk_size(mut self, size: usize) -> Self {
        self.publish_chunk_size = size.max(1);
        self
    }

    pub fn with_custom_queries(mut self, queries: Vec<CustomQuery>) -> Self {
        self.custom_queries = queries;
        self
    }

    pub fn slow_query_fetch_interval(&self) -> u64 {
        self.slow_query_fetch_interval
    }

    pub fn response_time_threshold_ms(&self) -> u64 {
        self.response_time_threshold_ms
    }

    pub fn query_count_threshold(&self) -> u64 {
        self.query_count_threshold
    }

    /// Per-source limit for individual executions of one digest.
    pub fn individual_query_limit(&self) -> u64 {
        INDIVIDUAL_QUERY_CEILING.min(self.query_count_threshold)
    }
}
