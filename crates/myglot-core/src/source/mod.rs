//! SQL access abstraction.
//!
//! Collectors never touch the driver directly. They issue SQL through
//! [`SqlSource`] and read driver-independent [`SqlRow`]s, which lets the
//! whole pipeline run against [`MockSource`] in tests.
//!
//! ```text
//!   Pipeline ──► Connector ──connect(db)──► SqlSource ──fetch_all──► Vec<SqlRow>
//!                   │                          │
//!          ┌────────┴────────┐        ┌────────┴────────┐
//!   MySqlConnector    MockConnector   MySqlSource      MockSource
//! ```

pub mod mock;
#[cfg(feature = "mysql")]
mod mysql;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

pub use mock::{MockConnector, MockSource};
#[cfg(feature = "mysql")]
pub use mysql::{MySqlConnector, MySqlSource};

/// Error type for database access.
#[derive(Debug, Clone, PartialEq)]
pub enum DbError {
    /// Could not open a connection.
    Connect(String),
    /// The server rejected or failed the statement.
    Query(String),
    /// The statement did not finish within its deadline.
    Timeout(Duration),
    /// A returned value could not be converted.
    Decode(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Connect(msg) => write!(f, "MySQL connection failed: {}", msg),
            DbError::Query(msg) => write!(f, "MySQL query error: {}", msg),
            DbError::Timeout(limit) => write!(f, "MySQL query timed out after {:?}", limit),
            DbError::Decode(msg) => write!(f, "MySQL decode error: {}", msg),
        }
    }
}

impl std::error::Error for DbError {}

/// Positional statement parameter, bound to `?` placeholders in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Str(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Str(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

impl From<u64> for SqlParam {
    fn from(value: u64) -> Self {
        SqlParam::UInt(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Float(value)
    }
}

/// A single column value. `Null` is kept distinct from zero and empty string.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Returns the value as text. Numbers are rendered; NULL yields `None`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Int(v) => Some(v.to_string()),
            SqlValue::UInt(v) => Some(v.to_string()),
            SqlValue::Float(v) => Some(v.to_string()),
            SqlValue::Text(s) => Some(s.clone()),
        }
    }

    /// Returns the value as a float. Numeric text is parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Null => None,
            SqlValue::Int(v) => Some(*v as f64),
            SqlValue::UInt(v) => Some(*v as f64),
            SqlValue::Float(v) => Some(*v),
            SqlValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Returns the value as a signed integer. Floats are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Null => None,
            SqlValue::Int(v) => Some(*v),
            SqlValue::UInt(v) => i64::try_from(*v).ok(),
            SqlValue::Float(v) => Some(*v as i64),
            SqlValue::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
            }
        }
    }

    /// Returns the value as an unsigned integer. Negative values yield `None`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SqlValue::Null => None,
            SqlValue::Int(v) => u64::try_from(*v).ok(),
            SqlValue::UInt(v) => Some(*v),
            SqlValue::Float(v) if *v >= 0.0 => Some(*v as u64),
            SqlValue::Float(_) => None,
            SqlValue::Text(s) => s.trim().parse::<u64>().ok(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<u64> for SqlValue {
    fn from(value: u64) -> Self {
        SqlValue::UInt(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Float(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A result row with named columns, in server order.
///
/// Column lookup is case-insensitive since `performance_schema` mixes
/// upper-case column names with lower-case aliases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    columns: Vec<(String, SqlValue)>,
}

impl SqlRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column append, mostly for fixtures.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<SqlValue>) {
        self.columns.push((name.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Raw value by column name; a missing column reads as NULL.
    pub fn value(&self, name: &str) -> &SqlValue {
        self.columns
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
            .unwrap_or(&SqlValue::Null)
    }

    /// Raw value by position.
    pub fn value_at(&self, idx: usize) -> &SqlValue {
        self.columns
            .get(idx)
            .map(|(_, v)| v)
            .unwrap_or(&SqlValue::Null)
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.value(name).as_text()
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.value(name).as_f64()
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.value(name).as_i64()
    }

    pub fn u64(&self, name: &str) -> Option<u64> {
        self.value(name).as_u64()
    }
}

/// A connection (or pool) able to run statements.
///
/// Every call is independent; implementations must be usable from several
/// tasks at once.
#[async_trait]
pub trait SqlSource: Send + Sync {
    /// Runs a row-returning statement.
    async fn fetch_all(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<SqlRow>, DbError>;

    /// Runs a statement for its side effect; returns the affected row count.
    async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, DbError>;

    /// Releases the underlying connection(s). Safe to call more than once.
    async fn close(&self);
}

/// Opens [`SqlSource`]s, optionally scoped to a database.
#[async_trait]
pub trait Connector: Send + Sync {
    type Source: SqlSource + 'static;

    async fn connect(&self, database: Option<&str>) -> Result<Self::Source, DbError>;
}

/// Runs `fut` with a deadline. Expiry becomes [`DbError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, DbError>
where
    F: Future<Output = Result<T, DbError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DbError::Timeout(limit)),
    }
}

/// Runs a row-returning statement with a deadline.
pub async fn fetch_with_timeout<S: SqlSource + ?Sized>(
    source: &S,
    limit: Duration,
    sql: &str,
    params: &[SqlParam],
) -> Result<Vec<SqlRow>, DbError> {
    with_timeout(limit, source.fetch_all(sql, params)).await
}
