//! Statement digest aggregates and individual executions.

use std::collections::BTreeMap;

use super::{AttributeSet, MetricRecord};

/// Characters of statement text kept before the ellipsis marker.
pub const QUERY_TEXT_MAX_CHARS: usize = 4000;
pub const TRUNCATION_MARKER: &str = "...";

/// Truncates `text` to [`QUERY_TEXT_MAX_CHARS`] characters plus [`TRUNCATION_MARKER`].
///
/// Counts Unicode scalar values, so the cut never splits a character and the
/// result length is independent of how many bytes each character takes.
pub fn truncate_query_text(text: &str) -> String {
    match text.char_indices().nth(QUERY_TEXT_MAX_CHARS) {
        Some((cut, _)) => {
            let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
            out.push_str(&text[..cut]);
            out.push_str(TRUNCATION_MARKER);
            out
        }
        None => text.to_string(),
    }
}

/// Statement kind derived from the leading keyword of the digest text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl StatementType {
    pub fn classify(text: &str) -> Self {
        let head = text.trim_start();
        let starts = |kw: &str| head.get(..kw.len()).is_some_and(|p| p.eq_ignore_ascii_case(kw));
        if starts("SELECT") {
            StatementType::Select
        } else if starts("INSERT") {
            StatementType::Insert
        } else if starts("UPDATE") {
            StatementType::Update
        } else if starts("DELETE") {
            StatementType::Delete
        } else {
            StatementType::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementType::Select => "SELECT",
            StatementType::Insert => "INSERT",
            StatementType::Update => "UPDATE",
            StatementType::Delete => "DELETE",
            StatementType::Other => "OTHER",
        }
    }
}

/// Aggregate statistics for one statement digest.
///
/// Source: `performance_schema.events_statements_summary_by_digest`.
/// Every field but the digest mirrors a nullable source column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SlowQueryRecord {
    pub query_id: String,
    /// Digest text, truncated with [`truncate_query_text`].
    pub query_text: Option<String>,
    pub database_name: Option<String>,
    pub execution_count: Option<u64>,
    pub avg_cpu_time_ms: Option<f64>,
    pub avg_elapsed_time_ms: Option<f64>,
    pub avg_rows_examined: Option<f64>,
    pub avg_rows_affected: Option<f64>,
    pub has_full_table_scan: Option<bool>,
    pub statement_type: Option<StatementType>,
    /// UTC, `YYYY-MM-DDTHH:MM:SSZ`.
    pub last_execution_timestamp: Option<String>,
    pub collection_timestamp: Option<String>,
}

impl MetricRecord for SlowQueryRecord {
    fn attributes(&self) -> AttributeSet {
        let mut a = AttributeSet::new();
        a.text("query_id", Some(&self.query_id))
            .text("query_text", self.query_text.as_deref())
            .text("database_name", self.database_name.as_deref())
            .count("execution_count", self.execution_count)
            .gauge("avg_cpu_time_ms", self.avg_cpu_time_ms)
            .gauge("avg_elapsed_time_ms", self.avg_elapsed_time_ms)
            .gauge("avg_rows_examined", self.avg_rows_examined)
            .gauge("avg_rows_affected", self.avg_rows_affected)
            .text(
                "has_full_table_scan",
                self.has_full_table_scan.map(|b| if b { "Yes" } else { "No" }),
            )
            .text("statement_type", self.statement_type.map(|t| t.as_str()))
            .text(
                "last_execution_timestamp",
                self.last_execution_timestamp.as_deref(),
            )
            .text("collection_timestamp", self.collection_timestamp.as_deref());
        a
    }
}

/// One execution of a slow digest.
///
/// Sources (unioned, provenance dropped): `events_statements_current`,
/// `events_statements_history`, `events_statements_history_long`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndividualQueryRecord {
    pub query_id: String,
    /// Normalized digest text.
    pub query_text: Option<String>,
    /// Literal statement text. Only used to request a plan; never published.
    pub query_sample_text: Option<String>,
    pub event_id: Option<u64>,
    pub thread_id: Option<u64>,
    pub execution_time_ms: Option<f64>,
    pub rows_sent: Option<u64>,
    pub rows_examined: Option<u64>,
    pub database_name: Option<String>,
}

impl IndividualQueryRecord {
    /// Drops the literal statement text.
    pub fn strip_sample_text(&mut self) {
        self.query_sample_text = None;
    }
}

impl MetricRecord for IndividualQueryRecord {
    fn attributes(&self) -> AttributeSet {
        let mut a = AttributeSet::new();
        a.text("query_id", Some(&self.query_id))
            .text("query_text", self.query_text.as_deref())
            .count("event_id", self.event_id)
            .count("thread_id", self.thread_id)
            .gauge("execution_time_ms", self.execution_time_ms)
            .count("rows_sent", self.rows_sent)
            .count("rows_examined", self.rows_examined)
            .text("database_name", self.database_name.as_deref());
        a
    }
}

/// Individual executions sharing an owning database.
///
/// Used only to open one database-scoped connection per group for plan extraction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryGroup {
    pub database: String,
    pub queries: Vec<IndividualQueryRecord>,
}

impl QueryGroup {
    /// Groups records by database, preserving record order within each group.
    ///
    /// Records without a database are left out.
    pub fn group(records: &[IndividualQueryRecord]) -> Vec<QueryGroup> {
        let mut by_db: BTreeMap<&str, Vec<IndividualQueryRecord>> = BTreeMap::new();
        for record in records {
            if let Some(db) = record.database_name.as_deref() {
                by_db.entry(db).or_default().push(record.clone());
            }
        }
        by_db
            .into_iter()
            .map(|(database, queries)| QueryGroup {
                database: database.to_string(),
                queries,
            })
            .collect()
    }
}
