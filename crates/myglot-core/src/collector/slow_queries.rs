//! Slow statement digests from `events_statements_summary_by_digest`.

use chrono::{NaiveDateTime, TimeDelta};
use tracing::{debug, warn};

use crate::config::QueryMonitoringConfig;
use crate::model::{SlowQueryRecord, StatementType, truncate_query_text};
use crate::source::{DbError, SqlParam, SqlRow, SqlSource, fetch_with_timeout};

use super::QueryCollector;
use super::queries::build_slow_queries_query;

/// Timestamp layout produced by the `DATE_FORMAT` calls in the digest query.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Slow digests ordered by average elapsed time, plus their digests for correlation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlowQueryBatch {
    pub records: Vec<SlowQueryRecord>,
    /// Distinct digests in record order.
    pub digests: Vec<String>,
}

impl SlowQueryBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<S: SqlSource + ?Sized> QueryCollector<'_, S> {
    /// Collects digests last seen within the configured window.
    ///
    /// Rows without a digest are skipped with a warning. Results never exceed
    /// the clamped count threshold and never include an excluded schema.
    pub async fn collect_slow_queries(&self) -> Result<SlowQueryBatch, DbError> {
        let sql = build_slow_queries_query(&self.dialect, self.excluded_count());

        let mut params = Vec::with_capacity(self.excluded_count() + 2);
        params.push(SqlParam::UInt(self.config.slow_query_fetch_interval()));
        params.extend(self.excluded_params());
        params.push(SqlParam::UInt(self.config.query_count_threshold()));

        let rows = fetch_with_timeout(self.source, self.config.query_timeout, &sql, &params).await?;
        let batch = parse_slow_query_rows(&rows, self.config);

        debug!(
            rows = rows.len(),
            records = batch.records.len(),
            digests = batch.digests.len(),
            "slow queries collected"
        );
        Ok(batch)
    }
}

fn parse_slow_query_rows(rows: &[SqlRow], config: &QueryMonitoringConfig) -> SlowQueryBatch {
    let limit = usize::try_from(config.query_count_threshold()).unwrap_or(usize::MAX);
    let window = config.slow_query_fetch_interval();
    let mut batch = SlowQueryBatch::default();

    for row in rows {
        if batch.records.len() >= limit {
            break;
        }

        let Some(query_id) = row.text("query_id").filter(|d| !d.is_empty()) else {
            warn!("slow query row without digest skipped");
            continue;
        };

        let database_name = row.text("database_name");
        if let Some(ref db) = database_name
            && config.excluded_databases.contains(db)
        {
            debug!(database = %db, query_id = %query_id, "excluded database row skipped");
            continue;
        }

        let last_execution_timestamp = row.text("last_execution_timestamp");
        let collection_timestamp = row.text("collection_timestamp");
        if !seen_within_window(
            last_execution_timestamp.as_deref(),
            collection_timestamp.as_deref(),
            window,
        ) {
            debug!(query_id = %query_id, "digest last seen outside window skipped");
            continue;
        }

        let raw_text = row.text("query_text");
        let statement_type = raw_text.as_deref().map(StatementType::classify);

        if !batch.digests.contains(&query_id) {
            batch.digests.push(query_id.clone());
        }
        batch.records.push(SlowQueryRecord {
            query_id,
            query_text: raw_text.as_deref().map(truncate_query_text),
            database_name,
            execution_count: row.u64("execution_count"),
            avg_cpu_time_ms: row.f64("avg_cpu_time_ms"),
            avg_elapsed_time_ms: row.f64("avg_elapsed_time_ms"),
            avg_rows_examined: row.f64("avg_rows_examined"),
            avg_rows_affected: row.f64("avg_rows_affected"),
            has_full_table_scan: row.text("has_full_table_scan").map(|v| parse_yes_no(&v)),
            statement_type,
            last_execution_timestamp,
            collection_timestamp,
        });
    }

    batch
}

fn parse_yes_no(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "y" | "true" | "1"
    )
}

/// Checks `last_seen` against the server's own collection time, so agent
/// clock skew cannot drop rows. Unparseable or missing stamps pass.
fn seen_within_window(last_seen: Option<&str>, collected: Option<&str>, window_secs: u64) -> bool {
    let (Some(last_seen), Some(collected)) = (last_seen, collected) else {
        return true;
    };
    let (Ok(last_seen), Ok(collected)) = (
        NaiveDateTime::parse_from_str(last_seen, TIMESTAMP_FORMAT),
        NaiveDateTime::parse_from_str(collected, TIMESTAMP_FORMAT),
    ) else {
        return true;
    };
    let window = TimeDelta::seconds(i64::try_from(window_secs).unwrap_or(i64::MAX / 1000));
    last_seen >= collected - window
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExcludedDatabases;
    use crate::model::QUERY_TEXT_MAX_CHARS;
    use crate::source::{MockSource, SqlValue};
    use crate::version::{Dialect, ServerVersion};

    const NOW: &str = "2026-10-18T12:00:30Z";

    fn digest_row(digest: Option<&str>, db: Option<&str>, last_seen: &str) -> SqlRow {
        SqlRow::new()
            .with("query_id", digest)
            .with("query_text", "SELECT * FROM `orders` WHERE `id` = ?")
            .with("database_name", db)
            .with("execution_count", 12u64)
            .with("avg_cpu_time_ms", SqlValue::Null)
            .with("avg_elapsed_time_ms", 840.5)
            .with("avg_rows_examined", 1000.0)
            .with("avg_rows_affected", 0.0)
            .with("has_full_table_scan", "Yes")
            .with("last_execution_timestamp", last_seen)
            .with("collection_timestamp", NOW)
    }

    fn config() -> QueryMonitoringConfig {
        QueryMonitoringConfig::new()
            .with_enabled(true)
            .with_slow_query_fetch_interval(30)
            .with_query_count_threshold(20)
            .with_excluded_databases(ExcludedDatabases::with(["mysql", "sys"]))
    }

    fn dialect() -> Dialect {
        Dialect::for_version(ServerVersion::new(8, 0, 36))
    }

    #[tokio::test]
    async fn collects_digests_within_window() {
        let rows = vec![
            digest_row(Some("d1"), Some("shop"), "2026-10-18T12:00:10Z"),
            digest_row(Some("d2"), Some("shop"), "2026-10-18T12:00:20Z"),
            digest_row(Some("d3"), Some("billing"), "2026-10-18T12:00:29Z"),
        ];
        let source = MockSource::new().on("events_statements_summary_by_digest", rows);
        let cfg = config();

        let batch = QueryCollector::new(&source, &cfg, dialect())
            .collect_slow_queries()
            .await
            .unwrap();

        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.digests, vec!["d1", "d2", "d3"]);

        let first = &batch.records[0];
        assert_eq!(first.avg_cpu_time_ms, None);
        assert_eq!(first.avg_rows_affected, Some(0.0));
        assert_eq!(first.has_full_table_scan, Some(true));
        assert_eq!(first.statement_type, Some(StatementType::Select));

        let call = &source.calls()[0];
        assert_eq!(call.params[0], SqlParam::UInt(30));
        assert_eq!(call.params.last(), Some(&SqlParam::UInt(20)));
        assert!(call.params.contains(&SqlParam::from("sys")));
    }

    #[tokio::test]
    async fn skips_null_digest_and_excluded_database() {
        let rows = vec![
            digest_row(None, Some("shop"), NOW),
            digest_row(Some("d1"), Some("mysql"), NOW),
            digest_row(Some("d2"), Some("shop"), NOW),
        ];
        let source = MockSource::new().on("events_statements_summary_by_digest", rows);
        let cfg = config();

        let batch = QueryCollector::new(&source, &cfg, dialect())
            .collect_slow_queries()
            .await
            .unwrap();

        assert_eq!(batch.digests, vec!["d2"]);
        assert!(
            batch
                .records
                .iter()
                .all(|r| !cfg.excluded_databases.contains(r.database_name.as_deref().unwrap_or("")))
        );
    }

    #[tokio::test]
    async fn never_exceeds_clamped_ceiling() {
        let rows: Vec<SqlRow> = (0..150)
            .map(|i| digest_row(Some(format!("d{i}").as_str()), Some("shop"), NOW))
            .collect();
        let source = MockSource::new().on("events_statements_summary_by_digest", rows);
        let cfg = config().with_query_count_threshold(500);

        let batch = QueryCollector::new(&source, &cfg, dialect())
            .collect_slow_queries()
            .await
            .unwrap();

        assert_eq!(batch.records.len(), 100);
        assert_eq!(batch.digests.len(), 100);
    }

    #[tokio::test]
    async fn preserves_nulls_and_truncates_text() {
        let long = "SELECT ".to_string() + &"a".repeat(5000);
        let row = SqlRow::new()
            .with("query_id", "d1")
            .with("query_text", long.as_str())
            .with("database_name", SqlValue::Null);
        let source = MockSource::new().on("events_statements_summary_by_digest", vec![row]);
        let cfg = config();

        let batch = QueryCollector::new(&source, &cfg, dialect())
            .collect_slow_queries()
            .await
            .unwrap();

        let record = &batch.records[0];
        assert_eq!(record.database_name, None);
        assert_eq!(record.execution_count, None);
        assert_eq!(record.has_full_table_scan, None);
        let text = record.query_text.as_deref().unwrap();
        assert_eq!(text.chars().count(), QUERY_TEXT_MAX_CHARS + 3);
        assert!(text.ends_with("..."));
    }

    #[tokio::test]
    async fn query_failure_propagates() {
        let source = MockSource::new().fail_on(
            "events_statements_summary_by_digest",
            DbError::Query("1142: SELECT command denied".to_string()),
        );
        let cfg = config();
        let result = QueryCollector::new(&source, &cfg, dialect())
            .collect_slow_queries()
            .await;
        assert!(matches!(result, Err(DbError::Query(_))));
    }

    #[test]
    fn window_check_uses_server_clock() {
        assert!(seen_within_window(Some("2026-10-18T12:00:00Z"), Some(NOW), 30));
        assert!(!seen_within_window(Some("2026-10-18T11:59:59Z"), Some(NOW), 30));
        assert!(seen_within_window(None, Some(NOW), 30));
        assert!(seen_within_window(Some("garbage"), Some(NOW), 30));
    }

    #[test]
    fn duplicate_digest_across_schemas_listed_once() {
        let rows = vec![
            digest_row(Some("d1"), Some("shop"), NOW),
            digest_row(Some("d1"), Some("billing"), NOW),
        ];
        let batch = parse_slow_query_rows(&rows, &config());
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.digests, vec!["d1"]);
    }
}
