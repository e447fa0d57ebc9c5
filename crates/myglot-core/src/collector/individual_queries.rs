//! Individual executions of slow digests from the statement event tables.

use tracing::{debug, warn};

use crate::model::{IndividualQueryRecord, truncate_query_text};
use crate::source::{SqlParam, SqlRow, SqlSource, fetch_with_timeout};

use super::QueryCollector;
use super::queries::{StatementSource, build_individual_queries_query};

impl<S: SqlSource + ?Sized> QueryCollector<'_, S> {
    /// Fetches executions of each digest from current, recent and historical
    /// statement tables, concatenated in that order per digest.
    ///
    /// A failed source query is logged and contributes no rows; the other
    /// sources for the same digest still run. Records without a database
    /// lose their literal sample text.
    pub async fn collect_individual_queries(&self, digests: &[String]) -> Vec<IndividualQueryRecord> {
        if digests.is_empty() {
            return Vec::new();
        }

        let limit = self.config.individual_query_limit();
        let threshold = self.config.response_time_threshold_ms();
        let mut records = Vec::new();

        for digest in digests {
            for source in StatementSource::ALL {
                let sql = build_individual_queries_query(source);
                let params = [
                    SqlParam::from(digest.as_str()),
                    SqlParam::UInt(threshold),
                    SqlParam::UInt(limit),
                ];
                match fetch_with_timeout(self.source, self.config.query_timeout, &sql, &params).await {
                    Ok(rows) => {
                        let before = records.len();
                        records.extend(
                            rows.iter()
                                .take(usize::try_from(limit).unwrap_or(usize::MAX))
                                .map(|row| parse_individual_row(row, digest)),
                        );
                        debug!(
                            digest = %digest,
                            table = source.table(),
                            rows = records.len() - before,
                            "individual queries fetched"
                        );
                    }
                    Err(e) => {
                        warn!(digest = %digest, table = source.table(), error = %e, "individual query fetch failed");
                    }
                }
            }
        }

        records
    }
}

fn parse_individual_row(row: &SqlRow, digest: &str) -> IndividualQueryRecord {
    let query_id = row
        .text("query_id")
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| digest.to_string());

    let mut record = IndividualQueryRecord {
        query_id,
        query_text: row.text("query_text").as_deref().map(truncate_query_text),
        query_sample_text: row.text("query_sample_text"),
        event_id: row.u64("event_id"),
        thread_id: row.u64("thread_id"),
        execution_time_ms: row.f64("execution_time_ms"),
        rows_sent: row.u64("rows_sent"),
        rows_examined: row.u64("rows_examined"),
        database_name: row.text("database_name").filter(|d| !d.is_empty()),
    };
    if record.database_name.is_none() {
        debug!(query_id = %record.query_id, "execution without database, sample text dropped");
        record.strip_sample_text();
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryMonitoringConfig;
    use crate::model::QueryGroup;
    use crate::source::{DbError, MockSource, SqlValue};
    use crate::version::{Dialect, ServerVersion};

    fn exec_row(digest: &str, event_id: u64, time_ms: f64, db: Option<&str>) -> SqlRow {
        SqlRow::new()
            .with("query_id", digest)
            .with("query_text", "SELECT * FROM `orders` WHERE `id` = ?")
            .with("query_sample_text", "SELECT * FROM orders WHERE id = 42")
            .with("event_id", event_id)
            .with("thread_id", 77u64)
            .with("execution_time_ms", time_ms)
            .with("rows_sent", 1u64)
            .with("rows_examined", 1000u64)
            .with("database_name", db)
    }

    fn dialect() -> Dialect {
        Dialect::for_version(ServerVersion::new(8, 0, 36))
    }

    #[tokio::test]
    async fn empty_digest_list_issues_no_queries() {
        let source = MockSource::new();
        let cfg = QueryMonitoringConfig::new();
        let records = QueryCollector::new(&source, &cfg, dialect())
            .collect_individual_queries(&[])
            .await;
        assert!(records.is_empty());
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn provenance_order_beats_execution_time() {
        // Current executions are fastest, historical slowest.
        let source = MockSource::new()
            .on(
                "events_statements_history_long",
                vec![exec_row("d1", 3, 9000.0, Some("shop"))],
            )
            .on(
                "events_statements_history\n",
                vec![exec_row("d1", 2, 5000.0, Some("shop"))],
            )
            .on(
                "events_statements_current",
                vec![exec_row("d1", 1, 600.0, Some("shop"))],
            );
        let cfg = QueryMonitoringConfig::new();

        let records = QueryCollector::new(&source, &cfg, dialect())
            .collect_individual_queries(&["d1".to_string()])
            .await;

        let ids: Vec<Option<u64>> = records.iter().map(|r| r.event_id).collect();
        assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn three_bounded_queries_per_digest() {
        let source = MockSource::new();
        let cfg = QueryMonitoringConfig::new()
            .with_query_count_threshold(5)
            .with_response_time_threshold_ms(250);
        let digests = vec!["d1".to_string(), "d2".to_string()];

        QueryCollector::new(&source, &cfg, dialect())
            .collect_individual_queries(&digests)
            .await;

        let calls = source.calls();
        assert_eq!(calls.len(), 6);
        for call in &calls {
            assert_eq!(call.params[1], SqlParam::UInt(250));
            assert_eq!(call.params[2], SqlParam::UInt(5));
        }
        assert_eq!(calls[0].params[0], SqlParam::from("d1"));
        assert_eq!(calls[3].params[0], SqlParam::from("d2"));
        assert!(calls[0].sql.contains("events_statements_current"));
        assert!(calls[2].sql.contains("events_statements_history_long"));
    }

    #[tokio::test]
    async fn failed_source_does_not_stop_others() {
        let source = MockSource::new()
            .fail_on("events_statements_current", DbError::Timeout(std::time::Duration::from_secs(10)))
            .on(
                "events_statements_history_long",
                vec![exec_row("d1", 9, 700.0, Some("shop"))],
            );
        let cfg = QueryMonitoringConfig::new();

        let records = QueryCollector::new(&source, &cfg, dialect())
            .collect_individual_queries(&["d1".to_string()])
            .await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_id, Some(9));
    }

    #[tokio::test]
    async fn null_database_kept_without_sample_text() {
        let source = MockSource::new().on(
            "events_statements_current",
            vec![
                exec_row("d1", 1, 800.0, None),
                exec_row("d1", 2, 700.0, Some("shop")),
            ],
        );
        let cfg = QueryMonitoringConfig::new();

        let records = QueryCollector::new(&source, &cfg, dialect())
            .collect_individual_queries(&["d1".to_string()])
            .await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].database_name, None);
        assert_eq!(records[0].query_sample_text, None);
        assert!(records[1].query_sample_text.is_some());

        let groups = QueryGroup::group(&records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].database, "shop");
        assert_eq!(groups[0].queries.len(), 1);
    }

    #[test]
    fn missing_digest_column_falls_back_to_requested_digest() {
        let row = SqlRow::new()
            .with("query_id", SqlValue::Null)
            .with("database_name", "shop");
        let record = parse_individual_row(&row, "d9");
        assert_eq!(record.query_id, "d9");
    }
}
