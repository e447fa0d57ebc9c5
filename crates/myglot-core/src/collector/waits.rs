//! Wait-event aggregates per digest.

use tracing::debug;

use crate::model::{WaitCategory, WaitEventRecord, truncate_query_text};
use crate::source::{DbError, SqlParam, SqlRow, SqlSource, fetch_with_timeout};

use super::QueryCollector;
use super::queries::build_wait_events_query;

impl<S: SqlSource + ?Sized> QueryCollector<'_, S> {
    /// Collects wait time grouped by digest, database and wait event, largest first.
    pub async fn collect_wait_events(&self) -> Result<Vec<WaitEventRecord>, DbError> {
        let sql = build_wait_events_query(self.excluded_count());
        let mut params = self.excluded_params();
        params.push(SqlParam::UInt(self.config.query_count_threshold()));

        let rows = fetch_with_timeout(self.source, self.config.query_timeout, &sql, &params).await?;
        let limit = usize::try_from(self.config.query_count_threshold()).unwrap_or(usize::MAX);

        let records: Vec<WaitEventRecord> = rows
            .iter()
            .map(parse_wait_row)
            .filter(|r| {
                r.database_name
                    .as_deref()
                    .is_none_or(|db| !self.config.excluded_databases.contains(db))
            })
            .take(limit)
            .collect();

        debug!(rows = rows.len(), records = records.len(), "wait events collected");
        Ok(records)
    }
}

fn parse_wait_row(row: &SqlRow) -> WaitEventRecord {
    let wait_event_name = row.text("wait_event_name");
    WaitEventRecord {
        query_id: row.text("query_id"),
        query_text: row.text("query_text").as_deref().map(truncate_query_text),
        database_name: row.text("database_name"),
        wait_category: wait_event_name.as_deref().map(WaitCategory::classify),
        wait_event_name,
        total_wait_time_ms: row.f64("total_wait_time_ms"),
        wait_event_count: row.u64("wait_event_count"),
        avg_wait_time_ms: row.f64("avg_wait_time_ms"),
        collection_timestamp: row.text("collection_timestamp"),
    }
}
