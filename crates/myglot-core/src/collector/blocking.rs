//! Blocked transactions paired with their blockers.

use tracing::debug;

use crate::model::{BlockingSessionRecord, truncate_query_text};
use crate::source::{DbError, SqlParam, SqlRow, SqlSource, fetch_with_timeout};

use super::QueryCollector;
use super::queries::build_blocking_sessions_query;

impl<S: SqlSource + ?Sized> QueryCollector<'_, S> {
    /// Collects lock waits, oldest blocked transaction first.
    ///
    /// The lock-wait table depends on the server version: see
    /// [`Dialect::lock_wait_source`](crate::version::Dialect::lock_wait_source).
    pub async fn collect_blocking_sessions(&self) -> Result<Vec<BlockingSessionRecord>, DbError> {
        let sql = build_blocking_sessions_query(&self.dialect, self.excluded_count());
        let mut params = self.excluded_params();
        params.push(SqlParam::UInt(self.config.query_count_threshold()));

        let rows = fetch_with_timeout(self.source, self.config.query_timeout, &sql, &params).await?;
        let limit = usize::try_from(self.config.query_count_threshold()).unwrap_or(usize::MAX);

        let records: Vec<BlockingSessionRecord> = rows
            .iter()
            .map(parse_blocking_row)
            .filter(|r| {
                r.database_name
                    .as_deref()
                    .is_none_or(|db| !self.config.excluded_databases.contains(db))
            })
            .take(limit)
            .collect();

        debug!(rows = rows.len(), records = records.len(), "blocking sessions collected");
        Ok(records)
    }
}

fn parse_blocking_row(row: &SqlRow) -> BlockingSessionRecord {
    BlockingSessionRecord {
        blocked_txn_id: row.text("blocked_txn_id"),
        blocked_pid: row.u64("blocked_pid"),
        blocked_thread_id: row.u64("blocked_thread_id"),
        blocked_query_id: row.text("blocked_query_id"),
        blocked_query: row.text("blocked_query").as_deref().map(truncate_query_text),
        blocked_host: row.text("blocked_host"),
        blocked_txn_start_time: row.text("blocked_txn_start_time"),
        blocked_status: row.text("blocked_status"),
        database_name: row.text("database_name"),
        blocking_txn_id: row.text("blocking_txn_id"),
        blocking_pid: row.u64("blocking_pid"),
        blocking_thread_id: row.u64("blocking_thread_id"),
        blocking_query_id: row.text("blocking_query_id"),
        blocking_query: row.text("blocking_query").as_deref().map(truncate_query_text),
        blocking_host: row.text("blocking_host"),
        blocking_txn_start_time: row.text("blocking_txn_start_time"),
        blocking_status: row.text("blocking_status"),
        collection_timestamp: row.text("collection_timestamp"),
    }
}
