//! SQL builders for `performance_schema` instrumentation tables.
//!
//! Placeholders are positional `?`; every builder documents its parameter order.
//! Timer columns are picoseconds: divide by 1e9 for milliseconds.

use crate::version::{Dialect, LockWaitSource};

/// Renders `?, ?, ?` for an `IN (...)` list. Never empty: an empty list
/// renders a single placeholder that callers bind to `""`.
pub(super) fn placeholders(count: usize) -> String {
    vec!["?"; count.max(1)].join(", ")
}

/// Slow digests seen within a window.
///
/// Params: window seconds, excluded schemas..., limit.
pub(super) fn build_slow_queries_query(dialect: &Dialect, excluded: usize) -> String {
    let cpu_expr = if dialect.cpu_time_available() {
        "CAST(ROUND(SUM_CPU_TIME / NULLIF(COUNT_STAR, 0) / 1000000000, 3) AS DOUBLE)"
    } else {
        "NULL"
    };
    let excluded = placeholders(excluded);

    format!(
        r#"
            SELECT
                DIGEST AS query_id,
                DIGEST_TEXT AS query_text,
                SCHEMA_NAME AS database_name,
                COUNT_STAR AS execution_count,
                {cpu_expr} AS avg_cpu_time_ms,
                CAST(ROUND(SUM_TIMER_WAIT / NULLIF(COUNT_STAR, 0) / 1000000000, 3) AS DOUBLE) AS avg_elapsed_time_ms,
                CAST(SUM_ROWS_EXAMINED / NULLIF(COUNT_STAR, 0) AS DOUBLE) AS avg_rows_examined,
                CAST(SUM_ROWS_AFFECTED / NULLIF(COUNT_STAR, 0) AS DOUBLE) AS avg_rows_affected,
                CASE WHEN SUM_NO_INDEX_USED > 0 THEN 'Yes' ELSE 'No' END AS has_full_table_scan,
                DATE_FORMAT(CONVERT_TZ(LAST_SEEN, @@session.time_zone, '+00:00'), '%Y-%m-%dT%H:%i:%sZ') AS last_execution_timestamp,
                DATE_FORMAT(UTC_TIMESTAMP(), '%Y-%m-%dT%H:%i:%sZ') AS collection_timestamp
            FROM performance_schema.events_statements_summary_by_digest
            WHERE LAST_SEEN >= NOW() - INTERVAL ? SECOND
                AND SCHEMA_NAME IS NOT NULL
                AND SCHEMA_NAME NOT IN ({excluded})
            ORDER BY avg_elapsed_time_ms DESC
            LIMIT ?
        "#
    )
}

/// Statement event tables, in the order their rows are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatementSource {
    /// Statements executing right now.
    Current,
    /// Last few statements per thread.
    Recent,
    /// Server-wide long history.
    Historical,
}

impl StatementSource {
    pub(crate) const ALL: [StatementSource; 3] = [
        StatementSource::Current,
        StatementSource::Recent,
        StatementSource::Historical,
    ];

    pub(crate) fn table(&self) -> &'static str {
        match self {
            StatementSource::Current => "events_statements_current",
            StatementSource::Recent => "events_statements_history",
            StatementSource::Historical => "events_statements_history_long",
        }
    }
}

/// Individual executions of one digest from one statement table.
///
/// Params: digest, response time threshold (ms), limit.
pub(super) fn build_individual_queries_query(source: StatementSource) -> String {
    let table = source.table();
    format!(
        r#"
            SELECT
                DIGEST AS query_id,
                DIGEST_TEXT AS query_text,
                SQL_TEXT AS query_sample_text,
                EVENT_ID AS event_id,
                THREAD_ID AS thread_id,
                CAST(ROUND(TIMER_WAIT / 1000000000, 3) AS DOUBLE) AS execution_time_ms,
                ROWS_SENT AS rows_sent,
                ROWS_EXAMINED AS rows_examined,
                CURRENT_SCHEMA AS database_name
            FROM performance_schema.{table}
            WHERE DIGEST = ?
                AND TIMER_WAIT / 1000000000 > ?
            ORDER BY TIMER_WAIT DESC
            LIMIT ?
        "#
    )
}

/// Wait time per digest/database/event across current and recent waits.
///
/// Params: excluded schemas..., limit.
pub(super) fn build_wait_events_query(excluded: usize) -> String {
    let excluded = placeholders(excluded);
    format!(
        r#"
            SELECT
                stmt.DIGEST AS query_id,
                stmt.DIGEST_TEXT AS query_text,
                stmt.CURRENT_SCHEMA AS database_name,
                w.EVENT_NAME AS wait_event_name,
                CAST(ROUND(SUM(w.TIMER_WAIT) / 1000000000, 3) AS DOUBLE) AS total_wait_time_ms,
                COUNT(*) AS wait_event_count,
                CAST(ROUND(SUM(w.TIMER_WAIT) / COUNT(*) / 1000000000, 3) AS DOUBLE) AS avg_wait_time_ms,
                DATE_FORMAT(UTC_TIMESTAMP(), '%Y-%m-%dT%H:%i:%sZ') AS collection_timestamp
            FROM (
                SELECT THREAD_ID, EVENT_ID, EVENT_NAME, TIMER_WAIT
                FROM performance_schema.events_waits_current
                UNION ALL
                SELECT THREAD_ID, EVENT_ID, EVENT_NAME, TIMER_WAIT
                FROM performance_schema.events_waits_history
            ) AS w
            JOIN (
                SELECT THREAD_ID, DIGEST, DIGEST_TEXT, CURRENT_SCHEMA
                FROM performance_schema.events_statements_current
                UNION ALL
                SELECT THREAD_ID, DIGEST, DIGEST_TEXT, CURRENT_SCHEMA
                FROM performance_schema.events_statements_history
            ) AS stmt ON stmt.THREAD_ID = w.THREAD_ID
            WHERE stmt.DIGEST IS NOT NULL
                AND stmt.CURRENT_SCHEMA IS NOT NULL
                AND stmt.CURRENT_SCHEMA NOT IN ({excluded})
                AND w.TIMER_WAIT IS NOT NULL
            GROUP BY stmt.DIGEST, stmt.DIGEST_TEXT, stmt.CURRENT_SCHEMA, w.EVENT_NAME
            ORDER BY total_wait_time_ms DESC
            LIMIT ?
        "#
    )
}

/// Blocked/blocking transaction pairs, oldest blockage first.
///
/// Params: excluded schemas..., limit.
pub(super) fn build_blocking_sessions_query(dialect: &Dialect, excluded: usize) -> String {
    let excluded = placeholders(excluded);
    let (waits_table, requesting_col, blocking_col) = match dialect.lock_wait_source() {
        LockWaitSource::DataLockWaits => (
            "performance_schema.data_lock_waits",
            "REQUESTING_ENGINE_TRANSACTION_ID",
            "BLOCKING_ENGINE_TRANSACTION_ID",
        ),
        LockWaitSource::InnodbLockWaits => (
            "information_schema.innodb_lock_waits",
            "requesting_trx_id",
            "blocking_trx_id",
        ),
    };

    format!(
        r#"
            SELECT
                CAST(r.trx_id AS CHAR) AS blocked_txn_id,
                r.trx_mysql_thread_id AS blocked_pid,
                rt.THREAD_ID AS blocked_thread_id,
                rs.DIGEST AS blocked_query_id,
                rs.DIGEST_TEXT AS blocked_query,
                rt.PROCESSLIST_HOST AS blocked_host,
                DATE_FORMAT(CONVERT_TZ(r.trx_started, @@session.time_zone, '+00:00'), '%Y-%m-%dT%H:%i:%sZ') AS blocked_txn_start_time,
                r.trx_state AS blocked_status,
                rt.PROCESSLIST_DB AS database_name,
                CAST(b.trx_id AS CHAR) AS blocking_txn_id,
                b.trx_mysql_thread_id AS blocking_pid,
                bt.THREAD_ID AS blocking_thread_id,
                bs.DIGEST AS blocking_query_id,
                bs.DIGEST_TEXT AS blocking_query,
                bt.PROCESSLIST_HOST AS blocking_host,
                DATE_FORMAT(CONVERT_TZ(b.trx_started, @@session.time_zone, '+00:00'), '%Y-%m-%dT%H:%i:%sZ') AS blocking_txn_start_time,
                b.trx_state AS blocking_status,
                DATE_FORMAT(UTC_TIMESTAMP(), '%Y-%m-%dT%H:%i:%sZ') AS collection_timestamp
            FROM {waits_table} AS w
            JOIN information_schema.innodb_trx AS r ON r.trx_id = w.{requesting_col}
            JOIN information_schema.innodb_trx AS b ON b.trx_id = w.{blocking_col}
            JOIN performance_schema.threads AS rt ON rt.PROCESSLIST_ID = r.trx_mysql_thread_id
            JOIN performance_schema.threads AS bt ON bt.PROCESSLIST_ID = b.trx_mysql_thread_id
            LEFT JOIN performance_schema.events_statements_current AS rs ON rs.THREAD_ID = rt.THREAD_ID
            LEFT JOIN performance_schema.events_statements_current AS bs ON bs.THREAD_ID = bt.THREAD_ID
            WHERE rt.PROCESSLIST_DB IS NOT NULL
                AND rt.PROCESSLIST_DB NOT IN ({excluded})
            ORDER BY r.trx_started ASC
            LIMIT ?
        "#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ServerVersion;

    fn count_placeholders(sql: &str) -> usize {
        sql.matches('?').count()
    }

    #[test]
    fn placeholders_never_empty() {
        assert_eq!(placeholders(0), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn slow_query_cpu_column_depends_on_version() {
        let v80 = Dialect::for_version(ServerVersion::new(8, 0, 36));
        let v84 = Dialect::for_version(ServerVersion::new(8, 4, 2));

        let old = build_slow_queries_query(&v80, 5);
        let new = build_slow_queries_query(&v84, 5);
        assert!(old.contains("NULL AS avg_cpu_time_ms"));
        assert!(!old.contains("SUM_CPU_TIME"));
        assert!(new.contains("SUM_CPU_TIME"));

        // window + 5 excluded + limit
        assert_eq!(count_placeholders(&old), 7);
        assert!(old.contains("ORDER BY avg_elapsed_time_ms DESC"));
    }

    #[test]
    fn individual_queries_target_each_table() {
        for source in StatementSource::ALL {
            let sql = build_individual_queries_query(source);
            assert!(sql.contains(&format!("performance_schema.{}\n", source.table())));
            assert_eq!(count_placeholders(&sql), 3);
            assert!(sql.contains("ORDER BY TIMER_WAIT DESC"));
        }
    }

    #[test]
    fn blocking_query_uses_version_lock_table() {
        let v8 = Dialect::for_version(ServerVersion::new(8, 0, 0));
        let v57 = Dialect::for_version(ServerVersion::new(5, 7, 0));

        let sql = build_blocking_sessions_query(&v8, 2);
        assert!(sql.contains("performance_schema.data_lock_waits"));
        assert!(sql.contains("ORDER BY r.trx_started ASC"));
        assert_eq!(count_placeholders(&sql), 3);

        let legacy = build_blocking_sessions_query(&v57, 2);
        assert!(legacy.contains("information_schema.innodb_lock_waits"));
        assert!(legacy.contains("w.blocking_trx_id"));
    }

    #[test]
    fn wait_events_query_params() {
        let sql = build_wait_events_query(4);
        assert_eq!(count_placeholders(&sql), 5);
        assert!(sql.contains("events_waits_history"));
    }
}
