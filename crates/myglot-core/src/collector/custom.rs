//! User-defined queries, run concurrently.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::CustomQuery;
use crate::model::CustomQueryRecord;
use crate::source::{Connector, DbError, SqlSource, fetch_with_timeout};

/// Runs every query in its own task and waits for all of them.
///
/// Queries naming a database get their own scoped connection; the rest share
/// `main`. A failed, timed-out or panicked task is logged and contributes no
/// rows. Records come back in configuration order.
pub async fn run_custom_queries<C>(
    connector: Arc<C>,
    main: Arc<C::Source>,
    queries: &[CustomQuery],
    timeout: Duration,
) -> Vec<CustomQueryRecord>
where
    C: Connector + 'static,
{
    if queries.is_empty() {
        return Vec::new();
    }

    let mut tasks = JoinSet::new();
    for (idx, query) in queries.iter().cloned().enumerate() {
        let connector = Arc::clone(&connector);
        let main = Arc::clone(&main);
        tasks.spawn(async move {
            let result = run_one(connector.as_ref(), main.as_ref(), &query, timeout).await;
            (idx, query, result)
        });
    }

    let mut results: Vec<(usize, Vec<CustomQueryRecord>)> = Vec::with_capacity(queries.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, _, Ok(records))) => results.push((idx, records)),
            Ok((_, query, Err(e))) => {
                warn!(
                    query = %query.query,
                    database = ?query.database,
                    error = %e,
                    "custom query failed"
                );
            }
            Err(e) => warn!(error = %e, "custom query task aborted"),
        }
    }

    results.sort_by_key(|(idx, _)| *idx);
    let records: Vec<CustomQueryRecord> = results.into_iter().flat_map(|(_, r)| r).collect();
    debug!(queries = queries.len(), records = records.len(), "custom queries collected");
    records
}

async fn run_one<C: Connector>(
    connector: &C,
    main: &C::Source,
    query: &CustomQuery,
    timeout: Duration,
) -> Result<Vec<CustomQueryRecord>, DbError> {
    let rows = match query.database.as_deref() {
        Some(database) => {
            let conn = connector.connect(Some(database)).await?;
            let rows = fetch_with_timeout(&conn, timeout, &query.query, &[]).await;
            conn.close().await;
            rows?
        }
        None => fetch_with_timeout(main, timeout, &query.query, &[]).await?,
    };

    let event_type = query.event_type();
    Ok(rows
        .iter()
        .map(|row| CustomQueryRecord::from_row(event_type, row))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricValue;
    use crate::source::{MockConnector, MockSource, SqlRow};

    fn query(sql: &str, event_type: Option<&str>, database: Option<&str>) -> CustomQuery {
        CustomQuery {
            query: sql.to_string(),
            event_type: event_type.map(str::to_string),
            database: database.map(str::to_string),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn results_merge_in_config_order_after_barrier() {
        let source = MockSource::new()
            .delay_on(
                "FROM slow_table",
                Duration::from_secs(2),
                vec![SqlRow::new().with("n", 1i64)],
            )
            .on("FROM fast_table", vec![SqlRow::new().with("n", 2i64)]);
        let connector = Arc::new(MockConnector::new(source.clone()));
        let main = Arc::new(source.clone());
        let queries = vec![
            query("SELECT COUNT(*) AS n FROM slow_table", Some("SlowSample"), None),
            query("SELECT COUNT(*) AS n FROM fast_table", None, None),
        ];

        let records = run_custom_queries(connector, main, &queries, Duration::from_secs(10)).await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_type, "SlowSample");
        assert_eq!(records[1].event_type, "MysqlCustomQuerySample");
        assert_eq!(records[1].values, vec![("n".to_string(), MetricValue::Gauge(2.0))]);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_isolated_per_task() {
        let source = MockSource::new()
            .fail_on("FROM broken", DbError::Query("1146: table doesn't exist".to_string()))
            .delay_on("FROM stuck", Duration::from_secs(60), Vec::new())
            .on("FROM ok_table", vec![SqlRow::new().with("status", "ok")]);
        let connector = Arc::new(MockConnector::new(source.clone()));
        let main = Arc::new(source.clone());
        let queries = vec![
            query("SELECT 1 FROM broken", None, None),
            query("SELECT 1 FROM stuck", None, None),
            query("SELECT status FROM ok_table", None, None),
        ];

        let records = run_custom_queries(connector, main, &queries, Duration::from_secs(5)).await;

        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].values,
            vec![("status".to_string(), MetricValue::Attribute("ok".to_string()))]
        );
    }

    #[tokio::test]
    async fn scoped_query_opens_and_closes_own_connection() {
        let source = MockSource::new().on("FROM orders", vec![SqlRow::new().with("n", 5u64)]);
        let connector = Arc::new(MockConnector::new(source.clone()));
        let main = Arc::new(source.clone());
        let queries = vec![query("SELECT COUNT(*) AS n FROM orders", None, Some("shop"))];

        let records =
            run_custom_queries(Arc::clone(&connector), main, &queries, Duration::from_secs(5)).await;

        assert_eq!(records.len(), 1);
        assert_eq!(connector.connects(), vec![Some("shop".to_string())]);
        assert_eq!(source.closed_count(), 1);
        assert_eq!(source.calls()[0].database.as_deref(), Some("shop"));
    }
}
