//! One collection cycle from connection to published batches.
//!
//! ```text
//!   connect ─► preconditions ─► slow queries ─► individual queries ─► plans
//!                            ├─► wait events
//!                            ├─► blocking sessions
//!                            └─► custom queries (concurrent)
//! ```
//!
//! Only a failed connection or a terminal precondition aborts the run.
//! Any other stage failure empties that stage and skips its dependents.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::collector::{
    PreconditionError, QueryCollector, SlowQueryBatch, extract_plans, run_custom_queries,
    validate_preconditions,
};
use crate::config::QueryMonitoringConfig;
use crate::model::{
    BLOCKING_SESSION_EVENT_TYPE, CustomQueryRecord, INDIVIDUAL_QUERY_EVENT_TYPE, MetricRecord,
    QUERY_PLAN_EVENT_TYPE, QueryGroup, SLOW_QUERY_EVENT_TYPE, WAIT_EVENT_EVENT_TYPE,
};
use crate::publish::{BatchPublisher, PublishSummary, TelemetrySink};
use crate::source::{Connector, DbError, SqlSource};
use crate::version::ServerVersion;

/// Fatal-to-run failure. Nothing was published.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    Connect(DbError),
    Precondition(PreconditionError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Connect(e) => write!(f, "cannot connect to MySQL: {}", e),
            PipelineError::Precondition(e) => write!(f, "precondition failed: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Connect(e) => Some(e),
            PipelineError::Precondition(e) => Some(e),
        }
    }
}

/// Wall time spent per stage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTimings {
    pub preconditions: Duration,
    pub slow_queries: Duration,
    pub individual_queries: Duration,
    pub plans: Duration,
    pub wait_events: Duration,
    pub blocking_sessions: Duration,
    pub custom_queries: Duration,
    pub publish: Duration,
    pub total: Duration,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// False when query monitoring is disabled and only connectivity was checked.
    pub monitoring_enabled: bool,
    pub version: Option<ServerVersion>,
    pub slow_queries: usize,
    pub individual_queries: usize,
    pub plan_steps: usize,
    pub wait_events: usize,
    pub blocking_sessions: usize,
    pub custom_records: usize,
    pub published: PublishSummary,
    /// Publish calls that failed part way.
    pub publish_failures: usize,
    /// Stages that failed and produced nothing.
    pub failed_stages: Vec<&'static str>,
    pub timings: StageTimings,
}

/// Runs collection cycles against servers reached through `C`.
pub struct Pipeline<C: Connector> {
    connector: Arc<C>,
    config: QueryMonitoringConfig,
    publisher: BatchPublisher,
}

impl<C: Connector + 'static> Pipeline<C> {
    /// `entity_name` labels every entity the publisher creates.
    pub fn new(connector: C, config: QueryMonitoringConfig, entity_name: impl Into<String>) -> Self {
        let publisher = BatchPublisher::new(config.publish_chunk_size, entity_name);
        Self {
            connector: Arc::new(connector),
            config,
            publisher,
        }
    }

    pub fn config(&self) -> &QueryMonitoringConfig {
        &self.config
    }

    /// Runs one cycle, publishing into `sink`.
    ///
    /// The main connection is closed on every path once it was opened.
    pub async fn run<K: TelemetrySink + ?Sized>(&self, sink: &mut K) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let conn = Arc::new(
            self.connector
                .connect(None)
                .await
                .map_err(PipelineError::Connect)?,
        );

        let result = if self.config.enabled {
            self.run_stages(&conn, sink).await
        } else {
            info!("query monitoring disabled, connectivity verified");
            Ok(RunSummary::default())
        };
        conn.close().await;

        let mut summary = result?;
        summary.timings.total = started.elapsed();
        if summary.monitoring_enabled {
            info!(
                slow_queries = summary.slow_queries,
                individual_queries = summary.individual_queries,
                plan_steps = summary.plan_steps,
                wait_events = summary.wait_events,
                blocking_sessions = summary.blocking_sessions,
                custom_records = summary.custom_records,
                published = summary.published.published,
                skipped = summary.published.skipped,
                chunks = summary.published.chunks,
                failed_stages = ?summary.failed_stages,
                elapsed_ms = summary.timings.total.as_millis() as u64,
                "collection cycle complete"
            );
        }
        Ok(summary)
    }

    async fn run_stages<K: TelemetrySink + ?Sized>(
        &self,
        conn: &Arc<C::Source>,
        sink: &mut K,
    ) -> Result<RunSummary, PipelineError> {
        let cfg = &self.config;
        let mut summary = RunSummary {
            monitoring_enabled: true,
            ..Default::default()
        };

        let t = Instant::now();
        let report = validate_preconditions(conn.as_ref(), cfg.query_timeout)
            .await
            .map_err(PipelineError::Precondition)?;
        summary.version = Some(report.version);
        summary.timings.preconditions = t.elapsed();

        let collector = QueryCollector::new(conn.as_ref(), cfg, report.dialect);

        // Slow queries, then everything keyed by their digests.
        let t = Instant::now();
        let slow = match collector.collect_slow_queries().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "slow query collection failed");
                summary.failed_stages.push("slow_queries");
                SlowQueryBatch::default()
            }
        };
        summary.slow_queries = slow.records.len();
        summary.timings.slow_queries = t.elapsed();
        self.publish_stage(sink, SLOW_QUERY_EVENT_TYPE, &slow.records, &mut summary);

        if slow.digests.is_empty() {
            debug!("no slow digests, individual queries and plans skipped");
        } else {
            let t = Instant::now();
            let individual = collector.collect_individual_queries(&slow.digests).await;
            summary.individual_queries = individual.len();
            summary.timings.individual_queries = t.elapsed();

            let t = Instant::now();
            let groups = QueryGroup::group(&individual);
            let steps = extract_plans(self.connector.as_ref(), &groups, cfg.plan_timeout).await;
            summary.plan_steps = steps.len();
            summary.timings.plans = t.elapsed();

            self.publish_stage(sink, INDIVIDUAL_QUERY_EVENT_TYPE, &individual, &mut summary);
            self.publish_stage(sink, QUERY_PLAN_EVENT_TYPE, &steps, &mut summary);
        }

        let t = Instant::now();
        let waits = collector.collect_wait_events().await.unwrap_or_else(|e| {
            warn!(error = %e, "wait event collection failed");
            summary.failed_stages.push("wait_events");
            Vec::new()
        });
        summary.wait_events = waits.len();
        summary.timings.wait_events = t.elapsed();
        self.publish_stage(sink, WAIT_EVENT_EVENT_TYPE, &waits, &mut summary);

        let t = Instant::now();
        let blocking = collector.collect_blocking_sessions().await.unwrap_or_else(|e| {
            warn!(error = %e, "blocking session collection failed");
            summary.failed_stages.push("blocking_sessions");
            Vec::new()
        });
        summary.blocking_sessions = blocking.len();
        summary.timings.blocking_sessions = t.elapsed();
        self.publish_stage(sink, BLOCKING_SESSION_EVENT_TYPE, &blocking, &mut summary);

        if !cfg.custom_queries.is_empty() {
            let t = Instant::now();
            let custom = run_custom_queries(
                Arc::clone(&self.connector),
                Arc::clone(conn),
                &cfg.custom_queries,
                cfg.query_timeout,
            )
            .await;
            summary.custom_records = custom.len();
            summary.timings.custom_queries = t.elapsed();

            let mut by_type: BTreeMap<String, Vec<CustomQueryRecord>> = BTreeMap::new();
            for record in custom {
                by_type.entry(record.event_type.clone()).or_default().push(record);
            }
            for (event_type, records) in &by_type {
                self.publish_stage(sink, event_type, records, &mut summary);
            }
        }

        Ok(summary)
    }

    /// Publishes one record kind; a failure is logged and counted.
    fn publish_stage<R: MetricRecord, K: TelemetrySink + ?Sized>(
        &self,
        sink: &mut K,
        event_type: &str,
        records: &[R],
        summary: &mut RunSummary,
    ) {
        if records.is_empty() {
            return;
        }
        let t = Instant::now();
        match self.publisher.publish(sink, event_type, records) {
            Ok(published) => summary.published.merge(published),
            Err(e) => {
                warn!(error = %e, "publish failed, remaining chunks dropped");
                summary.publish_failures += 1;
            }
        }
        summary.timings.publish += t.elapsed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CustomQuery, ExcludedDatabases};
    use crate::publish::MemorySink;
    use crate::source::{MockConnector, MockSource, SqlRow};

    const NOW: &str = "2026-10-18T12:00:30Z";

    fn config() -> QueryMonitoringConfig {
        QueryMonitoringConfig::new()
            .with_enabled(true)
            .with_excluded_databases(ExcludedDatabases::from_json(r#"["mysql","sys"]"#).unwrap())
            .with_slow_query_fetch_interval(30)
            .with_query_count_threshold(20)
    }

    fn digest_row(digest: &str) -> SqlRow {
        SqlRow::new()
            .with("query_id", digest)
            .with("query_text", "SELECT * FROM `orders` WHERE `id` = ?")
            .with("database_name", "shop")
            .with("execution_count", 3u64)
            .with("avg_elapsed_time_ms", 900.0)
            .with("has_full_table_scan", "No")
            .with("last_execution_timestamp", "2026-10-18T12:00:20Z")
            .with("collection_timestamp", NOW)
    }

    fn execution_row(digest: &str, event_id: u64) -> SqlRow {
        SqlRow::new()
            .with("query_id", digest)
            .with("query_text", "SELECT * FROM `orders` WHERE `id` = ?")
            .with("query_sample_text", format!("SELECT * FROM orders WHERE id = {event_id}"))
            .with("event_id", event_id)
            .with("thread_id", 50u64)
            .with("execution_time_ms", 900.0)
            .with("database_name", "shop")
    }

    fn plan_row() -> SqlRow {
        let plan = serde_json::json!({
            "query_block": {
                "cost_info": { "query_cost": "1.00" },
                "table": { "table_name": "orders", "access_type": "const" }
            }
        });
        SqlRow::new().with("EXPLAIN", plan.to_string())
    }

    fn healthy_server() -> MockSource {
        MockSource::new()
            .on("EXPLAIN FORMAT=JSON", vec![plan_row()])
            .on("VERSION()", vec![SqlRow::new().with("version", "8.0.36")])
            .on("global_variables", vec![SqlRow::new().with("value", "ON")])
            .on(
                "FROM performance_schema.setup_consumers",
                crate::collector::REQUIRED_CONSUMERS
                    .iter()
                    .map(|c| SqlRow::new().with("name", *c).with("enabled", "YES"))
                    .collect(),
            )
            .on(
                "FROM performance_schema.setup_instruments",
                vec![SqlRow::new().with("total", 10u64).with("ready", 10u64)],
            )
    }

    #[tokio::test]
    async fn end_to_end_three_digests() {
        let source = healthy_server()
            .on(
                "events_statements_summary_by_digest",
                vec![digest_row("d1"), digest_row("d2"), digest_row("d3")],
            )
            .on("events_waits_current", Vec::new())
            .on("innodb_trx", Vec::new())
            // Finished executions show up in both history tables.
            .on_param("events_statements_history_long", "d1", vec![execution_row("d1", 1)])
            .on_param("events_statements_current", "d1", vec![execution_row("d1", 1)])
            .on_param("events_statements_current", "d2", vec![execution_row("d2", 2)])
            .on_param("events_statements_current", "d3", vec![execution_row("d3", 3)]);
        let connector = MockConnector::new(source.clone());
        let pipeline = Pipeline::new(connector, config(), "mysql:localhost:3306");
        let mut sink = MemorySink::new();

        let summary = pipeline.run(&mut sink).await.unwrap();

        assert_eq!(summary.version, Some(ServerVersion::new(8, 0, 36)));
        assert_eq!(summary.slow_queries, 3);
        assert_eq!(source.calls_matching("WHERE DIGEST = ?").len(), 9);
        assert_eq!(summary.individual_queries, 4);
        assert_eq!(summary.plan_steps, 3);
        assert_eq!(source.calls_matching("EXPLAIN FORMAT=JSON").len(), 3);
        assert!(summary.failed_stages.is_empty());

        let digest_call = &source.calls_matching("events_statements_summary_by_digest")[0];
        assert!(digest_call.params.contains(&crate::source::SqlParam::from("mysql")));
        assert!(digest_call.params.contains(&crate::source::SqlParam::from("sys")));

        assert_eq!(sink.events_of(SLOW_QUERY_EVENT_TYPE), 3);
        assert_eq!(sink.events_of(INDIVIDUAL_QUERY_EVENT_TYPE), 4);
        assert_eq!(sink.events_of(QUERY_PLAN_EVENT_TYPE), 3);
        assert_eq!(summary.published.published, 10);

        // Main connection plus one plan connection for "shop".
        assert_eq!(source.closed_count(), 2);
    }

    #[tokio::test]
    async fn sample_text_never_published() {
        let source = healthy_server()
            .on("events_statements_summary_by_digest", vec![digest_row("d1")])
            .on("events_waits_current", Vec::new())
            .on("innodb_trx", Vec::new())
            .on("events_statements_current", vec![execution_row("d1", 1)]);
        let pipeline = Pipeline::new(MockConnector::new(source), config(), "e");
        let mut sink = MemorySink::new();

        pipeline.run(&mut sink).await.unwrap();

        for batch in sink.batches() {
            for event in &batch.events {
                assert!(event.attributes.get("query_sample_text").is_none());
            }
        }
    }

    #[tokio::test]
    async fn refused_connection_is_fatal() {
        let connector = MockConnector::new(MockSource::new()).refuse(None);
        let pipeline = Pipeline::new(connector, config(), "e");
        let mut sink = MemorySink::new();

        let err = pipeline.run(&mut sink).await.unwrap_err();

        assert!(matches!(err, PipelineError::Connect(DbError::Connect(_))));
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn unsupported_version_aborts_and_closes_connection() {
        let source = MockSource::new().on("VERSION()", vec![SqlRow::new().with("version", "5.7.31")]);
        let pipeline = Pipeline::new(MockConnector::new(source.clone()), config(), "e");
        let mut sink = MemorySink::new();

        let err = pipeline.run(&mut sink).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Precondition(PreconditionError::UnsupportedVersion(_))
        ));
        assert!(sink.batches().is_empty());
        assert_eq!(source.closed_count(), 1);
    }

    #[tokio::test]
    async fn slow_query_failure_skips_dependents_only() {
        let wait = SqlRow::new()
            .with("query_id", "d7")
            .with("database_name", "shop")
            .with("wait_event_name", "wait/io/table/sql/handler")
            .with("total_wait_time_ms", 12.0);
        let source = healthy_server()
            .fail_on(
                "events_statements_summary_by_digest",
                DbError::Timeout(Duration::from_secs(10)),
            )
            .on("events_waits_current", vec![wait]);
        let pipeline = Pipeline::new(MockConnector::new(source.clone()), config(), "e");
        let mut sink = MemorySink::new();

        let summary = pipeline.run(&mut sink).await.unwrap();

        assert_eq!(summary.failed_stages, vec!["slow_queries"]);
        assert!(source.calls_matching("WHERE DIGEST = ?").is_empty());
        assert_eq!(summary.wait_events, 1);
        assert_eq!(sink.events_of(WAIT_EVENT_EVENT_TYPE), 1);
    }

    #[tokio::test]
    async fn publish_failure_does_not_abort_run() {
        let wait = SqlRow::new()
            .with("query_id", "d7")
            .with("wait_event_name", "wait/io/table/sql/handler");
        let source = healthy_server()
            .on("events_statements_summary_by_digest", vec![digest_row("d1")])
            .on("events_waits_current", vec![wait]);
        let pipeline = Pipeline::new(MockConnector::new(source), config(), "e");
        let mut sink = MemorySink::new().fail_after(1);

        let summary = pipeline.run(&mut sink).await.unwrap();

        assert_eq!(sink.batches().len(), 1);
        assert_eq!(summary.publish_failures, 1);
        assert_eq!(summary.wait_events, 1);
    }

    #[tokio::test]
    async fn custom_queries_published_per_event_type() {
        let source = healthy_server()
            .on("events_waits_current", Vec::new())
            .on("FROM app_jobs", vec![SqlRow::new().with("pending", 4i64)]);
        let cfg = config().with_custom_queries(vec![CustomQuery {
            query: "SELECT COUNT(*) AS pending FROM app_jobs".to_string(),
            event_type: Some("AppJobsSample".to_string()),
            database: None,
        }]);
        let pipeline = Pipeline::new(MockConnector::new(source), cfg, "e");
        let mut sink = MemorySink::new();

        let summary = pipeline.run(&mut sink).await.unwrap();

        assert_eq!(summary.custom_records, 1);
        assert_eq!(sink.events_of("AppJobsSample"), 1);
    }

    #[tokio::test]
    async fn disabled_monitoring_only_connects() {
        let source = MockSource::new();
        let cfg = config().with_enabled(false);
        let pipeline = Pipeline::new(MockConnector::new(source.clone()), cfg, "e");
        let mut sink = MemorySink::new();

        let summary = pipeline.run(&mut sink).await.unwrap();

        assert!(!summary.monitoring_enabled);
        assert!(source.calls().is_empty());
        assert_eq!(source.closed_count(), 1);
    }
}
