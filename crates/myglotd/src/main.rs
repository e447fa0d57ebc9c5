//! myglotd - MySQL query performance collector daemon.
//!
//! Reads `performance_schema` on a fixed interval and writes telemetry
//! batches to stdout, one JSON document per line. Logs go to stderr.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use myglot_core::config::{
    ConnectionSettings, DEFAULT_PUBLISH_CHUNK_SIZE, DEFAULT_QUERY_COUNT_THRESHOLD,
    DEFAULT_RESPONSE_TIME_THRESHOLD_MS, DEFAULT_SLOW_QUERY_FETCH_INTERVAL, ExcludedDatabases,
    QueryMonitoringConfig, parse_custom_queries,
};
use myglot_core::publish::JsonLinesSink;
use myglot_core::source::MySqlConnector;
use myglot_core::{Pipeline, PipelineError};

/// MySQL query performance collector daemon.
#[derive(Parser)]
#[command(name = "myglotd", about = "MySQL query performance collector daemon", version)]
struct Args {
    /// MySQL server host.
    #[arg(long, env = "MYSQL_HOST", default_value = "localhost")]
    host: String,

    /// MySQL server port.
    #[arg(long, env = "MYSQL_PORT", default_value = "3306")]
    port: u16,

    /// MySQL user.
    #[arg(short, long, env = "MYSQL_USER", default_value = "root")]
    username: String,

    /// MySQL password.
    #[arg(long, env = "MYSQL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Default database of the main connection.
    #[arg(long, env = "MYSQL_DATABASE")]
    database: Option<String>,

    /// Enable query performance monitoring. When disabled only connectivity is checked.
    #[arg(long, env = "ENABLE_QUERY_MONITORING", default_value_t = false, action = clap::ArgAction::Set)]
    enable_query_monitoring: bool,

    /// Window in seconds a digest must have been seen in; also the collection interval.
    #[arg(long, env = "SLOW_QUERY_FETCH_INTERVAL", default_value_t = DEFAULT_SLOW_QUERY_FETCH_INTERVAL)]
    slow_query_fetch_interval: u64,

    /// Minimum execution time in milliseconds of reported individual executions.
    #[arg(long, env = "QUERY_RESPONSE_TIME_THRESHOLD", default_value_t = DEFAULT_RESPONSE_TIME_THRESHOLD_MS)]
    query_response_time_threshold: u64,

    /// Maximum rows per collector.
    #[arg(long, env = "QUERY_COUNT_THRESHOLD", default_value_t = DEFAULT_QUERY_COUNT_THRESHOLD)]
    query_count_threshold: u64,

    /// JSON array of additional databases to exclude, e.g. '["audit","tmp"]'.
    #[arg(long, env = "EXCLUDED_DATABASES", default_value = "[]")]
    excluded_databases: String,

    /// JSON array of custom queries: [{"query": "...", "event_type": "...", "database": "..."}].
    #[arg(long, env = "CUSTOM_QUERIES", default_value = "")]
    custom_queries: String,

    /// Timeout in seconds for collector queries.
    #[arg(long, default_value = "10")]
    query_timeout: u64,

    /// Timeout in seconds for each EXPLAIN.
    #[arg(long, default_value = "30")]
    plan_timeout: u64,

    /// Maximum events per published batch.
    #[arg(long, default_value_t = DEFAULT_PUBLISH_CHUNK_SIZE)]
    publish_chunk_size: usize,

    /// Run a single collection cycle and exit.
    #[arg(long)]
    once: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber on stderr; stdout carries telemetry.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["myglotd", "myglot_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn build_config(args: &Args) -> Result<QueryMonitoringConfig, String> {
    let excluded = ExcludedDatabases::from_json(&args.excluded_databases).map_err(|e| e.to_string())?;
    let custom = parse_custom_queries(&args.custom_queries).map_err(|e| e.to_string())?;

    Ok(QueryMonitoringConfig::new()
        .with_enabled(args.enable_query_monitoring)
        .with_slow_query_fetch_interval(args.slow_query_fetch_interval)
        .with_response_time_threshold_ms(args.query_response_time_threshold)
        .with_query_count_threshold(args.query_count_threshold)
        .with_excluded_databases(excluded)
        .with_timeouts(
            Duration::from_secs(args.query_timeout.max(1)),
            Duration::from_secs(args.plan_timeout.max(1)),
        )
        .with_publish_chunk_size(args.publish_chunk_size)
        .with_custom_queries(custom))
}

fn connection_settings(args: &Args) -> ConnectionSettings {
    ConnectionSettings {
        host: args.host.clone(),
        port: args.port,
        username: args.username.clone(),
        password: args.password.clone(),
        database: args.database.clone(),
        ..ConnectionSettings::default()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("myglotd {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: server={}:{}, monitoring={}, interval={}s, response_threshold={}ms, count_threshold={}",
        args.host,
        args.port,
        config.enabled,
        config.slow_query_fetch_interval(),
        config.response_time_threshold_ms(),
        config.query_count_threshold()
    );
    debug!(
        excluded = ?config.excluded_databases.iter().collect::<Vec<_>>(),
        custom_queries = config.custom_queries.len(),
        "Collection scope"
    );

    let interval = Duration::from_secs(config.slow_query_fetch_interval());
    let entity_name = format!("mysql:{}:{}", args.host, args.port);
    let connector = MySqlConnector::new(&connection_settings(&args));
    let pipeline = Pipeline::new(connector, config, entity_name);
    let mut sink = JsonLinesSink::new(io::stdout().lock());

    let mut cycle: u64 = 0;
    loop {
        cycle += 1;
        match pipeline.run(&mut sink).await {
            Ok(summary) => {
                debug!(cycle, elapsed_ms = summary.timings.total.as_millis() as u64, "Cycle finished");
                if summary.publish_failures > 0 {
                    warn!("{} publish calls failed in cycle {}", summary.publish_failures, cycle);
                }
            }
            Err(e) => {
                error!("{}", e);
                print_remediation(&e);
                return ExitCode::FAILURE;
            }
        }

        if args.once {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    info!("Shutting down...");
    ExitCode::SUCCESS
}

fn print_remediation(e: &PipelineError) {
    eprintln!();
    match e {
        PipelineError::Connect(_) => {
            eprintln!("  Check MYSQL_HOST, MYSQL_PORT, MYSQL_USER and MYSQL_PASSWORD.");
        }
        PipelineError::Precondition(_) => {
            eprintln!("  The monitoring user needs SELECT on performance_schema and PROCESS.");
        }
    }
    eprintln!();
}
