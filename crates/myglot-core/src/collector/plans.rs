//! Execution plans for individual executions via `EXPLAIN FORMAT=JSON`.
//!
//! The plan document is walked without a fixed schema: every object or array
//! is visited depth-first, and any object naming a table, an access type or a
//! nonzero row estimate becomes one [`PlanStep`].

use std::collections::HashSet;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::model::{IndividualQueryRecord, PlanStep, QueryGroup};
use crate::source::{Connector, DbError, SqlSource, fetch_with_timeout};

/// Leading keywords of statements the server can explain without side effects.
const EXPLAINABLE_KEYWORDS: [&str; 5] = ["SELECT", "INSERT", "UPDATE", "DELETE", "WITH"];

/// Returns true if `text` is a literal statement that can be explained.
///
/// Rejects blank text, statements outside the keyword allow-list and
/// text with unresolved `?` placeholders.
pub fn is_explainable(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    let upper = trimmed.to_ascii_uppercase();
    let allowed = EXPLAINABLE_KEYWORDS.iter().any(|kw| {
        upper.starts_with(kw)
            && upper[kw.len()..]
                .chars()
                .next()
                .is_none_or(|c| !c.is_ascii_alphanumeric() && c != '_')
    });
    allowed && !trimmed.contains('?')
}

/// Accumulator threaded through one plan walk.
///
/// `next_step_id` starts at 1 and is never reset within a walk; `query_cost`
/// holds the most recent `cost_info.query_cost` seen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanWalk {
    pub next_step_id: u32,
    pub query_cost: Option<f64>,
}

impl Default for PlanWalk {
    fn default() -> Self {
        Self {
            next_step_id: 1,
            query_cost: None,
        }
    }
}

/// Flattens one plan document into ordered steps tagged with the execution ids.
pub fn flatten_plan(plan: &Value, event_id: u64, thread_id: u64) -> Vec<PlanStep> {
    let mut walk = PlanWalk::default();
    let mut steps = Vec::new();
    visit(plan, (event_id, thread_id), &mut walk, &mut steps);
    steps
}

fn visit(node: &Value, ids: (u64, u64), walk: &mut PlanWalk, out: &mut Vec<PlanStep>) {
    match node {
        Value::Array(items) => {
            for item in items {
                visit(item, ids, walk, out);
            }
        }
        Value::Object(map) => {
            if let Some(cost) = map
                .get("cost_info")
                .and_then(|c| c.get("query_cost"))
                .and_then(as_number)
            {
                walk.query_cost = Some(cost);
            }

            if is_step(map) {
                out.push(build_step(map, ids, walk));
                walk.next_step_id += 1;
            }

            for (key, child) in map {
                if key == "cost_info" {
                    continue;
                }
                if child.is_object() || child.is_array() {
                    visit(child, ids, walk, out);
                }
            }
        }
        _ => {}
    }
}

fn is_step(map: &Map<String, Value>) -> bool {
    map.contains_key("table_name")
        || map.contains_key("access_type")
        || ["rows_examined_per_scan", "rows_produced_per_join"]
            .iter()
            .any(|k| map.get(*k).and_then(as_count).is_some_and(|n| n > 0))
}

fn build_step(map: &Map<String, Value>, (event_id, thread_id): (u64, u64), walk: &PlanWalk) -> PlanStep {
    let cost = map.get("cost_info");
    let cost_field = |name: &str| cost.and_then(|c| c.get(name)).and_then(as_number);

    PlanStep {
        event_id,
        thread_id,
        query_cost: walk.query_cost,
        step_id: walk.next_step_id,
        table_name: map.get("table_name").and_then(as_text),
        access_type: map.get("access_type").and_then(as_text),
        rows_examined_per_scan: map.get("rows_examined_per_scan").and_then(as_count),
        rows_produced_per_join: map.get("rows_produced_per_join").and_then(as_count),
        filtered: map.get("filtered").and_then(as_number),
        read_cost: cost_field("read_cost"),
        eval_cost: cost_field("eval_cost"),
        prefix_cost: cost_field("prefix_cost"),
        data_read_per_join: cost.and_then(|c| c.get("data_read_per_join")).and_then(as_text),
        possible_keys: map.get("possible_keys").and_then(as_text),
        key: map.get("key").and_then(as_text),
        used_key_parts: map.get("used_key_parts").and_then(as_text),
        ref_columns: map.get("ref").and_then(as_text),
        using_index: map.get("using_index").is_some_and(as_flag),
        insert: map.get("insert").is_some_and(as_flag),
        update: map.get("update").is_some_and(as_flag),
        delete: map.get("delete").is_some_and(as_flag),
    }
}

/// Numbers arrive both as JSON numbers and as quoted strings (`"1.20"`).
fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_count(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.max(0.0) as u64))
        }
        _ => None,
    }
}

/// Strings as-is, string arrays comma-joined, numbers rendered.
fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(as_text).collect();
            (!parts.is_empty()).then(|| parts.join(","))
        }
        _ => None,
    }
}

fn as_flag(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Requests and flattens a plan for every explainable execution.
///
/// Opens one connection per group, scoped to the group's database, and
/// closes it after the group whatever happened. Records that cannot be
/// explained are skipped with a warning. Each `(event_id, thread_id)` pair
/// and each statement text within a database is explained at most once.
pub async fn extract_plans<C: Connector + ?Sized>(
    connector: &C,
    groups: &[QueryGroup],
    plan_timeout: Duration,
) -> Vec<PlanStep> {
    let mut steps = Vec::new();
    let mut seen_executions: HashSet<(u64, u64)> = HashSet::new();
    let mut seen_texts: HashSet<(&str, &str)> = HashSet::new();

    for group in groups {
        let conn = match connector.connect(Some(&group.database)).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(database = %group.database, error = %e, "plan connection failed, group skipped");
                continue;
            }
        };

        for record in &group.queries {
            if let (Some(event_id), Some(thread_id)) = (record.event_id, record.thread_id) {
                if !seen_executions.insert((event_id, thread_id)) {
                    debug!(event_id, thread_id, "execution already explained, skipped");
                    continue;
                }
            }
            if let Some(text) = record.query_sample_text.as_deref() {
                if !seen_texts.insert((group.database.as_str(), text.trim())) {
                    debug!(query_id = %record.query_id, "statement text already explained, skipped");
                    continue;
                }
            }

            match explain_record(&conn, record, plan_timeout).await {
                Ok(Some(plan_steps)) => steps.extend(plan_steps),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        database = %group.database,
                        query_id = %record.query_id,
                        event_id = ?record.event_id,
                        error = %e,
                        "plan extraction failed"
                    );
                }
            }
        }

        conn.close().await;
    }

    debug!(groups = groups.len(), steps = steps.len(), "plans extracted");
    steps
}

/// `Ok(None)` for records skipped before reaching the server.
async fn explain_record<S: SqlSource + ?Sized>(
    conn: &S,
    record: &IndividualQueryRecord,
    timeout: Duration,
) -> Result<Option<Vec<PlanStep>>, DbError> {
    let (Some(event_id), Some(thread_id)) = (record.event_id, record.thread_id) else {
        warn!(query_id = %record.query_id, "execution without event or thread id skipped");
        return Ok(None);
    };
    let Some(text) = record.query_sample_text.as_deref() else {
        warn!(query_id = %record.query_id, event_id, "execution without sample text skipped");
        return Ok(None);
    };
    if !is_explainable(text) {
        warn!(query_id = %record.query_id, event_id, "statement cannot be explained, skipped");
        return Ok(None);
    }

    let statement = text.trim().trim_end_matches(';').trim_end();
    let sql = format!("EXPLAIN FORMAT=JSON {statement}");
    let rows = fetch_with_timeout(conn, timeout, &sql, &[]).await?;

    let Some(raw) = rows.first().and_then(|row| row.value_at(0).as_text()) else {
        return Err(DbError::Decode("EXPLAIN returned no plan document".to_string()));
    };
    let plan: Value =
        serde_json::from_str(&raw).map_err(|e| DbError::Decode(format!("plan JSON: {e}")))?;

    Ok(Some(flatten_plan(&plan, event_id, thread_id)))
}
