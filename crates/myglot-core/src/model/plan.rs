//! Flattened execution plan steps.

use super::{AttributeSet, MetricRecord};

/// One table access or join operation from an `EXPLAIN FORMAT=JSON` tree.
///
/// `(event_id, thread_id)` identifies the individual execution the plan was
/// requested for.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlanStep {
    pub event_id: u64,
    pub thread_id: u64,
    /// Total plan cost of the enclosing query block, carried into nested steps.
    pub query_cost: Option<f64>,
    /// Position in the depth-first walk, starting at 1 and never reset.
    pub step_id: u32,
    pub table_name: Option<String>,
    pub access_type: Option<String>,
    pub rows_examined_per_scan: Option<u64>,
    pub rows_produced_per_join: Option<u64>,
    pub filtered: Option<f64>,
    pub read_cost: Option<f64>,
    pub eval_cost: Option<f64>,
    pub prefix_cost: Option<f64>,
    pub data_read_per_join: Option<String>,
    pub possible_keys: Option<String>,
    pub key: Option<String>,
    pub used_key_parts: Option<String>,
    pub ref_columns: Option<String>,
    pub using_index: bool,
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

impl MetricRecord for PlanStep {
    fn attributes(&self) -> AttributeSet {
        let mut a = AttributeSet::new();
        a.count("event_id", Some(self.event_id))
            .count("thread_id", Some(self.thread_id))
            .gauge("query_cost", self.query_cost)
            .count("step_id", Some(u64::from(self.step_id)))
            .text("table_name", self.table_name.as_deref())
            .text("access_type", self.access_type.as_deref())
            .count("rows_examined_per_scan", self.rows_examined_per_scan)
            .count("rows_produced_per_join", self.rows_produced_per_join)
            .gauge("filtered", self.filtered)
            .gauge("read_cost", self.read_cost)
            .gauge("eval_cost", self.eval_cost)
            .gauge("prefix_cost", self.prefix_cost)
            .text("data_read_per_join", self.data_read_per_join.as_deref())
            .text("possible_keys", self.possible_keys.as_deref())
            .text("key", self.key.as_deref())
            .text("used_key_parts", self.used_key_parts.as_deref())
            .text("ref", self.ref_columns.as_deref())
            .flag("using_index", self.using_index)
            .flag("insert", self.insert)
            .flag("update", self.update)
            .flag("delete", self.delete);
        a
    }
}
