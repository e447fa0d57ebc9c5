//! Records produced by one collection cycle and their telemetry attributes.
//!
//! Each record kind maps itself to an ordered attribute list by hand. Absent
//! values are left out of the list entirely, never published as zero or "".

mod custom;
mod locks;
mod plan;
mod query;

use std::borrow::Cow;

use serde::Serialize;

pub use custom::CustomQueryRecord;
pub use locks::{BlockingSessionRecord, WaitCategory, WaitEventRecord};
pub use plan::PlanStep;
pub use query::{
    IndividualQueryRecord, QUERY_TEXT_MAX_CHARS, QueryGroup, SlowQueryRecord, StatementType,
    TRUNCATION_MARKER, truncate_query_text,
};

pub const SLOW_QUERY_EVENT_TYPE: &str = "MysqlSlowQueriesSample";
pub const INDIVIDUAL_QUERY_EVENT_TYPE: &str = "MysqlIndividualQueriesSample";
pub const QUERY_PLAN_EVENT_TYPE: &str = "MysqlQueryExecutionSample";
pub const WAIT_EVENT_EVENT_TYPE: &str = "MysqlWaitEventsSample";
pub const BLOCKING_SESSION_EVENT_TYPE: &str = "MysqlBlockingSessionsSample";

/// A published value and how the backend should treat it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// Numeric sample.
    Gauge(f64),
    /// Categorical value.
    Attribute(String),
}

/// Ordered `(name, value)` pairs of one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSet {
    entries: Vec<(Cow<'static, str>, MetricValue)>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a numeric value; `None` is skipped.
    pub fn gauge(&mut self, name: &'static str, value: Option<f64>) -> &mut Self {
        if let Some(v) = value {
            self.entries.push((Cow::Borrowed(name), MetricValue::Gauge(v)));
        }
        self
    }

    /// Adds an integer counter as a gauge; `None` is skipped.
    pub fn count(&mut self, name: &'static str, value: Option<u64>) -> &mut Self {
        self.gauge(name, value.map(|v| v as f64))
    }

    /// Adds a categorical value; `None` is skipped.
    pub fn text(&mut self, name: &'static str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value {
            self.entries
                .push((Cow::Borrowed(name), MetricValue::Attribute(v.to_string())));
        }
        self
    }

    pub fn flag(&mut self, name: &'static str, value: bool) -> &mut Self {
        self.text(name, Some(if value { "true" } else { "false" }))
    }

    /// Adds an entry whose name is only known at runtime.
    pub fn dynamic(&mut self, name: String, value: MetricValue) -> &mut Self {
        self.entries.push((Cow::Owned(name), value));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_ref())
    }
}

/// Serialized as a JSON object in insertion order.
impl Serialize for AttributeSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name.as_ref(), value)?;
        }
        map.end()
    }
}

/// A record that can be flattened into telemetry attributes.
pub trait MetricRecord {
    fn attributes(&self) -> AttributeSet;
}

/// Any record kind the pipeline publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    SlowQuery(SlowQueryRecord),
    IndividualQuery(IndividualQueryRecord),
    PlanStep(PlanStep),
    WaitEvent(WaitEventRecord),
    BlockingSession(BlockingSessionRecord),
    Custom(CustomQueryRecord),
}

impl MetricRecord for Record {
    fn attributes(&self) -> AttributeSet {
        match self {
            Record::SlowQuery(r) => r.attributes(),
            Record::IndividualQuery(r) => r.attributes(),
            Record::PlanStep(r) => r.attributes(),
            Record::WaitEvent(r) => r.attributes(),
            Record::BlockingSession(r) => r.attributes(),
            Record::Custom(r) => r.attributes(),
        }
    }
}

macro_rules! impl_from_record {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(impl From<$ty> for Record {
            fn from(r: $ty) -> Self {
                Record::$variant(r)
            }
        })*
    };
}

impl_from_record! {
    SlowQuery => SlowQueryRecord,
    IndividualQuery => IndividualQueryRecord,
    PlanStep => PlanStep,
    WaitEvent => WaitEventRecord,
    BlockingSession => BlockingSessionRecord,
    Custom => CustomQueryRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_values_are_omitted() {
        let mut set = AttributeSet::new();
        set.gauge("a", None)
            .gauge("b", Some(0.0))
            .text("c", None)
            .text("d", Some(""))
            .count("e", Some(3));

        let names: Vec<&str> = set.names().collect();
        assert_eq!(names, vec!["b", "d", "e"]);
        assert_eq!(set.get("e"), Some(&MetricValue::Gauge(3.0)));
    }

    #[test]
    fn record_enum_delegates() {
        let record: Record = SlowQueryRecord {
            query_id: "d1".to_string(),
            execution_count: Some(4),
            ..Default::default()
        }
        .into();

        let attrs = record.attributes();
        assert_eq!(attrs.get("query_id"), Some(&MetricValue::Attribute("d1".to_string())));
        assert_eq!(attrs.get("execution_count"), Some(&MetricValue::Gauge(4.0)));
        assert!(attrs.get("avg_cpu_time_ms").is_none());
    }
}
