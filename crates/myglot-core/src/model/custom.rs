//! Rows returned by user-defined queries.

use super::{AttributeSet, MetricRecord, MetricValue};
use crate::source::{SqlRow, SqlValue};

/// One result row of a custom query. Numeric columns become gauges,
/// everything else an attribute; NULL columns are dropped.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CustomQueryRecord {
    pub event_type: String,
    pub values: Vec<(String, MetricValue)>,
}

impl CustomQueryRecord {
    pub fn from_row(event_type: &str, row: &SqlRow) -> Self {
        let values = row
            .columns()
            .filter_map(|(name, value)| {
                let metric = match value {
                    SqlValue::Null => return None,
                    SqlValue::Int(v) => MetricValue::Gauge(*v as f64),
                    SqlValue::UInt(v) => MetricValue::Gauge(*v as f64),
                    SqlValue::Float(v) => MetricValue::Gauge(*v),
                    SqlValue::Text(s) => MetricValue::Attribute(s.clone()),
                };
                Some((name.to_ascii_lowercase(), metric))
            })
            .collect();

        Self {
            event_type: event_type.to_string(),
            values,
        }
    }
}

impl MetricRecord for CustomQueryRecord {
    fn attributes(&self) -> AttributeSet {
        let mut a = AttributeSet::new();
        for (name, value) in &self.values {
            a.dynamic(name.clone(), value.clone());
        }
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_map_by_kind() {
        let row = SqlRow::new()
            .with("TABLE_NAME", "orders")
            .with("ROWS", 120i64)
            .with("avg_len", 12.5)
            .with("comment", SqlValue::Null);

        let record = CustomQueryRecord::from_row("TableSample", &row);
        let attrs = record.attributes();

        assert_eq!(attrs.len(), 3);
        assert_eq!(
            attrs.get("table_name"),
            Some(&MetricValue::Attribute("orders".to_string()))
        );
        assert_eq!(attrs.get("rows"), Some(&MetricValue::Gauge(120.0)));
        assert!(attrs.get("comment").is_none());
    }
}
