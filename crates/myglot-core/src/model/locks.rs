//! Wait-event aggregates and blocking transaction pairs.

use super::{AttributeSet, MetricRecord};

/// Human-readable family of a `performance_schema` wait event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCategory {
    InnodbFileIo,
    SqlFileIo,
    FileIo,
    NetworkIo,
    TableIo,
    TableLock,
    MetadataLock,
    ReadWriteLock,
    Mutex,
    Condition,
    Idle,
    Other,
}

impl WaitCategory {
    /// Classifies a raw event name such as `wait/io/file/innodb/innodb_data_file`.
    pub fn classify(event_name: &str) -> Self {
        let name = event_name.trim().to_ascii_lowercase();
        let name = name.as_str();

        if name.starts_with("wait/io/file/innodb/") {
            WaitCategory::InnodbFileIo
        } else if name.starts_with("wait/io/file/sql/") {
            WaitCategory::SqlFileIo
        } else if name.starts_with("wait/io/file/") {
            WaitCategory::FileIo
        } else if name.starts_with("wait/io/socket/") {
            WaitCategory::NetworkIo
        } else if name.starts_with("wait/io/table/") {
            WaitCategory::TableIo
        } else if name.starts_with("wait/lock/table/") {
            WaitCategory::TableLock
        } else if name.starts_with("wait/lock/metadata/") {
            WaitCategory::MetadataLock
        } else if name.starts_with("wait/synch/rwlock/") || name.starts_with("wait/synch/sxlock/")
        {
            WaitCategory::ReadWriteLock
        } else if name.starts_with("wait/synch/mutex/") {
            WaitCategory::Mutex
        } else if name.starts_with("wait/synch/cond/") {
            WaitCategory::Condition
        } else if name == "idle" {
            WaitCategory::Idle
        } else {
            WaitCategory::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WaitCategory::InnodbFileIo => "InnoDB File IO",
            WaitCategory::SqlFileIo => "SQL File IO",
            WaitCategory::FileIo => "File IO",
            WaitCategory::NetworkIo => "Network IO",
            WaitCategory::TableIo => "Table IO",
            WaitCategory::TableLock => "Table Lock",
            WaitCategory::MetadataLock => "Metadata Lock",
            WaitCategory::ReadWriteLock => "Read/Write Lock",
            WaitCategory::Mutex => "Mutex",
            WaitCategory::Condition => "Condition Wait",
            WaitCategory::Idle => "Idle",
            WaitCategory::Other => "Other",
        }
    }
}

/// Wait time aggregated per digest, database and wait event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WaitEventRecord {
    pub query_id: Option<String>,
    pub query_text: Option<String>,
    pub database_name: Option<String>,
    pub wait_event_name: Option<String>,
    pub wait_category: Option<WaitCategory>,
    pub total_wait_time_ms: Option<f64>,
    pub wait_event_count: Option<u64>,
    pub avg_wait_time_ms: Option<f64>,
    pub collection_timestamp: Option<String>,
}

impl MetricRecord for WaitEventRecord {
    fn attributes(&self) -> AttributeSet {
        let mut a = AttributeSet::new();
        a.text("query_id", self.query_id.as_deref())
            .text("query_text", self.query_text.as_deref())
            .text("database_name", self.database_name.as_deref())
            .text("wait_event_name", self.wait_event_name.as_deref())
            .text("wait_category", self.wait_category.map(|c| c.as_str()))
            .gauge("total_wait_time_ms", self.total_wait_time_ms)
            .count("wait_event_count", self.wait_event_count)
            .gauge("avg_wait_time_ms", self.avg_wait_time_ms)
            .text("collection_timestamp", self.collection_timestamp.as_deref());
        a
    }
}

/// A blocked transaction paired with the transaction holding its lock.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlockingSessionRecord {
    pub blocked_txn_id: Option<String>,
    pub blocked_pid: Option<u64>,
    pub blocked_thread_id: Option<u64>,
    pub blocked_query_id: Option<String>,
    pub blocked_query: Option<String>,
    pub blocked_host: Option<String>,
    pub blocked_txn_start_time: Option<String>,
    pub blocked_status: Option<String>,
    pub database_name: Option<String>,
    pub blocking_txn_id: Option<String>,
    pub blocking_pid: Option<u64>,
    pub blocking_thread_id: Option<u64>,
    pub blocking_query_id: Option<String>,
    pub blocking_query: Option<String>,
    pub blocking_host: Option<String>,
    pub blocking_txn_start_time: Option<String>,
    pub blocking_status: Option<String>,
    pub collection_timestamp: Option<String>,
}

impl MetricRecord for BlockingSessionRecord {
    fn attributes(&self) -> AttributeSet {
        let mut a = AttributeSet::new();
        a.text("blocked_txn_id", self.blocked_txn_id.as_deref())
            .count("blocked_pid", self.blocked_pid)
            .count("blocked_thread_id", self.blocked_thread_id)
            .text("blocked_query_id", self.blocked_query_id.as_deref())
            .text("blocked_query", self.blocked_query.as_deref())
            .text("blocked_host", self.blocked_host.as_deref())
            .text("blocked_txn_start_time", self.blocked_txn_start_time.as_deref())
            .text("blocked_status", self.blocked_status.as_deref())
            .text("database_name", self.database_name.as_deref())
            .text("blocking_txn_id", self.blocking_txn_id.as_deref())
            .count("blocking_pid", self.blocking_pid)
            .count("blocking_thread_id", self.blocking_thread_id)
            .text("blocking_query_id", self.blocking_query_id.as_deref())
            .text("blocking_query", self.blocking_query.as_deref())
            .text("blocking_host", self.blocking_host.as_deref())
            .text("blocking_txn_start_time", self.blocking_txn_start_time.as_deref())
            .text("blocking_status", self.blocking_status.as_deref())
            .text("collection_timestamp", self.collection_timestamp.as_deref());
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_events_classify_by_prefix() {
        let cases = [
            ("wait/io/file/innodb/innodb_data_file", WaitCategory::InnodbFileIo),
            ("wait/io/file/sql/binlog", WaitCategory::SqlFileIo),
            ("wait/io/file/myisam/kfile", WaitCategory::FileIo),
            ("wait/io/socket/sql/client_connection", WaitCategory::NetworkIo),
            ("wait/io/table/sql/handler", WaitCategory::TableIo),
            ("wait/lock/table/sql/handler", WaitCategory::TableLock),
            ("wait/lock/metadata/sql/mdl", WaitCategory::MetadataLock),
            ("wait/synch/rwlock/innodb/dict_operation_lock", WaitCategory::ReadWriteLock),
            ("wait/synch/sxlock/innodb/btr_search_latch", WaitCategory::ReadWriteLock),
            ("wait/synch/mutex/innodb/trx_mutex", WaitCategory::Mutex),
            ("WAIT/SYNCH/COND/sql/COND_thr_lock", WaitCategory::Condition),
            ("idle", WaitCategory::Idle),
            ("stage/sql/Sending data", WaitCategory::Other),
            ("", WaitCategory::Other),
        ];
        for (name, expected) in cases {
            assert_eq!(WaitCategory::classify(name), expected, "{name}");
        }
    }

    #[test]
    fn blocking_attributes_skip_nulls() {
        let record = BlockingSessionRecord {
            blocked_pid: Some(12),
            blocking_pid: Some(7),
            database_name: Some("shop".to_string()),
            ..Default::default()
        };
        let attrs = record.attributes();
        let names: Vec<&str> = attrs.names().collect();
        assert_eq!(names, vec!["blocked_pid", "database_name", "blocking_pid"]);
    }
}
