//! Telemetry sinks: JSON lines for the daemon, in-memory for tests.

use std::io::{self, Write};

use super::{Batch, Entity, TelemetrySink};

/// Writes each batch as one JSON document per line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    next_entity_id: u64,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            next_entity_id: 1,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TelemetrySink for JsonLinesSink<W> {
    fn new_entity(&mut self, name: &str) -> Entity {
        let id = self.next_entity_id;
        self.next_entity_id += 1;
        Entity {
            id,
            name: name.to_string(),
        }
    }

    fn publish(&mut self, batch: Batch) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, &batch)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Keeps published batches in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Vec<Batch>,
    next_entity_id: u64,
    fail_after: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every publish once `accepted` batches have been stored.
    pub fn fail_after(mut self, accepted: usize) -> Self {
        self.fail_after = Some(accepted);
        self
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Events across all batches with the given type.
    pub fn events_of(&self, event_type: &str) -> usize {
        self.batches
            .iter()
            .flat_map(|b| &b.events)
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl TelemetrySink for MemorySink {
    fn new_entity(&mut self, name: &str) -> Entity {
        self.next_entity_id += 1;
        Entity {
            id: self.next_entity_id,
            name: name.to_string(),
        }
    }

    fn publish(&mut self, batch: Batch) -> io::Result<()> {
        if self.fail_after.is_some_and(|n| self.batches.len() >= n) {
            return Err(io::Error::other("sink rejected batch"));
        }
        self.batches.push(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttributeSet;
    use crate::publish::Event;

    #[test]
    fn json_lines_are_ordered_objects() {
        let mut sink = JsonLinesSink::new(Vec::new());
        let entity = sink.new_entity("mysql:db1:3306");
        let mut attributes = AttributeSet::new();
        attributes
            .text("query_id", Some("d1"))
            .gauge("avg_elapsed_time_ms", Some(812.5));

        sink.publish(Batch {
            entity,
            events: vec![Event {
                event_type: "MysqlSlowQueriesSample".to_string(),
                attributes,
            }],
        })
        .unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            out,
            "{\"entity\":{\"id\":1,\"name\":\"mysql:db1:3306\"},\"events\":[{\"event_type\":\"MysqlSlowQueriesSample\",\"attributes\":{\"query_id\":\"d1\",\"avg_elapsed_time_ms\":812.5}}]}\n"
        );
    }

    #[test]
    fn entity_ids_are_fresh() {
        let mut sink = JsonLinesSink::new(io::sink());
        let a = sink.new_entity("e");
        let b = sink.new_entity("e");
        assert_ne!(a.id, b.id);
    }
}
