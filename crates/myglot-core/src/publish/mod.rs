//! Telemetry publishing: records to attribute maps to bounded batches.
//!
//! Every chunk of one publish call goes out against a freshly created
//! entity, so a sink failure leaves earlier chunks intact and stops only the
//! rest of that call.

mod sink;

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::model::{AttributeSet, MetricRecord};

pub use sink::{JsonLinesSink, MemorySink};

/// Reporting entity a batch is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entity {
    pub id: u64,
    pub name: String,
}

/// One published record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event_type: String,
    pub attributes: AttributeSet,
}

/// Events flushed in one publish operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub entity: Entity,
    pub events: Vec<Event>,
}

/// Destination for telemetry batches.
pub trait TelemetrySink {
    /// Creates an entity with an id not handed out before by this sink.
    fn new_entity(&mut self, name: &str) -> Entity;

    /// Flushes one batch. Must preserve event order.
    fn publish(&mut self, batch: Batch) -> std::io::Result<()>;
}

/// A sink rejected a chunk.
#[derive(Debug)]
pub enum PublishError {
    Sink {
        event_type: String,
        /// Zero-based index of the failed chunk.
        chunk: usize,
        /// Records already flushed by earlier chunks of the same call.
        flushed: usize,
        source: std::io::Error,
    },
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Sink {
                event_type,
                chunk,
                flushed,
                source,
            } => write!(
                f,
                "publishing {} chunk {} failed after {} records: {}",
                event_type, chunk, flushed, source
            ),
        }
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PublishError::Sink { source, .. } => Some(source),
        }
    }
}

/// Counts for one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub published: usize,
    /// Records with no attributes at all.
    pub skipped: usize,
    pub chunks: usize,
}

impl PublishSummary {
    pub fn merge(&mut self, other: PublishSummary) {
        self.published += other.published;
        self.skipped += other.skipped;
        self.chunks += other.chunks;
    }
}

/// Splits records into chunks of at most `chunk_size` events.
#[derive(Debug, Clone)]
pub struct BatchPublisher {
    chunk_size: usize,
    entity_name: String,
}

impl BatchPublisher {
    pub fn new(chunk_size: usize, entity_name: impl Into<String>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            entity_name: entity_name.into(),
        }
    }

    /// Publishes `records` under `event_type`.
    ///
    /// Records without attributes are skipped and counted. An empty input
    /// publishes nothing and creates no entity.
    pub fn publish<R, K>(
        &self,
        sink: &mut K,
        event_type: &str,
        records: &[R],
    ) -> Result<PublishSummary, PublishError>
    where
        R: MetricRecord,
        K: TelemetrySink + ?Sized,
    {
        let mut summary = PublishSummary::default();
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            let attributes = record.attributes();
            if attributes.is_empty() {
                summary.skipped += 1;
                continue;
            }
            events.push(Event {
                event_type: event_type.to_string(),
                attributes,
            });
        }
        if summary.skipped > 0 {
            warn!(event_type, skipped = summary.skipped, "records without attributes skipped");
        }

        let mut events = events.into_iter().peekable();
        while events.peek().is_some() {
            let chunk: Vec<Event> = events.by_ref().take(self.chunk_size).collect();
            let len = chunk.len();
            let entity = sink.new_entity(&self.entity_name);
            let entity_id = entity.id;

            sink.publish(Batch {
                entity,
                events: chunk,
            })
            .map_err(|source| PublishError::Sink {
                event_type: event_type.to_string(),
                chunk: summary.chunks,
                flushed: summary.published,
                source,
            })?;

            debug!(event_type, entity_id, events = len, "chunk published");
            summary.published += len;
            summary.chunks += 1;
        }

        Ok(summary)
    }
}
