//! Durable sinks the audit flusher hands batches to.

use async_trait::async_trait;

use amb_domain::error::Result;

use crate::event::AuditEvent;

/// Destination for flushed audit batches. Implementations must treat a
/// delivered batch as immutable.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn flush(&self, events: Vec<AuditEvent>) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tracing sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Emits each event as a structured log line.
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn flush(&self, events: Vec<AuditEvent>) -> Result<()> {
        for event in events {
            let json = serde_json::to_string(&event).unwrap_or_default();
            tracing::info!(audit_event = %json, "amb_audit");
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Retains flushed events in memory, newest last, capped. Backs the admin
/// audit query endpoint and the test suite.
pub struct MemorySink {
    events: parking_lot::RwLock<Vec<AuditEvent>>,
    capacity: usize,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::with_capacity(50_000)
    }
}

impl MemorySink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: parking_lot::RwLock::new(Vec::new()),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// The most recent `limit` events starting at `offset` from the end.
    pub fn recent(&self, offset: usize, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.read();
        events
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<AuditEvent> {
        self.events.read().clone()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn flush(&self, batch: Vec<AuditEvent>) -> Result<()> {
        let mut events = self.events.write();
        events.extend(batch);
        let len = events.len();
        if len > self.capacity {
            events.drain(..len - self.capacity);
        }
        Ok(())
    }
}
