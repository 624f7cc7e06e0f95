//! `amb-audit` — immutable audit trail for the Ambassador gateway.
//!
//! Events flow `pipeline → AuditBuffer (ring) → AuditSink`, with overflow
//! spilling to an append-only file or incrementing a drop counter. Emission
//! never blocks the user path; a background flusher drains the ring.

pub mod buffer;
pub mod event;
pub mod sink;

pub use buffer::AuditBuffer;
pub use event::{AuditEvent, AuthzDecision, EventType, Severity};
pub use sink::{AuditSink, MemorySink, TracingSink};
