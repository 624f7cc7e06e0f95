//! Bounded audit ring with spill-to-disk overflow and a periodic flusher.
//!
//! `add` is O(1) and never blocks the user path on the sink. When the ring
//! is full the oldest event spills to an append-only file (owner-only, never
//! a symlink, size-capped); with spilling unavailable it is dropped and the
//! drop counter increments. Nothing is ever lost silently.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use amb_domain::config::AuditConfig;

use crate::event::AuditEvent;
use crate::sink::AuditSink;

struct SpillFile {
    file: std::fs::File,
    written: u64,
}

pub struct AuditBuffer {
    config: AuditConfig,
    ring: parking_lot::Mutex<VecDeque<AuditEvent>>,
    spill: parking_lot::Mutex<Option<SpillFile>>,
    dropped: AtomicU64,
    spilled: AtomicU64,
    stopped: AtomicBool,
    sink: Arc<dyn AuditSink>,
}

impl AuditBuffer {
    pub fn new(config: AuditConfig, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            config,
            ring: parking_lot::Mutex::new(VecDeque::new()),
            spill: parking_lot::Mutex::new(None),
            dropped: AtomicU64::new(0),
            spilled: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            sink,
        }
    }

    /// Accept an event. Returns `false` only when an overflow event could
    /// not be absorbed (spill disabled, over cap, or the write failed) and
    /// was dropped instead; callers running in `block` mode fail the request
    /// on that signal.
    pub fn add(&self, event: AuditEvent) -> bool {
        let overflow = {
            let mut ring = self.ring.lock();
            let overflow = if ring.len() >= self.config.ring_capacity {
                ring.pop_front()
            } else {
                None
            };
            ring.push_back(event);
            overflow
        };

        match overflow {
            None => true,
            Some(oldest) => {
                if self.spill_event(&oldest) {
                    self.spilled.fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    /// Events dropped on overflow since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events spilled to disk since startup.
    pub fn spilled_count(&self) -> u64 {
        self.spilled.load(Ordering::Relaxed)
    }

    pub fn ring_len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Swap the ring out and hand the batch to the sink. On sink failure the
    /// batch is re-prepended and retried on the next tick; the flusher never
    /// gives up on a batch.
    pub async fn flush(&self) {
        let batch: Vec<AuditEvent> = {
            let mut ring = self.ring.lock();
            if ring.is_empty() {
                return;
            }
            ring.drain(..).collect()
        };
        let len = batch.len();
        if let Err(e) = self.sink.flush(batch.clone()).await {
            tracing::warn!(error = %e, events = len, "audit sink flush failed, will retry");
            let mut ring = self.ring.lock();
            for event in batch.into_iter().rev() {
                ring.push_front(event);
            }
        } else {
            tracing::debug!(events = len, "audit batch flushed");
        }
    }

    /// Periodic flusher loop. Runs until [`shutdown`](Self::shutdown).
    pub async fn run_flusher(self: Arc<Self>) {
        let period = std::time::Duration::from_millis(self.config.flush_interval_ms.max(100));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            self.flush().await;
        }
    }

    /// Stop the flusher, perform a final flush, and close the spill handle.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.flush().await;
        *self.spill.lock() = None;
    }

    // ── spill file ───────────────────────────────────────────────────

    fn spill_event(&self, event: &AuditEvent) -> bool {
        let Some(path) = self.config.spill_path.clone() else {
            return false;
        };
        let line = match serde_json::to_string(event) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize audit event for spill");
                return false;
            }
        };

        let mut guard = self.spill.lock();
        if guard.is_none() {
            match open_spill_file(&path) {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "cannot open audit spill file");
                    return false;
                }
            }
        }
        let spill = guard.as_mut().expect("spill file opened above");

        let needed = line.len() as u64 + 1;
        if spill.written + needed > self.config.spill_max_bytes {
            tracing::warn!(
                path = %path.display(),
                cap = self.config.spill_max_bytes,
                "audit spill file at capacity"
            );
            return false;
        }
        if let Err(e) = writeln!(spill.file, "{line}") {
            tracing::error!(error = %e, "audit spill write failed");
            return false;
        }
        spill.written += needed;
        true
    }
}

/// Open (or create) the spill file append-only with owner-only permissions.
/// Refuses to follow a symlink.
fn open_spill_file(path: &PathBuf) -> std::io::Result<SpillFile> {
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "audit spill path is a symlink",
            ));
        }
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options.open(path)?;
    let written = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok(SpillFile { file, written })
}
