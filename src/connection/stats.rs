use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Operations handed to the transport
    pub ops_dispatched: AtomicU64,
    /// Operations that finished successfully
    pub ops_completed: AtomicU64,
    /// Operations that finished with an error (timeouts included)
    pub ops_failed: AtomicU64,
    pub ops_timed_out: AtomicU64,
    /// Completions that arrived for an operation no longer pending
    pub late_completions: AtomicU64,
    pub view_chunks: AtomicU64,
    pub view_bytes: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op_dispatched(&self) {
        self.ops_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn op_finished(&self, ok: bool) {
        if ok {
            self.ops_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ops_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn op_timed_out(&self) {
        self.ops_timed_out.fetch_add(1, Ordering::Relaxed);
        self.ops_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn late_completion(&self) {
        self.late_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn view_chunk(&self, bytes: usize) {
        self.view_chunks.fetch_add(1, Ordering::Relaxed);
        self.view_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Operations dispatched and not yet finished.
    pub fn in_flight(&self) -> u64 {
        let dispatched = self.ops_dispatched.load(Ordering::Relaxed);
        let finished =
            self.ops_completed.load(Ordering::Relaxed) + self.ops_failed.load(Ordering::Relaxed);
        dispatched.saturating_sub(finished)
    }
}
