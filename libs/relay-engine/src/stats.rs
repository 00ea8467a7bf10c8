//! Lock-free pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by receiver, subscriber and writer.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub received: AtomicU64,
    pub malformed: AtomicU64,
    pub enqueued: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
    pub written: AtomicU64,
    pub write_retries: AtomicU64,
    pub write_failures: AtomicU64,
}

impl PipelineStats {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nacked(&self) {
        self.nacked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_retry(&self) {
        self.write_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `PipelineStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub malformed: u64,
    pub enqueued: u64,
    pub acked: u64,
    pub nacked: u64,
    pub written: u64,
    pub write_retries: u64,
    pub write_failures: u64,
}
