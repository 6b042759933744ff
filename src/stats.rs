//! Operation counters, sampled by the store and emitted through tracing.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    puts: AtomicU64,
    gets: AtomicU64,
    has_checks: AtomicU64,
    commits: AtomicU64,
    commit_retries: AtomicU64,
    flushes: AtomicU64,
    conjoins: AtomicU64,
    chunks_read: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get(&self, chunks: u64) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.chunks_read.fetch_add(chunks, Ordering::Relaxed);
    }

    pub fn record_has(&self, addrs: u64) {
        self.has_checks.fetch_add(addrs, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_retry(&self) {
        self.commit_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conjoin(&self) {
        self.conjoins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Emit all counters as one structured event.
    pub fn log_summary(&self) {
        tracing::info!(
            puts = self.puts.load(Ordering::Relaxed),
            gets = self.gets.load(Ordering::Relaxed),
            has_checks = self.has_checks.load(Ordering::Relaxed),
            commits = self.commits.load(Ordering::Relaxed),
            commit_retries = self.commit_retries.load(Ordering::Relaxed),
            flushes = self.flushes.load(Ordering::Relaxed),
            conjoins = self.conjoins.load(Ordering::Relaxed),
            chunks_read = self.chunks_read.load(Ordering::Relaxed),
            "store stats"
        );
    }
}
