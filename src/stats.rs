use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::forwarder::Direction;

/// Process-wide relay counters, cloned into every session.
#[derive(Clone, Default)]
pub struct Stats {
    total_sessions: Arc<AtomicUsize>,
    active_sessions: Arc<AtomicUsize>,
    failed_upstream: Arc<AtomicUsize>,
    chunks_forwarded: Arc<AtomicU64>,
    chunks_dropped: Arc<AtomicU64>,
    chunks_reordered: Arc<AtomicU64>,
    chunks_flushed: Arc<AtomicU64>,
    bytes_to_server: Arc<AtomicU64>,
    bytes_to_client: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub failed_upstream: usize,
    pub chunks_forwarded: u64,
    pub chunks_dropped: u64,
    pub chunks_reordered: u64,
    pub chunks_flushed: u64,
    pub bytes_to_server: u64,
    pub bytes_to_client: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a new session and returns a guard that marks it inactive on drop.
    pub fn session_started(&self) -> ActiveSessionGuard {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        ActiveSessionGuard(Arc::clone(&self.active_sessions))
    }

    pub fn upstream_failed(&self) {
        self.failed_upstream.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_forwarded(&self, direction: Direction, len: usize) {
        self.chunks_forwarded.fetch_add(1, Ordering::Relaxed);
        self.add_bytes(direction, len);
    }

    pub fn chunk_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A chunk left the reorder buffer ahead of one that arrived after it.
    pub fn chunk_reordered(&self) {
        self.chunks_reordered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_flushed(&self, direction: Direction, len: usize) {
        self.chunks_flushed.fetch_add(1, Ordering::Relaxed);
        self.add_bytes(direction, len);
    }

    fn add_bytes(&self, direction: Direction, len: usize) {
        let counter = match direction {
            Direction::ClientToServer => &self.bytes_to_server,
            Direction::ServerToClient => &self.bytes_to_client,
        };
        counter.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            failed_upstream: self.failed_upstream.load(Ordering::Relaxed),
            chunks_forwarded: self.chunks_forwarded.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            chunks_reordered: self.chunks_reordered.load(Ordering::Relaxed),
            chunks_flushed: self.chunks_flushed.load(Ordering::Relaxed),
            bytes_to_server: self.bytes_to_server.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}

pub struct ActiveSessionGuard(Arc<AtomicUsize>);

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
