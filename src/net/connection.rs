//! Connection identity and lifecycle tracking.
//!
//! # Responsibilities
//! - Issue unique, monotonic connection IDs for tracing
//! - Count live connections so shutdown can drain them
//! - Keep the active-connections gauge in step with the count

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::observability::metrics;

/// Per-process identity of one client connection, shown as `conn-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Source of connection IDs.
///
/// Cloning shares the sequence. Relaxed ordering is enough: only
/// uniqueness matters, not synchronization with other memory.
#[derive(Debug, Clone)]
pub struct ConnectionIds {
    next: Arc<AtomicU64>,
}

impl ConnectionIds {
    /// A fresh sequence whose first ID is 1.
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// How often `wait_for_drain` re-checks the live count.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Count of client connections whose tasks are still running.
///
/// The server waits on it at shutdown; clones share the count.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    live: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more live client until the returned guard drops.
    pub fn track(&self) -> ConnectionGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        metrics::record_connection_opened();
        ConnectionGuard {
            live: Arc::clone(&self.live),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    /// Wait for the live count to reach zero, for at most `grace`.
    ///
    /// `false` means tunnels were still open when time ran out.
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        let drained = async {
            while self.active_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}

/// Held by a client task; dropping it (also on unwind) ends the count.
#[derive(Debug)]
pub struct ConnectionGuard {
    live: Arc<AtomicU64>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        metrics::record_connection_closed();
    }
}
