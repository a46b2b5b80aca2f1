use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters owned by one server instance.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    accept_retries: AtomicU64,
    active_connections: AtomicU64,
    agent_panics: AtomicU64,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub accept_retries: u64,
    pub active_connections: u64,
    pub agent_panics: u64,
}

impl ServerStats {
    pub(crate) fn record_accept(&self) {
        tracing::trace!("record_accept");
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accept_retry(&self) {
        self.accept_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_agent_panic(&self) {
        self.agent_panics.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connection_open(&self) {
        tracing::debug!("record_connection_open");
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connection_close(&self) {
        tracing::debug!("record_connection_close");
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            accept_retries: self.accept_retries.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            agent_panics: self.agent_panics.load(Ordering::Relaxed),
        }
    }
}

/// RAII guard for tracking an active connection.
pub(crate) struct ConnectionGuard(Arc<ServerStats>);

impl ConnectionGuard {
    pub(crate) fn new(stats: Arc<ServerStats>) -> Self {
        stats.record_connection_open();
        Self(stats)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.record_connection_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_active_connections() {
        let stats = Arc::new(ServerStats::default());
        let first = ConnectionGuard::new(stats.clone());
        let second = ConnectionGuard::new(stats.clone());
        assert_eq!(stats.snapshot().active_connections, 2);

        drop(first);
        assert_eq!(stats.snapshot().active_connections, 1);
        drop(second);
        assert_eq!(stats.snapshot().active_connections, 0);
    }
}
