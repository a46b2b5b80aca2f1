//! Per-connection application logic and the task that drives it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error};

use crate::conn::Connection;
use crate::telemetry::{ConnectionGuard, ServerStats};

/// Caller-supplied driver for one connection.
#[async_trait]
pub trait Agent: Send + 'static {
    /// Drives the connection until the application is done with it.
    async fn run(&mut self);

    /// Called after the connection has been closed.
    async fn on_close(&mut self);
}

/// Builds one agent per accepted connection.
pub type AgentFactory = Arc<dyn Fn(Arc<Connection>) -> Box<dyn Agent> + Send + Sync>;

/// Runs `agent` to completion, then closes `conn` and notifies the agent.
///
/// Cleanup happens however `run` ends, including a panic. The guard is
/// released last, after `on_close` has returned.
pub(crate) async fn run_agent(
    conn: Arc<Connection>,
    mut agent: Box<dyn Agent>,
    stats: Arc<ServerStats>,
) {
    let _guard = ConnectionGuard::new(stats.clone());

    if let Err(payload) = AssertUnwindSafe(agent.run()).catch_unwind().await {
        stats.record_agent_panic();
        error!(panic = %panic_message(&payload), "agent run panicked");
    }

    if let Err(e) = conn.close().await {
        debug!(error = %e, "connection close failed");
    }

    if let Err(payload) = AssertUnwindSafe(agent.on_close()).catch_unwind().await {
        stats.record_agent_panic();
        error!(panic = %panic_message(&payload), "agent on_close panicked");
    }

    debug!("connection finished");
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::transport::testing::{RecordingSession, SessionProbe};

    struct Scripted {
        conn: Arc<Connection>,
        probe: Arc<SessionProbe>,
        panic_in_run: bool,
        events: Arc<Mutex<Vec<String>>>,
        closed_seen: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Agent for Scripted {
        async fn run(&mut self) {
            self.conn.write(b"hi").await.unwrap();
            self.events.lock().unwrap().push("run".into());
            if self.panic_in_run {
                panic!("agent exploded");
            }
        }

        async fn on_close(&mut self) {
            let closes = self.probe.closes.load(Ordering::SeqCst);
            self.closed_seen.store(closes == 1, Ordering::SeqCst);
            self.events.lock().unwrap().push("on_close".into());
        }
    }

    fn scripted(panic_in_run: bool) -> (Arc<Connection>, Scripted, Arc<Mutex<Vec<String>>>, Arc<AtomicBool>) {
        let (session, probe) = RecordingSession::new(Duration::ZERO);
        let conn = Arc::new(Connection::new(Box::new(session)));
        let events = Arc::new(Mutex::new(Vec::new()));
        let closed_seen = Arc::new(AtomicBool::new(false));
        let agent = Scripted {
            conn: conn.clone(),
            probe,
            panic_in_run,
            events: events.clone(),
            closed_seen: closed_seen.clone(),
        };
        (conn, agent, events, closed_seen)
    }

    #[tokio::test]
    async fn cleanup_runs_after_run_in_order() {
        let (conn, agent, events, closed_seen) = scripted(false);
        let stats = Arc::new(ServerStats::default());

        run_agent(conn.clone(), Box::new(agent), stats.clone()).await;

        assert_eq!(*events.lock().unwrap(), vec!["run", "on_close"]);
        assert!(closed_seen.load(Ordering::SeqCst));
        assert!(conn.is_closed().await);
        assert_eq!(stats.snapshot().active_connections, 0);
        assert_eq!(stats.snapshot().agent_panics, 0);
    }

    #[tokio::test]
    async fn cleanup_survives_panicking_run() {
        let (conn, agent, events, closed_seen) = scripted(true);
        let stats = Arc::new(ServerStats::default());

        run_agent(conn.clone(), Box::new(agent), stats.clone()).await;

        assert_eq!(*events.lock().unwrap(), vec!["run", "on_close"]);
        assert!(closed_seen.load(Ordering::SeqCst));
        assert!(conn.is_closed().await);
        assert_eq!(stats.snapshot().agent_panics, 1);
        assert_eq!(stats.snapshot().active_connections, 0);
    }
}
