//! Listener lifecycle: bind, accept loop and two-phase shutdown.
//!
//! ```text
//! Unstarted --start--> Listening --close--> Draining --drained--> Stopped
//!                          |                                         ^
//!                          +------------- fatal accept error --------+
//! ```
//!
//! Two task trackers back the shutdown: one holds the accept loop, the other
//! holds every per-connection agent task. `close` waits for the first to drain
//! before closing and draining the second, so "no new connections" and "all
//! connections finished" are observed separately.

mod backoff;

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::agent::{panic_message, run_agent, Agent, AgentFactory};
use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::crypt::{self, CryptError};
use crate::telemetry::{ServerStats, StatsSnapshot};
use crate::transport::{Listener, SessionTuning, Transport};

use backoff::AcceptBackoff;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("agent factory must be configured before start")]
    MissingAgentFactory,
    #[error("server already started")]
    AlreadyStarted,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("security setup failed: {0}")]
    Crypt(#[from] CryptError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unstarted,
    Listening,
    Draining,
    Stopped,
}

/// Connection-oriented front-end over a reliable UDP transport.
pub struct KcpServer {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    new_agent: Option<AgentFactory>,

    listener: Option<Arc<dyn Listener>>,
    local_addr: Option<SocketAddr>,
    state: Arc<Mutex<ServerState>>,
    accept_tasks: TaskTracker,
    conn_tasks: TaskTracker,
    stats: Arc<ServerStats>,
}

impl KcpServer {
    pub fn new(config: ServerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            new_agent: None,
            listener: None,
            local_addr: None,
            state: Arc::new(Mutex::new(ServerState::Unstarted)),
            accept_tasks: TaskTracker::new(),
            conn_tasks: TaskTracker::new(),
            stats: Arc::new(ServerStats::default()),
        }
    }

    /// Sets the factory invoked once per accepted connection.
    pub fn with_agent_factory<F, A>(mut self, factory: F) -> Self
    where
        F: Fn(Arc<Connection>) -> A + Send + Sync + 'static,
        A: Agent,
    {
        let factory: AgentFactory =
            Arc::new(move |conn: Arc<Connection>| Box::new(factory(conn)) as Box<dyn Agent>);
        self.new_agent = Some(factory);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        current_state(&self.state)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Binds the listener and launches the accept loop in the background.
    ///
    /// Fails without binding when no agent factory is set or the security
    /// configuration is unusable; fails after logging when binding fails.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.state() != ServerState::Unstarted {
            return Err(ServerError::AlreadyStarted);
        }
        let new_agent = self
            .new_agent
            .clone()
            .ok_or(ServerError::MissingAgentFactory)?;
        let crypt = crypt::new_block_crypt(&self.config.security)?;
        let encrypted = crypt.is_some();
        let options = self.config.tuning.listen_options(crypt);

        let addr = self.config.listen_addr.clone();
        let listener: Arc<dyn Listener> = match self.transport.listen(&addr, options).await {
            Ok(listener) => Arc::from(listener),
            Err(e) => {
                error!(listen_addr = %addr, error = %e, "KCP listen failed");
                return Err(ServerError::Bind { addr, source: e });
            }
        };
        self.local_addr = listener.local_addr().ok();
        info!(
            listen_addr = %addr,
            local_addr = ?self.local_addr,
            encrypted,
            "KCP listen"
        );

        set_state(&self.state, ServerState::Listening);
        let accept_loop = AcceptLoop {
            listener: listener.clone(),
            new_agent,
            tuning: self.config.tuning.clone(),
            conn_tasks: self.conn_tasks.clone(),
            stats: self.stats.clone(),
            state: self.state.clone(),
        };
        self.accept_tasks.spawn(accept_loop.run());
        self.listener = Some(listener);
        Ok(())
    }

    /// Stops accepting and waits until every connection has been cleaned up.
    ///
    /// Returns immediately if the server was never started or is already closed.
    pub async fn close(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        set_state(&self.state, ServerState::Draining);

        if let Err(e) = listener.close().await {
            debug!(error = %e, "listener close failed");
        }
        self.accept_tasks.close();
        self.accept_tasks.wait().await;
        info!(
            active_connections = self.conn_tasks.len(),
            "accept loop stopped, draining connections"
        );

        self.conn_tasks.close();
        self.conn_tasks.wait().await;
        set_state(&self.state, ServerState::Stopped);
        info!("KCP server stopped");
    }
}

struct AcceptLoop {
    listener: Arc<dyn Listener>,
    new_agent: AgentFactory,
    tuning: SessionTuning,
    conn_tasks: TaskTracker,
    stats: Arc<ServerStats>,
    state: Arc<Mutex<ServerState>>,
}

impl AcceptLoop {
    async fn run(self) {
        let mut backoff = AcceptBackoff::default();
        loop {
            let session = match self.listener.accept().await {
                Ok(session) => session,
                Err(e) if self.listener.is_temporary(&e) => {
                    let delay = backoff.next_delay();
                    self.stats.record_accept_retry();
                    warn!(error = %e, retry_in = ?delay, "accept error; retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    let mut state = lock_state(&self.state);
                    if *state == ServerState::Listening {
                        error!(error = %e, "accept failed, listener stopped");
                        *state = ServerState::Stopped;
                    } else {
                        debug!(error = %e, "accept loop exiting");
                    }
                    return;
                }
            };
            backoff.reset();
            self.stats.record_accept();

            session.apply_tuning(&self.tuning);
            let peer_addr = session.remote_addr();
            debug!(peer_addr = %peer_addr, "accepted connection");

            let conn = Arc::new(Connection::new(session));
            let agent = match catch_unwind(AssertUnwindSafe(|| (self.new_agent)(conn.clone()))) {
                Ok(agent) => agent,
                Err(payload) => {
                    self.stats.record_agent_panic();
                    error!(
                        peer_addr = %peer_addr,
                        panic = %panic_message(&payload),
                        "agent factory panicked; dropping connection"
                    );
                    conn.destroy().await;
                    continue;
                }
            };
            let span = info_span!("conn", peer_addr = %peer_addr);
            self.conn_tasks
                .spawn(run_agent(conn, agent, self.stats.clone()).instrument(span));
        }
    }
}

fn lock_state(state: &Mutex<ServerState>) -> std::sync::MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn current_state(state: &Mutex<ServerState>) -> ServerState {
    *lock_state(state)
}

fn set_state(state: &Mutex<ServerState>, next: ServerState) {
    *lock_state(state) = next;
}
