//! Shared agents and transport doubles for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kcp_gate::{Agent, Connection, Duplex, ListenOptions, Listener, Session, SessionTuning, Transport};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Echoes everything back until the peer closes.
pub struct EchoAgent {
    pub conn: Arc<Connection>,
    pub closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for EchoAgent {
    async fn run(&mut self) {
        let mut buf = vec![0u8; 2048];
        loop {
            match self.conn.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if self.conn.write(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn on_close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sleeps in `run`, then records that both phases completed.
pub struct SleepyAgent {
    pub conn: Arc<Connection>,
    pub nap: Duration,
    pub finished_runs: Arc<AtomicUsize>,
    pub cleanups: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for SleepyAgent {
    async fn run(&mut self) {
        tokio::time::sleep(self.nap).await;
        self.finished_runs.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_close(&mut self) {
        assert!(self.conn.is_closed().await, "on_close before connection close");
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Panics in `run`.
pub struct PanickingAgent {
    pub cleanups: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for PanickingAgent {
    async fn run(&mut self) {
        panic!("agent failure");
    }

    async fn on_close(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Session that swallows writes, returns EOF on read and records tuning.
pub struct NullSession {
    pub tuning: Arc<Mutex<Option<SessionTuning>>>,
}

#[async_trait]
impl Duplex for NullSession {
    async fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }
}

#[async_trait]
impl Session for NullSession {
    async fn close(&self) -> io::Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1))
    }

    fn remote_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 2))
    }

    fn set_read_deadline(&self, _deadline: Option<Instant>) -> io::Result<()> {
        Ok(())
    }

    fn set_write_deadline(&self, _deadline: Option<Instant>) -> io::Result<()> {
        Ok(())
    }

    fn apply_tuning(&self, tuning: &SessionTuning) {
        *self.tuning.lock().unwrap() = Some(tuning.clone());
    }
}

/// One scripted accept outcome.
pub enum Step {
    Fail(io::ErrorKind),
    Accept,
}

/// Shared view of what a [`ScriptedListener`] saw.
#[derive(Default)]
pub struct ScriptProbe {
    pub calls: Mutex<Vec<Instant>>,
    pub exhausted: Notify,
    pub tuning: Arc<Mutex<Option<SessionTuning>>>,
}

/// Transport whose listener replays a fixed script of accept results, then
/// blocks until closed.
pub struct ScriptedTransport {
    script: Mutex<Option<VecDeque<Step>>>,
    pub probe: Arc<ScriptProbe>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(Some(script.into())),
            probe: Arc::new(ScriptProbe::default()),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn listen(&self, _addr: &str, _options: ListenOptions) -> io::Result<Box<dyn Listener>> {
        let script = self
            .script
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "already bound"))?;
        Ok(Box::new(ScriptedListener {
            script: Mutex::new(script),
            probe: self.probe.clone(),
            closed: CancellationToken::new(),
        }))
    }
}

pub struct ScriptedListener {
    script: Mutex<VecDeque<Step>>,
    probe: Arc<ScriptProbe>,
    closed: CancellationToken,
}

#[async_trait]
impl Listener for ScriptedListener {
    async fn accept(&self) -> io::Result<Box<dyn Session>> {
        self.probe.calls.lock().unwrap().push(Instant::now());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Fail(kind)) => Err(io::Error::new(kind, "scripted accept failure")),
            Some(Step::Accept) => {
                let session: Box<dyn Session> = Box::new(NullSession {
                    tuning: self.probe.tuning.clone(),
                });
                Ok(session)
            }
            None => {
                self.probe.exhausted.notify_one();
                self.closed.cancelled().await;
                Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
            }
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 29900)))
    }
}

/// Gaps between consecutive accept calls.
pub fn accept_gaps(probe: &ScriptProbe) -> Vec<Duration> {
    let calls = probe.calls.lock().unwrap();
    calls.windows(2).map(|w| w[1] - w[0]).collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
