//! Session double for unit tests.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Duplex, Session, SessionTuning};

#[derive(Default)]
pub(crate) struct SessionProbe {
    pub writes: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub closes: AtomicUsize,
    pub read_deadline: Mutex<Option<Instant>>,
    pub write_deadline: Mutex<Option<Instant>>,
    pub tuning: Mutex<Option<SessionTuning>>,
}

/// Records every call and holds each write for `write_delay`.
pub(crate) struct RecordingSession {
    pub probe: Arc<SessionProbe>,
    write_delay: Duration,
    fail_close: bool,
    stall_writes: bool,
    closed: CancellationToken,
}

impl RecordingSession {
    pub fn new(write_delay: Duration) -> (Self, Arc<SessionProbe>) {
        let probe = Arc::new(SessionProbe::default());
        let session = Self {
            probe: probe.clone(),
            write_delay,
            fail_close: false,
            stall_writes: false,
            closed: CancellationToken::new(),
        };
        (session, probe)
    }

    pub fn failing_close() -> (Self, Arc<SessionProbe>) {
        let (mut session, probe) = Self::new(Duration::ZERO);
        session.fail_close = true;
        (session, probe)
    }

    /// Writes never complete until the session is closed, then fail.
    pub fn stalled_writes() -> (Self, Arc<SessionProbe>) {
        let (mut session, probe) = Self::new(Duration::ZERO);
        session.stall_writes = true;
        (session, probe)
    }
}

#[async_trait]
impl Duplex for RecordingSession {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(4);
        buf[..n].copy_from_slice(&b"pong"[..n]);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.stall_writes {
            self.closed.cancelled().await;
            self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
        }
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.probe.writes.fetch_add(1, Ordering::SeqCst);
        self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(buf.len())
    }
}

#[async_trait]
impl Session for RecordingSession {
    async fn close(&self) -> io::Result<()> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        if self.fail_close {
            return Err(io::Error::new(io::ErrorKind::Other, "close failed"));
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    fn remote_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5000))
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        *self.probe.read_deadline.lock().unwrap() = deadline;
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        *self.probe.write_deadline.lock().unwrap() = deadline;
        Ok(())
    }

    fn apply_tuning(&self, tuning: &SessionTuning) {
        *self.probe.tuning.lock().unwrap() = Some(tuning.clone());
    }
}
