//! Connection handle wrapped around one accepted session.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::transport::{Duplex, Session};

/// Stream-like handle handed to agents.
///
/// ### Invariants
/// - **Close once**: the first [`Connection::close`] closes the session, later
///   calls return `Ok(())` without touching it.
/// - **Serialized writes**: writers hold the state lock for the whole
///   underlying write, so at most one write reaches the session at a time.
/// - **No write after close**: a write that observes the closed flag returns
///   `Ok(0)` and never reaches the session.
///
/// Reads bypass the lock; the session is full duplex.
pub struct Connection {
    session: Box<dyn Session>,
    closed: Mutex<bool>,
}

impl Connection {
    pub fn new(session: Box<dyn Session>) -> Self {
        Self {
            session,
            closed: Mutex::new(false),
        }
    }

    /// Writes `buf` to the session.
    ///
    /// Returns `Ok(0)` when the handle is closed or `buf` is empty.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let closed = self.closed.lock().await;
        if *closed || buf.is_empty() {
            return Ok(0);
        }
        self.session.write(buf).await
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.session.read(buf).await
    }

    /// Closes the session once. Repeated calls are no-ops.
    pub async fn close(&self) -> io::Result<()> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }
        *closed = true;
        self.session.close().await
    }

    /// Forceful teardown: closes the session even if the handle was already
    /// closed and discards the transport's error.
    ///
    /// The session is closed before the state lock is taken, so a write stuck
    /// in the transport is failed rather than waited on.
    pub async fn destroy(&self) {
        if let Err(e) = self.session.close().await {
            debug!(error = %e, remote_addr = %self.session.remote_addr(), "destroy: session close failed");
        }
        *self.closed.lock().await = true;
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.lock().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.session.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.session.remote_addr()
    }

    /// `None` means I/O operations will not time out.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.session.set_deadline(deadline)
    }

    /// Sets the deadline for future reads. `None` means reads will not time out.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.session.set_read_deadline(deadline)
    }

    /// Sets the deadline for future writes.
    ///
    /// Even if a write times out it may report `n > 0` bytes written.
    /// `None` means writes will not time out.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.session.set_write_deadline(deadline)
    }
}

#[async_trait]
impl Duplex for Connection {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Connection::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Connection::write(self, buf).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.session.local_addr())
            .field("remote_addr", &self.session.remote_addr())
            .finish()
    }
}
