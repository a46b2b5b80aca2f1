//! Transport seam consumed by the server.
//!
//! The reliable UDP protocol itself (framing, FEC, retransmission) lives behind
//! these traits. The server only binds a [`Listener`], accepts [`Session`]s and
//! applies [`SessionTuning`] to each of them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::crypt::BlockCrypt;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(test)]
pub(crate) mod testing;

/// Full-duplex byte stream capability.
///
/// Both methods take `&self` so a reader and a writer can be in flight at the
/// same time on one stream.
#[async_trait]
pub trait Duplex: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;
}

/// One established, ordered, deadline-aware channel produced by a [`Listener`].
#[async_trait]
pub trait Session: Duplex {
    async fn close(&self) -> io::Result<()>;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Sets both the read and the write deadline. `None` disables the timeout.
    fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    /// Applies per-session protocol knobs right after accept.
    fn apply_tuning(&self, tuning: &SessionTuning);
}

/// A bound listener that yields incoming sessions.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> io::Result<Box<dyn Session>>;

    /// Stops the listener. A pending or future `accept` must fail with an
    /// error that [`Listener::is_temporary`] reports as fatal.
    async fn close(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Classifies an accept error. Temporary errors are retried with backoff.
    fn is_temporary(&self, err: &io::Error) -> bool {
        is_temporary_accept_error(err)
    }
}

/// Factory for listeners.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn listen(&self, addr: &str, options: ListenOptions) -> io::Result<Box<dyn Listener>>;
}

/// Options consumed once, when the listener is bound.
#[derive(Clone, Default)]
pub struct ListenOptions {
    /// Packet encryption. `None` runs the listener unencrypted.
    pub crypt: Option<Arc<dyn BlockCrypt>>,
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl std::fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenOptions")
            .field("encrypted", &self.crypt.is_some())
            .field("data_shards", &self.data_shards)
            .field("parity_shards", &self.parity_shards)
            .finish()
    }
}

/// Per-session protocol knobs applied by the accept loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTuning {
    /// Maximum packet payload size in bytes.
    pub mtu: usize,
    pub nodelay: bool,
    /// Internal update/retransmit interval.
    #[serde(with = "crate::config::duration_serde")]
    pub interval: Duration,
    /// Fast-resend threshold (duplicate ACKs before resend). 0 disables it.
    pub resend: u32,
    /// Disables congestion control when set.
    pub no_congestion: bool,
    pub data_shards: usize,
    pub parity_shards: usize,
    /// Send ACKs immediately instead of batching them.
    pub ack_nodelay: bool,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            mtu: 1350,
            nodelay: true,
            interval: Duration::from_millis(10),
            resend: 2,
            no_congestion: true,
            data_shards: 10,
            parity_shards: 3,
            ack_nodelay: true,
        }
    }
}

impl SessionTuning {
    /// Listener-level options derived from these knobs.
    pub fn listen_options(&self, crypt: Option<Arc<dyn BlockCrypt>>) -> ListenOptions {
        ListenOptions {
            crypt,
            data_shards: self.data_shards,
            parity_shards: self.parity_shards,
        }
    }
}

/// Returns `true` for accept errors that are transient and should be retried.
pub fn is_temporary_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::OutOfMemory
    )
}
