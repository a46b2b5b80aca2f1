//! In-process transport.
//!
//! Listeners register in a [`MemoryNetwork`] keyed by their address and
//! receive dialed sessions through a channel. Each direction of a session is
//! a bounded message channel; packets are at most `mtu` bytes and are sealed
//! with the listener's block crypt when one is configured.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Duplex, ListenOptions, Listener, Session, SessionTuning, Transport};
use crate::crypt::BlockCrypt;

const FIRST_EPHEMERAL_PORT: u16 = 40000;
const INCOMING_QUEUE: usize = 128;
const PACKET_QUEUE: usize = 256;

enum Incoming {
    Dial(SessionParts),
    Fault(io::Error),
}

struct SessionParts {
    local: SocketAddr,
    remote: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

struct NetworkInner {
    listeners: Mutex<HashMap<SocketAddr, mpsc::Sender<Incoming>>>,
    next_port: AtomicU16,
}

/// Registry of in-process listeners. Clones share the same registry.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                listeners: Mutex::new(HashMap::new()),
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            }),
        }
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, mpsc::Sender<Incoming>>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ephemeral(&self, ip: std::net::IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.inner.next_port.fetch_add(1, Ordering::Relaxed))
    }

    fn sender(&self, addr: SocketAddr) -> io::Result<mpsc::Sender<Incoming>> {
        self.listeners().get(&addr).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no listener on {}", addr),
            )
        })
    }

    /// Opens a client session to the listener bound at `addr`.
    ///
    /// `crypt` must match the listener's for the peers to understand each other.
    pub async fn dial(
        &self,
        addr: SocketAddr,
        crypt: Option<Arc<dyn BlockCrypt>>,
    ) -> io::Result<MemorySession> {
        let incoming = self.sender(addr)?;
        let local = self.ephemeral(addr.ip());
        let (client_tx, server_rx) = mpsc::channel(PACKET_QUEUE);
        let (server_tx, client_rx) = mpsc::channel(PACKET_QUEUE);

        let server_side = SessionParts {
            local: addr,
            remote: local,
            tx: server_tx,
            rx: server_rx,
        };
        incoming
            .send(Incoming::Dial(server_side))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;

        Ok(MemorySession::new(
            SessionParts {
                local,
                remote: addr,
                tx: client_tx,
                rx: client_rx,
            },
            crypt,
        ))
    }

    /// Makes the next `accept` on the listener at `addr` fail with `err`.
    pub async fn inject_accept_error(&self, addr: SocketAddr, err: io::Error) -> io::Result<()> {
        self.sender(addr)?
            .send(Incoming::Fault(err))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn listen(&self, addr: &str, options: ListenOptions) -> io::Result<Box<dyn Listener>> {
        let requested: SocketAddr = addr.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid address {:?}: {}", addr, e),
            )
        })?;
        let local = if requested.port() == 0 {
            self.ephemeral(requested.ip())
        } else {
            requested
        };

        let (tx, rx) = mpsc::channel(INCOMING_QUEUE);
        {
            let mut listeners = self.listeners();
            if listeners.contains_key(&local) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} already bound", local),
                ));
            }
            listeners.insert(local, tx);
        }
        debug!(local_addr = %local, ?options, "memory listener bound");

        Ok(Box::new(MemoryListener {
            local,
            network: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
            crypt: options.crypt,
            closed: CancellationToken::new(),
        }))
    }
}

pub struct MemoryListener {
    local: SocketAddr,
    network: MemoryNetwork,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Incoming>>,
    crypt: Option<Arc<dyn BlockCrypt>>,
    closed: CancellationToken,
}

fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> io::Result<Box<dyn Session>> {
        let mut incoming = tokio::select! {
            _ = self.closed.cancelled() => return Err(listener_closed()),
            guard = self.incoming.lock() => guard,
        };
        let next = tokio::select! {
            _ = self.closed.cancelled() => return Err(listener_closed()),
            next = incoming.recv() => next,
        };
        match next {
            Some(Incoming::Dial(parts)) => {
                let session: Box<dyn Session> =
                    Box::new(MemorySession::new(parts, self.crypt.clone()));
                Ok(session)
            }
            Some(Incoming::Fault(err)) => Err(err),
            None => Err(listener_closed()),
        }
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        self.network.listeners().remove(&self.local);
        debug!(local_addr = %self.local, "memory listener closed");
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

#[derive(Default, Clone, Copy)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
}

struct ReadState {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

/// One end of an in-process session.
pub struct MemorySession {
    local: SocketAddr,
    remote: SocketAddr,
    reader: tokio::sync::Mutex<ReadState>,
    writer: tokio::sync::Mutex<Option<mpsc::Sender<Bytes>>>,
    crypt: Option<Arc<dyn BlockCrypt>>,
    deadlines: Mutex<Deadlines>,
    tuning: Mutex<SessionTuning>,
    closed: CancellationToken,
}

impl MemorySession {
    fn new(parts: SessionParts, crypt: Option<Arc<dyn BlockCrypt>>) -> Self {
        Self {
            local: parts.local,
            remote: parts.remote,
            reader: tokio::sync::Mutex::new(ReadState {
                rx: parts.rx,
                pending: Bytes::new(),
            }),
            writer: tokio::sync::Mutex::new(Some(parts.tx)),
            crypt,
            deadlines: Mutex::new(Deadlines::default()),
            tuning: Mutex::new(SessionTuning::default()),
            closed: CancellationToken::new(),
        }
    }

    /// Knobs currently applied to this session.
    pub fn tuning(&self) -> SessionTuning {
        self.tuning
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn deadlines(&self) -> Deadlines {
        *self
            .deadlines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update_deadlines(&self, f: impl FnOnce(&mut Deadlines)) {
        f(&mut self
            .deadlines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()));
    }

    fn seal(&self, chunk: &[u8]) -> io::Result<Bytes> {
        match &self.crypt {
            Some(crypt) => crypt
                .seal(chunk)
                .map(Bytes::from)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
            None => Ok(Bytes::copy_from_slice(chunk)),
        }
    }

    fn open(&self, packet: Bytes) -> io::Result<Bytes> {
        match &self.crypt {
            Some(crypt) => crypt
                .open(&packet)
                .map(Bytes::from)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(packet),
        }
    }

    async fn recv_packet(&self, state: &mut ReadState) -> io::Result<Option<Bytes>> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(io::Error::new(io::ErrorKind::NotConnected, "session closed")),
            packet = state.rx.recv() => packet.map(|p| self.open(p)).transpose(),
        }
    }

    async fn send_packets(&self, tx: &mpsc::Sender<Bytes>, buf: &[u8], written: &mut usize) -> io::Result<()> {
        let mtu = self.tuning().mtu.max(1);
        for chunk in buf.chunks(mtu) {
            let packet = self.seal(chunk)?;
            tokio::select! {
                _ = self.closed.cancelled() => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed")),
                sent = tx.send(packet) => {
                    sent.map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))?;
                }
            }
            *written += chunk.len();
        }
        Ok(())
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")
}

#[async_trait]
impl Duplex for MemorySession {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = self.deadlines().read;
        let read = async {
            let mut state = self.reader.lock().await;
            if state.pending.is_empty() {
                match self.recv_packet(&mut state).await? {
                    Some(packet) => state.pending = packet,
                    None => return Ok(0),
                }
            }
            let n = buf.len().min(state.pending.len());
            buf[..n].copy_from_slice(&state.pending.split_to(n));
            Ok::<_, io::Error>(n)
        };
        match deadline {
            Some(at) => tokio::time::timeout_at(at, read)
                .await
                .unwrap_or_else(|_| Err(timed_out())),
            None => read.await,
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = self.deadlines().write;
        let mut written = 0;
        let write = async {
            let writer = self.writer.lock().await;
            let tx = writer
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "session closed"))?;
            self.send_packets(tx, buf, &mut written).await?;
            Ok::<_, io::Error>(())
        };
        let result = match deadline {
            Some(at) => tokio::time::timeout_at(at, write)
                .await
                .unwrap_or_else(|_| Err(timed_out())),
            None => write.await,
        };
        match result {
            Ok(()) => Ok(written),
            Err(e) if written > 0 && e.kind() == io::ErrorKind::TimedOut => Ok(written),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        // Dropping the sender lets the peer observe EOF.
        self.writer.lock().await.take();
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.update_deadlines(|d| d.read = deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.update_deadlines(|d| d.write = deadline);
        Ok(())
    }

    fn apply_tuning(&self, tuning: &SessionTuning) {
        *self
            .tuning
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = tuning.clone();
    }
}
