//! Echo server over the in-memory transport.
//!
//! Starts a server whose agents echo every byte back, drives a handful of
//! clients through it, then shuts the server down gracefully.
//!
//! To run:
//! cargo run --example echo -- [--config path/to/server.json] [--clients 4]

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kcp_gate::crypt::new_block_crypt;
use kcp_gate::transport::memory::MemoryNetwork;
use kcp_gate::{Agent, Connection, Duplex, FileConfig, KcpServer, ServerConfig, Session};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct EchoAgent {
    conn: Arc<Connection>,
}

#[async_trait]
impl Agent for EchoAgent {
    async fn run(&mut self) {
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match self.conn.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "read failed");
                    return;
                }
            };
            if let Err(e) = self.conn.write(&buf[..n]).await {
                warn!(error = %e, "write failed");
                return;
            }
        }
    }

    async fn on_close(&mut self) {
        info!(peer_addr = %self.conn.remote_addr(), "echo session closed");
    }
}

struct Args {
    config: Option<PathBuf>,
    clients: usize,
}

fn parse_args() -> Result<Args, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();
    let config = pargs.opt_value_from_str(["-c", "--config"])?;
    let clients = pargs.opt_value_from_str("--clients")?.unwrap_or(4);
    Ok(Args { config, clients })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = parse_args()?;
    let mut config = match &args.config {
        Some(path) => ServerConfig::load_from_file(path)?,
        None => ServerConfig::with_listen_addr("127.0.0.1:0"),
    };
    if config.listen_addr.starts_with("0.0.0.0") {
        config.listen_addr = "127.0.0.1:0".to_string();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(config.log_level_as_tracing().into())
                .from_env_lossy(),
        )
        .init();

    let network = MemoryNetwork::new();
    let client_crypt = new_block_crypt(&config.security)?;
    let mut server = KcpServer::new(config, Arc::new(network.clone()))
        .with_agent_factory(|conn| EchoAgent { conn });
    server.start().await?;
    let addr = server
        .local_addr()
        .ok_or("server did not report a local address")?;

    let mut clients = Vec::with_capacity(args.clients);
    for id in 0..args.clients {
        let network = network.clone();
        let crypt = client_crypt.clone();
        clients.push(tokio::spawn(async move {
            let session = network.dial(addr, crypt).await?;
            let message = format!("hello from client {}", id);
            session.write(message.as_bytes()).await?;

            let mut reply = Vec::new();
            let mut buf = [0u8; 256];
            while reply.len() < message.len() {
                let n = session.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                reply.extend_from_slice(&buf[..n]);
            }
            session.close().await?;
            Ok::<_, std::io::Error>(String::from_utf8_lossy(&reply).into_owned())
        }));
    }

    for client in clients {
        let reply = client.await??;
        info!(%reply, "client received echo");
    }

    server.close().await;
    let stats = server.stats();
    info!(
        accepted = stats.accepted,
        agent_panics = stats.agent_panics,
        "server drained"
    );
    Ok(())
}
