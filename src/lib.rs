//! Connection lifecycle front-end for KCP-style reliable UDP transports.
//!
//! A [`KcpServer`] binds a transport listener, wraps every accepted session in
//! a [`Connection`], hands it to a caller-supplied [`Agent`] and, on close,
//! waits for every agent to finish and clean up.

pub mod agent;
pub mod config;
pub mod conn;
pub mod crypt;
pub mod server;
pub mod telemetry;
pub mod transport;

pub use agent::{Agent, AgentFactory};
pub use config::{ConfigError, FileConfig, ServerConfig};
pub use conn::Connection;
pub use crypt::{BlockCrypt, CipherKind, CryptError, KdfConfig, KdfDigest, SecurityConfig};
pub use server::{KcpServer, ServerError, ServerState};
pub use telemetry::StatsSnapshot;
pub use transport::{Duplex, ListenOptions, Listener, Session, SessionTuning, Transport};
