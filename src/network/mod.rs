//! Network module - Handles TCP communication between peers
//!
//! Provides:
//! - Server for accepting incoming connections
//! - Client for discovering and connecting to servers
//! - Connection management, control protocol and back-channels

mod server;
mod client;
mod connection;
mod registry;

pub use server::*;
pub use client::*;
pub use connection::*;
pub use registry::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::protocol::{CodecKind, Envelope, MAX_FRAME_SIZE};

/// Configuration for network operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Port to listen on (0 = any available)
    #[serde(default)]
    pub port: u16,
    /// Bound on TCP connect plus handshake, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Maximum frame size
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Whether servers honour open-back-channel requests
    #[serde(default = "default_true")]
    pub accept_back_channels: bool,
    /// Envelope codec
    #[serde(default)]
    pub codec: CodecKind,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: 0,
            connect_timeout_ms: default_connect_timeout(),
            max_frame_size: default_max_frame_size(),
            accept_back_channels: true,
            codec: CodecKind::default(),
        }
    }
}

impl NetworkConfig {
    /// Bind to `addr` instead of all interfaces
    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn without_back_channels(mut self) -> Self {
        self.accept_back_channels = false;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// Notifications raised by connections, servers and clients
///
/// Per connection the order is `Connected` (or `BackChannelReady` for the
/// server's end of a back-channel), zero or more `Error`, then at most one
/// `Disconnected`.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake completed
    Connected(Arc<Connection>),
    /// Connection closed, gracefully or not
    Disconnected(Arc<Connection>),
    /// Peer reported an error, or the connection failed
    Error {
        connection: Arc<Connection>,
        reason: String,
    },
    /// A back-channel for `connection` is usable
    BackChannelReady {
        connection: Arc<Connection>,
        back_channel: Arc<Connection>,
    },
}

pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Application message handler driven by a [`Server`]'s serve loop
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one application envelope; a returned envelope is sent back
    async fn handle(&self, connection: &Arc<Connection>, envelope: Envelope) -> Option<Envelope>;
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
