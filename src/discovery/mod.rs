//! Service discovery module
//!
//! UDP discovery of PeerLink servers on the local network. A server runs a
//! [`Responder`] that listens on a multicast group; clients call
//! [`find_server`] which multicasts the service name and waits for a unicast
//! reply carrying the server's TCP endpoint as `"address:port"`.

use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    decode_prefixed, encode_prefixed, FrameError, DEFAULT_MULTICAST_ADDR, DEFAULT_MULTICAST_PORT,
    LENGTH_PREFIX_SIZE,
};

/// Largest discovery datagram we send or accept
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Largest string a datagram can carry after its length prefix
pub const MAX_DATAGRAM_PAYLOAD: usize = MAX_DATAGRAM_SIZE - LENGTH_PREFIX_SIZE;

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed datagram: {0}")]
    Malformed(String),

    #[error("No reply after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("Server not found")]
    NotFound,

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,
}

impl From<FrameError> for DiscoveryError {
    fn from(e: FrameError) -> Self {
        DiscoveryError::Malformed(e.to_string())
    }
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Discovery settings shared by responders and searchers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Multicast group (a unicast address is used as a plain target)
    #[serde(default = "default_multicast_address")]
    pub multicast_address: Ipv4Addr,
    /// Port the responder listens on
    #[serde(default = "default_multicast_port")]
    pub multicast_port: u16,
    /// How long each search attempt waits for a reply
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
    /// Give up after this many attempts (retry until cancelled if unset)
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Multicast TTL for requests
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

fn default_multicast_address() -> Ipv4Addr {
    DEFAULT_MULTICAST_ADDR
}

fn default_multicast_port() -> u16 {
    DEFAULT_MULTICAST_PORT
}

fn default_reply_timeout() -> u64 {
    5000
}

fn default_ttl() -> u32 {
    1
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_address: default_multicast_address(),
            multicast_port: default_multicast_port(),
            reply_timeout_ms: default_reply_timeout(),
            max_attempts: None,
            ttl: default_ttl(),
        }
    }
}

impl DiscoveryConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Where requests are sent
    pub fn target(&self) -> SocketAddr {
        SocketAddr::from((self.multicast_address, self.multicast_port))
    }
}

/// Build a request datagram for `service_name`
pub fn encode_request(service_name: &str) -> DiscoveryResult<Vec<u8>> {
    Ok(encode_prefixed(service_name.as_bytes(), MAX_DATAGRAM_PAYLOAD)?.to_vec())
}

/// Extract the service name from a request datagram
pub fn decode_request(datagram: &[u8]) -> DiscoveryResult<String> {
    decode_string(datagram)
}

/// Build a response datagram advertising `endpoint`
pub fn encode_response(endpoint: SocketAddr) -> DiscoveryResult<Vec<u8>> {
    Ok(encode_prefixed(endpoint.to_string().as_bytes(), MAX_DATAGRAM_PAYLOAD)?.to_vec())
}

/// Parse a response datagram received from `source`
///
/// An unspecified advertised address (the server listens on all interfaces)
/// is replaced with the address the reply came from.
pub fn decode_response(datagram: &[u8], source: SocketAddr) -> DiscoveryResult<SocketAddr> {
    let text = decode_string(datagram)?;
    let endpoint: SocketAddr = text
        .parse()
        .map_err(|_| DiscoveryError::Malformed(format!("Invalid endpoint: {}", text)))?;

    if endpoint.ip().is_unspecified() {
        Ok(SocketAddr::new(source.ip(), endpoint.port()))
    } else {
        Ok(endpoint)
    }
}

fn decode_string(datagram: &[u8]) -> DiscoveryResult<String> {
    let body = decode_prefixed(datagram, MAX_DATAGRAM_PAYLOAD)?;
    String::from_utf8(body.to_vec())
        .map_err(|_| DiscoveryError::Malformed("Payload is not UTF-8".to_string()))
}

/// Server-side discovery responder
pub struct Responder {
    /// Discovery settings
    config: DiscoveryConfig,
    /// Name we answer to
    service_name: String,
    /// TCP endpoint we advertise
    advertised: SocketAddr,
    /// Bound UDP address (once started)
    local_addr: Option<SocketAddr>,
    /// Whether the responder is running
    running: Arc<RwLock<bool>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl Responder {
    pub fn new(
        config: DiscoveryConfig,
        service_name: impl Into<String>,
        advertised: SocketAddr,
    ) -> Self {
        Self {
            config,
            service_name: service_name.into(),
            advertised,
            local_addr: None,
            running: Arc::new(RwLock::new(false)),
            shutdown_tx: None,
        }
    }

    /// Bind the discovery port and start answering requests
    pub async fn start(&mut self) -> DiscoveryResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(DiscoveryError::AlreadyRunning);
            }
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.multicast_port)).await?;
        if self.config.multicast_address.is_multicast() {
            socket.join_multicast_v4(self.config.multicast_address, Ipv4Addr::UNSPECIFIED)?;
        }
        let local_addr = socket.local_addr()?;
        self.local_addr = Some(local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let service_name = self.service_name.clone();
        let running = self.running.clone();
        let response = encode_response(self.advertised)?;

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((n, src)) => {
                                answer(&socket, &buf[..n], src, &service_name, &response).await;
                            }
                            Err(e) => {
                                tracing::warn!("Discovery receive error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            tracing::info!("Discovery responder for '{}' stopped", service_name);
        });

        tracing::info!(
            "Discovery responder for '{}' on {} advertising {}",
            self.service_name,
            local_addr,
            self.advertised
        );
        Ok(local_addr)
    }

    /// Stop answering requests
    pub async fn stop(&mut self) -> DiscoveryResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(DiscoveryError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        Ok(())
    }

    /// Bound UDP address, if started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn answer(
    socket: &UdpSocket,
    datagram: &[u8],
    src: SocketAddr,
    service_name: &str,
    response: &[u8],
) {
    match decode_request(datagram) {
        Ok(requested) if requested == service_name => {
            tracing::debug!("Discovery request for '{}' from {}", requested, src);
            if let Err(e) = socket.send_to(response, src).await {
                tracing::warn!("Discovery reply to {} failed: {}", src, e);
            }
        }
        Ok(requested) => {
            tracing::debug!("Ignoring discovery request for '{}' from {}", requested, src);
        }
        Err(e) => {
            tracing::debug!("Ignoring datagram from {}: {}", src, e);
        }
    }
}

/// Search for a server advertising `service_name`
///
/// Each attempt sends one request and waits `reply_timeout` for an answer.
/// Attempts repeat until a reply arrives, `max_attempts` is exhausted, or
/// `cancel` fires (reported as [`DiscoveryError::NotFound`]).
pub async fn find_server(
    config: &DiscoveryConfig,
    service_name: &str,
    cancel: &CancellationToken,
) -> DiscoveryResult<SocketAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let target = config.target();
    if let IpAddr::V4(group) = target.ip() {
        if group.is_multicast() {
            socket.set_multicast_ttl_v4(config.ttl)?;
        }
    }

    let request = encode_request(service_name)?;
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut attempts = 0u32;

    loop {
        if let Some(max) = config.max_attempts {
            if attempts >= max {
                return Err(DiscoveryError::Timeout { attempts });
            }
        }
        attempts += 1;

        tracing::debug!("Discovery attempt {} for '{}' via {}", attempts, service_name, target);
        if let Err(e) = socket.send_to(&request, target).await {
            tracing::warn!("Discovery request to {} failed: {}", target, e);
        }

        let deadline = Instant::now() + config.reply_timeout();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(DiscoveryError::NotFound);
                }
                result = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)) => {
                    match result {
                        Ok(Ok((n, src))) => match decode_response(&buf[..n], src) {
                            Ok(endpoint) => {
                                tracing::info!("Discovered '{}' at {}", service_name, endpoint);
                                return Ok(endpoint);
                            }
                            Err(e) => {
                                tracing::warn!("Bad discovery reply from {}: {}", src, e);
                            }
                        },
                        Ok(Err(e)) => {
                            tracing::warn!("Discovery receive error: {}", e);
                            tokio::select! {
                                _ = cancel.cancelled() => return Err(DiscoveryError::NotFound),
                                _ = tokio::time::sleep_until(deadline) => break,
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    }
}
