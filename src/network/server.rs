//! PeerLink Server
//!
//! The server accepts connections, runs the discovery responder and keeps a
//! registry of connected clients. Without discovery it becomes a private
//! listener that accepts exactly one connection, which is how clients
//! receive back-channels.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use super::client::connect;
use super::connection::{Connection, ConnectionError, ConnectionResult, Role, Wiring};
use super::registry::Registry;
use super::{EventReceiver, EventSender, Handler, NetworkConfig};
use crate::discovery::{DiscoveryConfig, DiscoveryError, Responder};
use crate::protocol::Codec;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// State shared with the accept loop and connection tasks
struct Shared {
    name: String,
    config: NetworkConfig,
    codec: Arc<dyn Codec>,
    registry: Arc<Registry>,
    handler: Option<Arc<dyn Handler>>,
    event_tx: EventSender,
    private: bool,
}

/// PeerLink Server
pub struct Server {
    /// Display name sent to clients in acks
    name: String,
    /// Server configuration
    config: NetworkConfig,
    /// Discovery settings
    discovery: DiscoveryConfig,
    /// Envelope codec
    codec: Arc<dyn Codec>,
    /// Application handler (serve loop runs only when set)
    handler: Option<Arc<dyn Handler>>,
    /// Connected clients
    registry: Arc<Registry>,
    /// Event sender
    event_tx: EventSender,
    /// Event receiver (for consumers)
    event_rx: Option<EventReceiver>,
    /// Discovery responder (discovery-enabled servers only)
    responder: Option<Responder>,
    /// Bound listen address
    local_addr: Option<SocketAddr>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the accept loop is running
    running: Arc<RwLock<bool>>,
}

impl Server {
    /// Create a new server
    pub fn new(name: impl Into<String>, config: NetworkConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let codec = config.codec.build();

        Self {
            name: name.into(),
            config,
            discovery: DiscoveryConfig::default(),
            codec,
            handler: None,
            registry: Arc::new(Registry::new()),
            event_tx,
            event_rx: Some(event_rx),
            responder: None,
            local_addr: None,
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn with_discovery_config(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_handler(mut self, handler: impl Handler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Deliver events to `event_tx` instead of the server's own receiver
    pub fn with_event_sender(mut self, event_tx: EventSender) -> Self {
        self.event_tx = event_tx;
        self.event_rx = None;
        self
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<EventReceiver> {
        self.event_rx.take()
    }

    /// Start listening and answer discovery requests for `service_name`
    pub async fn start(&mut self, service_name: &str) -> ServerResult<SocketAddr> {
        self.start_listening(Some(service_name)).await
    }

    /// Start a discovery-less listener that accepts a single connection
    pub async fn start_private(&mut self) -> ServerResult<SocketAddr> {
        self.start_listening(None).await
    }

    async fn start_listening(&mut self, service_name: Option<&str>) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        tracing::info!("Server '{}' listening on {}", self.name, local_addr);

        if let Some(service_name) = service_name {
            let mut responder = Responder::new(self.discovery.clone(), service_name, local_addr);
            responder.start().await?;
            self.responder = Some(responder);
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let private = service_name.is_none();
        let shared = Arc::new(Shared {
            name: self.name.clone(),
            config: NetworkConfig {
                accept_back_channels: self.config.accept_back_channels && !private,
                ..self.config.clone()
            },
            codec: self.codec.clone(),
            registry: self.registry.clone(),
            handler: self.handler.clone(),
            event_tx: self.event_tx.clone(),
            private,
        });
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);

                                let shared = shared.clone();
                                tokio::spawn(async move {
                                    handle_client(stream, shared).await;
                                });

                                if private {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;
        });

        Ok(local_addr)
    }

    /// Stop accepting, stop discovery and close every client
    pub async fn stop(&mut self) -> ServerResult<()> {
        if self.local_addr.is_none() {
            return Err(ServerError::NotRunning);
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        if let Some(mut responder) = self.responder.take() {
            if let Err(e) = responder.stop().await {
                tracing::warn!("Discovery responder stop failed: {}", e);
            }
        }

        for connection in self.registry.drain().await {
            if let Some(back_channel) = connection.back_channel() {
                back_channel.close().await;
            }
            connection.close().await;
        }

        tracing::info!("Server '{}' stopped", self.name);
        Ok(())
    }

    /// Close and forget one client; safe to call more than once
    pub async fn remove_client(&self, connection: &Connection) {
        connection.close().await;
        self.registry.remove(&connection.id()).await;
    }

    /// Get a list of connected clients
    pub async fn clients(&self) -> Vec<Arc<Connection>> {
        self.registry.connections().await
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bound listen address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bound discovery address, if discovery is enabled
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.responder.as_ref().and_then(Responder::local_addr)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the accept loop is still accepting
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Handshake, register and (with a handler) serve one accepted socket
async fn handle_client(stream: TcpStream, shared: Arc<Shared>) {
    let _ = stream.set_nodelay(true);
    let wiring = Wiring {
        role: Role::Server,
        local_name: shared.name.clone(),
        config: shared.config.clone(),
        codec: shared.codec.clone(),
        events: Some(shared.event_tx.clone()),
        registry: Some(Arc::downgrade(&shared.registry)),
        is_back_channel: shared.private,
    };

    let conn = match Connection::new(stream, wiring) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!("Failed to set up connection: {}", e);
            return;
        }
    };

    match tokio::time::timeout(shared.config.connect_timeout(), conn.accept_handshake()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!("Handshake with {} failed: {}", conn.remote_addr(), e);
            conn.abort().await;
            return;
        }
        Err(_) => {
            tracing::warn!("Handshake with {} timed out", conn.remote_addr());
            conn.abort().await;
            return;
        }
    }

    shared.registry.insert(conn.clone()).await;
    conn.announce();

    if let Some(handler) = shared.handler.clone() {
        serve(conn, handler).await;
    }
}

/// Feed application envelopes to `handler` until the connection ends
async fn serve(conn: Arc<Connection>, handler: Arc<dyn Handler>) {
    loop {
        match conn.receive().await {
            Ok(Some(envelope)) => {
                if let Some(reply) = handler.handle(&conn, envelope).await {
                    if let Err(e) = conn.send(reply).await {
                        tracing::debug!("Reply to {} failed: {}", conn.remote_addr(), e);
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Serve loop for {} ended: {}", conn.remote_addr(), e);
                break;
            }
        }
    }
}

/// Dial the back-channel `requesting` asked for and attach it
///
/// The target is the address `requesting` came from, at the advertised port.
pub(crate) async fn open_back_channel(
    requesting: &Arc<Connection>,
    port: u16,
) -> ConnectionResult<Arc<Connection>> {
    if requesting.back_channel().is_some() {
        return Err(ConnectionError::BackChannelRefused(
            "Back-channel already open".to_string(),
        ));
    }

    let target = SocketAddr::new(requesting.remote_addr().ip(), port);
    let back_channel = connect(target, requesting.back_channel_wiring()).await?;

    if let Err(e) = requesting.attach_back_channel(back_channel.clone()) {
        back_channel.close().await;
        return Err(e);
    }

    tracing::info!("Back-channel to {} open", target);
    Ok(back_channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConnectionEvent;
    use crate::protocol::{control_ids, BincodeCodec, Codec, Envelope, FrameTransport};
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback() -> NetworkConfig {
        NetworkConfig::default().with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new("test-host", NetworkConfig::default());
        assert!(!server.is_running().await);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let mut server = Server::new("test-host", NetworkConfig::default());
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_wrong_first_message_is_not_registered() {
        let mut server = Server::new("srv", loopback());
        let mut events = server.take_event_receiver().unwrap();
        let addr = server.start_private().await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut transport = FrameTransport::new(stream);
        let codec = BincodeCodec;
        let hello = codec.encode(&Envelope::empty("ping", "rogue")).unwrap();
        transport.write_frame(&hello).await.unwrap();

        let reply = codec.decode(&transport.read_frame().await.unwrap()).unwrap();
        assert_eq!(reply.id, control_ids::ERROR);
        assert!(transport.read_frame().await.is_err());

        assert!(server.registry().is_empty().await);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_private_listener_accepts_once() {
        let mut server = Server::new("srv", loopback());
        let mut events = server.take_event_receiver().unwrap();
        let addr = server.start_private().await.unwrap();

        let wiring = Wiring {
            role: Role::Client,
            local_name: "cli".to_string(),
            config: loopback(),
            codec: Arc::new(BincodeCodec),
            events: None,
            registry: None,
            is_back_channel: false,
        };
        let conn = connect(addr, wiring.clone()).await.unwrap();

        match events.recv().await {
            Some(ConnectionEvent::Connected(accepted)) => {
                assert!(accepted.is_back_channel());
                assert_eq!(accepted.peer_name().await, "cli");
            }
            other => panic!("unexpected {:?}", other),
        }

        // The listener is gone after the first connection
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!server.is_running().await);
        assert!(connect(addr, wiring).await.is_err());

        conn.close().await;
    }
}
