//! PeerLink Client
//!
//! Finds a server through discovery, connects to it and can ask it to open
//! a back-channel so the server may push messages unprompted.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connection::{is_ack, Connection, ConnectionError, ConnectionResult, Role, Wiring};
use super::server::{Server, ServerError};
use super::{ConnectionEvent, EventReceiver, EventSender, NetworkConfig};
use crate::discovery::{find_server, DiscoveryConfig, DiscoveryError};
use crate::protocol::{Codec, Control};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Back-channel listener error: {0}")]
    Listener(#[from] ServerError),

    #[error("Back-channel already open")]
    BackChannelExists,

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Dial `addr` and run the client side of the handshake
///
/// Connect and handshake are each bounded by the configured connect timeout;
/// there is no retry.
pub(crate) async fn connect(
    addr: SocketAddr,
    wiring: Wiring,
) -> ConnectionResult<Arc<Connection>> {
    let timeout = wiring.config.connect_timeout();

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ConnectionError::from(e)),
        Err(_) => return Err(ConnectionError::Timeout),
    };
    let _ = stream.set_nodelay(true);

    let conn = Connection::new(stream, wiring)?;
    match tokio::time::timeout(timeout, conn.handshake_client()).await {
        Ok(Ok(())) => Ok(conn),
        Ok(Err(e)) => {
            conn.abort().await;
            Err(e)
        }
        Err(_) => {
            conn.abort().await;
            Err(ConnectionError::Timeout)
        }
    }
}

/// PeerLink Client
pub struct Client {
    /// Display name sent in the connect handshake
    name: String,
    /// Client configuration
    config: NetworkConfig,
    /// Discovery settings
    discovery: DiscoveryConfig,
    /// Envelope codec
    codec: Arc<dyn Codec>,
    /// Event sender
    event_tx: EventSender,
    /// Event receiver (for consumers)
    event_rx: Option<EventReceiver>,
}

impl Client {
    /// Create a new client
    pub fn new(name: impl Into<String>, config: NetworkConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let codec = config.codec.build();

        Self {
            name: name.into(),
            config,
            discovery: DiscoveryConfig::default(),
            codec,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn with_discovery_config(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<EventReceiver> {
        self.event_rx.take()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect to a server by address
    pub async fn connect(&self, server_addr: SocketAddr) -> ClientResult<Arc<Connection>> {
        tracing::info!("Connecting to {} as '{}'", server_addr, self.name);

        let wiring = Wiring {
            role: Role::Client,
            local_name: self.name.clone(),
            config: self.config.clone(),
            codec: self.codec.clone(),
            events: Some(self.event_tx.clone()),
            registry: None,
            is_back_channel: false,
        };

        let conn = connect(server_addr, wiring).await?;
        conn.announce();
        Ok(conn)
    }

    /// Connect to a server by hostname
    pub async fn connect_hostname(
        &self,
        hostname: &str,
        port: u16,
    ) -> ClientResult<Arc<Connection>> {
        let addr = super::resolve_host(hostname, port).await?;
        self.connect(addr).await
    }

    /// Find the TCP endpoint of the server advertising `service_name`
    pub async fn discover(
        &self,
        service_name: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<SocketAddr> {
        Ok(find_server(&self.discovery, service_name, cancel).await?)
    }

    /// Discover `service_name` and connect to it
    pub async fn discover_and_connect(
        &self,
        service_name: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<Arc<Connection>> {
        let addr = self.discover(service_name, cancel).await?;
        self.connect(addr).await
    }

    /// Ask the server behind `conn` to connect back to us
    ///
    /// Opens a private listener on the interface `conn` uses, advertises its
    /// port, and returns the accepted back-channel once the server acks.
    pub async fn open_back_channel(&self, conn: &Arc<Connection>) -> ClientResult<Arc<Connection>> {
        if conn.back_channel().is_some() {
            return Err(ClientError::BackChannelExists);
        }

        let local_ip = conn.local_addr().ip();
        let listener_config = NetworkConfig {
            port: 0,
            ..self.config.clone()
        }
        .with_bind_address(local_ip);

        let (listener_tx, mut listener_events) = mpsc::unbounded_channel();
        let mut listener = Server::new(self.name.clone(), listener_config)
            .with_codec(self.codec.clone())
            .with_event_sender(listener_tx);
        let port = listener.start_private().await?.port();

        let request = Control::OpenBackChannel {
            name: local_ip.to_string(),
            port,
        }
        .into_envelope(&self.name);

        let reply = match conn.send_receive(request).await {
            Ok(reply) => reply,
            Err(e) => {
                let _ = listener.stop().await;
                return Err(e.into());
            }
        };
        if !is_ack(&reply) {
            let _ = listener.stop().await;
            return Err(ConnectionError::ProtocolViolation(format!(
                "Expected ack to open-back-channel, got {}",
                reply.id
            ))
            .into());
        }

        // The server dials and handshakes before it acks
        let wait = async {
            while let Some(event) = listener_events.recv().await {
                if let ConnectionEvent::Connected(back_channel) = event {
                    return Some(back_channel);
                }
            }
            None
        };
        let waited = tokio::time::timeout(self.config.connect_timeout(), wait).await;
        let back_channel = match waited {
            Ok(Some(back_channel)) => back_channel,
            _ => {
                // Stopping closes anything the listener registered meanwhile
                let _ = listener.stop().await;
                while let Ok(event) = listener_events.try_recv() {
                    if let ConnectionEvent::Connected(late) = event {
                        late.close().await;
                    }
                }
                return Err(ClientError::Timeout);
            }
        };

        if let Err(e) = conn.attach_back_channel(back_channel.clone()) {
            back_channel.close().await;
            let _ = listener.stop().await;
            return Err(e.into());
        }

        // Later back-channel events go to the client's own receiver
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = listener_events.recv().await {
                let _ = event_tx.send(event);
            }
        });

        tracing::info!("Back-channel from {} ready", back_channel.remote_addr());
        Ok(back_channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BincodeCodec, FrameTransport};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_client_creation() {
        let mut client = Client::new("test-client", NetworkConfig::default());
        assert_eq!(client.name(), "test-client");
        assert!(client.take_event_receiver().is_some());
        assert!(client.take_event_receiver().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let client = Client::new("c1", NetworkConfig::default());
        assert!(matches!(
            client.connect(addr).await,
            Err(ClientError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // Accepts TCP but never answers the connect
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            drop(stream);
        });

        let config = NetworkConfig {
            connect_timeout_ms: 200,
            ..NetworkConfig::default().with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        };
        let client = Client::new("c1", config);
        assert!(matches!(
            client.connect(addr).await,
            Err(ClientError::Connection(ConnectionError::Timeout))
        ));
        hold.abort();
    }

    #[tokio::test]
    async fn test_unanswered_back_channel_releases_listener() {
        // Acks open-back-channel but never dials the advertised port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let fake = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = FrameTransport::new(stream);
            let codec = BincodeCodec;

            transport.read_frame().await.unwrap();
            let ack = codec.encode(&Control::Ack.into_envelope("fake")).unwrap();
            transport.write_frame(&ack).await.unwrap();

            let request = codec.decode(&transport.read_frame().await.unwrap()).unwrap();
            let port = match Control::from_envelope(&request).unwrap() {
                Control::OpenBackChannel { port, .. } => port,
                other => panic!("unexpected {:?}", other),
            };
            transport.write_frame(&ack).await.unwrap();
            (transport, port)
        });

        let config = NetworkConfig {
            connect_timeout_ms: 200,
            ..NetworkConfig::default().with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        };
        let client = Client::new("c1", config);
        let conn = client.connect(addr).await.unwrap();

        assert!(matches!(
            client.open_back_channel(&conn).await,
            Err(ClientError::Timeout)
        ));
        assert!(conn.back_channel().is_none());

        let (_transport, port) = fake.await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
