//! Connection handling for PeerLink
//!
//! A [`Connection`] owns one TCP stream and serializes every operation on it
//! through a gate: at most one `send`, `receive` or `send_receive` is in
//! flight at a time. Control envelopes (connect, ack, disconnect, error,
//! open-back-channel) are consumed here and never reach the application.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::registry::Registry;
use super::{ConnectionEvent, EventSender, NetworkConfig};
use crate::protocol::{
    control_ids, Codec, CodecError, Control, Envelope, FrameError, FrameTransport, Message,
};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Connection reset by peer")]
    PeerReset,

    #[error("Connection closed by peer")]
    PeerGraceful,

    #[error("Connection timeout")]
    Timeout,

    #[error("Back-channel refused: {0}")]
    BackChannelRefused(String),

    #[error("Rejected by peer: {0}")]
    Rejected(String),

    #[error("Reserved envelope id: {0}")]
    ReservedId(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(io::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        if crate::protocol::is_peer_gone(&e) {
            ConnectionError::PeerReset
        } else if e.kind() == io::ErrorKind::TimedOut {
            ConnectionError::Timeout
        } else {
            ConnectionError::Transport(e)
        }
    }
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::PeerGone => ConnectionError::PeerReset,
            FrameError::Io(e) => ConnectionError::from(e),
            other => ConnectionError::ProtocolViolation(other.to_string()),
        }
    }
}

impl ConnectionError {
    /// Whether the connection cannot be used after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::ProtocolViolation(_)
                | ConnectionError::PeerReset
                | ConnectionError::Timeout
                | ConnectionError::Transport(_)
        )
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// TCP connection established, awaiting handshake
    Connecting = 0,
    /// Handshake complete, ready for communication
    Open = 1,
    /// Connection is closing gracefully
    Closing = 2,
    /// Connection has been closed
    Closed = 3,
    /// Connection failed
    Failed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            3 => ConnectionState::Closed,
            _ => ConnectionState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// Which end of the TCP connect this connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialed out
    Client,
    /// We accepted
    Server,
}

/// Everything a connection needs from whoever creates it
#[derive(Clone)]
pub(crate) struct Wiring {
    pub role: Role,
    pub local_name: String,
    pub config: NetworkConfig,
    pub codec: Arc<dyn Codec>,
    pub events: Option<EventSender>,
    pub registry: Option<Weak<Registry>>,
    pub is_back_channel: bool,
}

/// What `receive` does after a control envelope
enum Flow {
    Continue,
    Closed,
}

/// Fails the connection if dropped before the exchange completes
///
/// A write without its reply, or a control request left unanswered, leaves
/// the stream out of step with the peer; the next caller must not see it.
struct Exchange<'a> {
    conn: &'a Connection,
    done: bool,
}

impl<'a> Exchange<'a> {
    fn begin(conn: &'a Connection) -> Self {
        Self { conn, done: false }
    }

    fn complete(mut self) {
        self.done = true;
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.conn.abandon();
        }
    }
}

type Gate = Option<FrameTransport<TcpStream>>;

/// Represents a connection to a remote PeerLink peer
pub struct Connection {
    /// Registry key
    id: Uuid,
    /// Which side dialed
    role: Role,
    /// Our display name, sent as the envelope sender on control messages
    local_name: String,
    /// Peer display name (learned during handshake)
    peer_name: RwLock<String>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    /// Connection state
    state: AtomicU8,
    /// Send/receive gate; `None` once the socket is released
    gate: Mutex<Gate>,
    codec: Arc<dyn Codec>,
    config: NetworkConfig,
    /// Server-initiated connection back into this peer, set at most once
    back_channel: OnceCell<Arc<Connection>>,
    /// Whether this connection is itself a back-channel
    is_back_channel: bool,
    /// Interrupts an idle `receive` when closing
    shutdown: CancellationToken,
    /// Connected has been raised, so Error/Disconnected may follow
    announced: AtomicBool,
    /// Terminal cleanup ran
    finished: AtomicBool,
    events: Option<EventSender>,
    registry: Option<Weak<Registry>>,
    this: Weak<Connection>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("is_back_channel", &self.is_back_channel)
            .finish()
    }
}

impl Connection {
    /// Wrap an established TCP stream; the connection starts in `Connecting`
    pub(crate) fn new(stream: TcpStream, wiring: Wiring) -> ConnectionResult<Arc<Self>> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let transport = FrameTransport::with_max_frame_size(stream, wiring.config.max_frame_size);

        Ok(Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            role: wiring.role,
            local_name: wiring.local_name,
            peer_name: RwLock::new(String::new()),
            remote_addr,
            local_addr,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            gate: Mutex::new(Some(transport)),
            codec: wiring.codec,
            config: wiring.config,
            back_channel: OnceCell::new(),
            is_back_channel: wiring.is_back_channel,
            shutdown: CancellationToken::new(),
            announced: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            events: wiring.events,
            registry: wiring.registry,
            this: this.clone(),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Our display name
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Peer display name (empty until the handshake completes)
    pub async fn peer_name(&self) -> String {
        self.peer_name.read().await.clone()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Best-effort liveness check; does not take the gate
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The back-channel opened for this connection, if any
    pub fn back_channel(&self) -> Option<Arc<Connection>> {
        self.back_channel.get().cloned()
    }

    pub fn is_back_channel(&self) -> bool {
        self.is_back_channel
    }

    /// Send `envelope` and wait for the next frame as its response
    ///
    /// An error control reply is returned as [`ConnectionError::Rejected`]
    /// (or [`ConnectionError::BackChannelRefused`] for an open-back-channel
    /// request); a disconnect reply closes the connection. Dropping the
    /// future once the request is on the wire fails the connection.
    pub async fn send_receive(&self, envelope: Envelope) -> ConnectionResult<Envelope> {
        check_outgoing(&envelope)?;
        let mut gate = self.gate.lock().await;
        self.ensure_open()?;

        let exchange = Exchange::begin(self);
        let result = self.round_trip(&mut gate, &envelope).await;
        exchange.complete();

        let response = match result {
            Ok(response) => response,
            Err(e) => return Err(self.fail_with(&mut gate, e).await),
        };

        if !response.is_control() {
            return Ok(response);
        }

        match Message::classify(response.clone()) {
            Ok(Message::Control(Control::Ack)) => Ok(response),
            Ok(Message::Control(Control::Error { reason })) => {
                self.raise_error(&reason);
                if envelope.id == control_ids::OPEN_BACK_CHANNEL {
                    Err(ConnectionError::BackChannelRefused(reason))
                } else {
                    Err(ConnectionError::Rejected(reason))
                }
            }
            Ok(Message::Control(Control::Disconnect)) => {
                gate.take();
                self.finish(ConnectionState::Closed, None).await;
                Err(ConnectionError::PeerGraceful)
            }
            Ok(other) => {
                let e = ConnectionError::ProtocolViolation(format!(
                    "Unexpected response {:?}",
                    other
                ));
                Err(self.fail_with(&mut gate, e).await)
            }
            Err(e) => {
                let e = ConnectionError::ProtocolViolation(e.to_string());
                Err(self.fail_with(&mut gate, e).await)
            }
        }
    }

    /// Send without waiting for a reply
    pub async fn send(&self, envelope: Envelope) -> ConnectionResult<()> {
        check_outgoing(&envelope)?;
        let mut gate = self.gate.lock().await;
        self.ensure_open()?;

        let exchange = Exchange::begin(self);
        let result = self.write_locked(&mut gate, &envelope).await;
        exchange.complete();

        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail_with(&mut gate, e).await),
        }
    }

    /// Wait for the next application envelope
    ///
    /// Control envelopes are handled in place. Returns `Ok(None)` once the
    /// peer disconnects gracefully or the connection is closed locally.
    /// Cancelling an idle wait is harmless.
    pub async fn receive(&self) -> ConnectionResult<Option<Envelope>> {
        let mut gate = self.gate.lock().await;
        self.ensure_open()?;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                result = self.read_locked(&mut gate) => Some(result),
            };

            let envelope = match result {
                None => return Ok(None),
                Some(Ok(envelope)) => envelope,
                Some(Err(e)) => return Err(self.fail_with(&mut gate, e).await),
            };

            if !envelope.is_control() {
                return Ok(Some(envelope));
            }

            tracing::debug!("Control {} from {}", envelope.id, self.remote_addr);
            let control = match Message::classify(envelope) {
                Ok(Message::Control(control)) => control,
                Ok(Message::Application(envelope)) => return Ok(Some(envelope)),
                Err(e) => {
                    let e = ConnectionError::ProtocolViolation(e.to_string());
                    return Err(self.fail_with(&mut gate, e).await);
                }
            };

            let exchange = Exchange::begin(self);
            let flow = self.handle_control(&mut gate, control).await;
            exchange.complete();

            match flow {
                Ok(Flow::Continue) => continue,
                Ok(Flow::Closed) => return Ok(None),
                Err(e) => return Err(self.fail_with(&mut gate, e).await),
            }
        }
    }

    /// Close the connection gracefully; never fails and is idempotent
    pub async fn close(&self) {
        let previous = loop {
            let current = self.state();
            if !matches!(current, ConnectionState::Connecting | ConnectionState::Open) {
                return;
            }
            if self
                .state
                .compare_exchange(
                    current as u8,
                    ConnectionState::Closing as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break current;
            }
        };

        self.shutdown.cancel();

        let mut gate = self.gate.lock().await;
        if let Some(mut transport) = gate.take() {
            if previous == ConnectionState::Open {
                let disconnect = Control::Disconnect.into_envelope(&self.local_name);
                if let Ok(bytes) = self.codec.encode(&disconnect) {
                    let _ = tokio::time::timeout(
                        self.config.connect_timeout(),
                        transport.write_frame(&bytes),
                    )
                    .await;
                }
            }
            let _ = transport.shutdown().await;
        }
        drop(gate);

        tracing::info!("Closed connection to {}", self.remote_addr);
        self.finish(ConnectionState::Closed, None).await;
    }

    /// Drop the socket without sending disconnect; the peer sees a reset
    pub async fn abort(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.shutdown.cancel();

        let mut gate = self.gate.lock().await;
        gate.take();
        drop(gate);

        tracing::debug!("Aborted connection to {}", self.remote_addr);
        self.finish(ConnectionState::Closed, None).await;
    }

    /// Client side of the handshake: send connect, expect ack
    pub(crate) async fn handshake_client(&self) -> ConnectionResult<()> {
        let mut gate = self.gate.lock().await;
        if self.state() != ConnectionState::Connecting {
            return Err(ConnectionError::NotConnected);
        }

        let connect = Control::Connect {
            name: self.local_name.clone(),
        }
        .into_envelope(&self.local_name);

        let response = match self.round_trip(&mut gate, &connect).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail_with(&mut gate, e).await),
        };
        let server_name = response.sender.clone();

        match Message::classify(response) {
            Ok(Message::Control(Control::Ack)) => {
                *self.peer_name.write().await = server_name;
                self.set_state(ConnectionState::Open);
                tracing::info!(
                    "Handshake complete with {} ({})",
                    self.peer_name().await,
                    self.remote_addr
                );
                Ok(())
            }
            Ok(Message::Control(Control::Error { reason })) => {
                gate.take();
                self.finish(ConnectionState::Failed, None).await;
                Err(ConnectionError::Rejected(reason))
            }
            _ => {
                let e = ConnectionError::ProtocolViolation("Expected ack to connect".to_string());
                Err(self.fail_with(&mut gate, e).await)
            }
        }
    }

    /// Server side of the handshake: the first frame must be connect
    pub(crate) async fn accept_handshake(&self) -> ConnectionResult<()> {
        let mut gate = self.gate.lock().await;
        if self.state() != ConnectionState::Connecting {
            return Err(ConnectionError::NotConnected);
        }

        let first = match self.read_locked(&mut gate).await {
            Ok(envelope) => envelope,
            Err(e) => return Err(self.fail_with(&mut gate, e).await),
        };

        match Message::classify(first) {
            Ok(Message::Control(Control::Connect { name })) => {
                *self.peer_name.write().await = name;
                let ack = Control::Ack.into_envelope(&self.local_name);
                if let Err(e) = self.write_locked(&mut gate, &ack).await {
                    return Err(self.fail_with(&mut gate, e).await);
                }
                self.set_state(ConnectionState::Open);
                tracing::info!(
                    "Handshake complete with {} ({})",
                    self.peer_name().await,
                    self.remote_addr
                );
                Ok(())
            }
            other => {
                let reason = format!("Expected connect, got {:?}", other);
                let error = Control::Error {
                    reason: reason.clone(),
                }
                .into_envelope(&self.local_name);
                let _ = self.write_locked(&mut gate, &error).await;
                Err(self
                    .fail_with(&mut gate, ConnectionError::ProtocolViolation(reason))
                    .await)
            }
        }
    }

    /// Raise `Connected`; later Error/Disconnected notifications depend on it
    pub(crate) fn announce(&self) {
        if !self.announced.swap(true, Ordering::SeqCst) {
            if let Some(this) = self.this.upgrade() {
                self.emit(ConnectionEvent::Connected(this));
            }
        }
    }

    /// Record the back-channel and raise `BackChannelReady`
    pub(crate) fn attach_back_channel(
        &self,
        back_channel: Arc<Connection>,
    ) -> ConnectionResult<()> {
        self.back_channel.set(back_channel.clone()).map_err(|_| {
            ConnectionError::BackChannelRefused("Back-channel already open".to_string())
        })?;

        back_channel.announced.store(true, Ordering::SeqCst);
        if let Some(this) = self.this.upgrade() {
            self.emit(ConnectionEvent::BackChannelReady {
                connection: this,
                back_channel,
            });
        }
        Ok(())
    }

    /// Wiring for a connection dialed out from this one
    pub(crate) fn back_channel_wiring(&self) -> Wiring {
        Wiring {
            role: Role::Client,
            local_name: self.local_name.clone(),
            config: self.config.clone(),
            codec: self.codec.clone(),
            events: self.events.clone(),
            registry: None,
            is_back_channel: true,
        }
    }

    async fn handle_control(&self, gate: &mut Gate, control: Control) -> ConnectionResult<Flow> {
        match control {
            Control::Connect { name } => {
                *self.peer_name.write().await = name;
                let ack = Control::Ack.into_envelope(&self.local_name);
                self.write_locked(gate, &ack).await?;
                Ok(Flow::Continue)
            }
            Control::Ack => Ok(Flow::Continue),
            Control::Disconnect => {
                tracing::info!("Peer {} disconnected", self.remote_addr);
                gate.take();
                self.finish(ConnectionState::Closed, None).await;
                Ok(Flow::Closed)
            }
            Control::Error { reason } => {
                self.raise_error(&reason);
                Ok(Flow::Continue)
            }
            Control::OpenBackChannel { name, port } => {
                tracing::info!(
                    "Back-channel requested by {} ({}:{})",
                    self.remote_addr,
                    name,
                    port
                );
                let reply = match self.open_back_channel(port).await {
                    Ok(()) => Control::Ack,
                    Err(reason) => {
                        tracing::warn!("Back-channel to {} refused: {}", self.remote_addr, reason);
                        Control::Error { reason }
                    }
                };
                self.write_locked(gate, &reply.into_envelope(&self.local_name))
                    .await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Server side of open-back-channel; the error is the refusal reason
    async fn open_back_channel(&self, port: u16) -> Result<(), String> {
        if self.role != Role::Server {
            return Err("Back-channels are opened by clients".to_string());
        }
        if !self.config.accept_back_channels {
            return Err("Server does not accept back-channels".to_string());
        }
        let this = self.this.upgrade().ok_or_else(|| "Connection dropped".to_string())?;

        match super::server::open_back_channel(&this, port).await {
            Ok(_) => Ok(()),
            Err(ConnectionError::BackChannelRefused(reason)) => Err(reason),
            Err(other) => Err(other.to_string()),
        }
    }

    fn ensure_open(&self) -> ConnectionResult<()> {
        if self.state() == ConnectionState::Open {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    async fn round_trip(&self, gate: &mut Gate, envelope: &Envelope) -> ConnectionResult<Envelope> {
        self.write_locked(gate, envelope).await?;
        self.read_locked(gate).await
    }

    async fn write_locked(&self, gate: &mut Gate, envelope: &Envelope) -> ConnectionResult<()> {
        let bytes = self.codec.encode(envelope)?;
        let transport = gate.as_mut().ok_or(ConnectionError::NotConnected)?;
        transport.write_frame(&bytes).await?;
        tracing::debug!(
            "Sent {} ({} bytes) to {}",
            envelope.id,
            bytes.len(),
            self.remote_addr
        );
        Ok(())
    }

    async fn read_locked(&self, gate: &mut Gate) -> ConnectionResult<Envelope> {
        let transport = gate.as_mut().ok_or(ConnectionError::NotConnected)?;
        let bytes = transport.read_frame().await?;
        self.codec
            .decode(&bytes)
            .map_err(|e| ConnectionError::ProtocolViolation(format!("Undecodable frame: {}", e)))
    }

    /// Release the socket on fatal errors and pass the error through
    async fn fail_with(&self, gate: &mut Gate, error: ConnectionError) -> ConnectionError {
        if error.is_fatal() {
            gate.take();
            self.finish(ConnectionState::Failed, Some(error.to_string()))
                .await;
        }
        error
    }

    /// An exchange was dropped midway; fail now, release the socket later
    fn abandon(&self) {
        if self.state().is_terminal() {
            return;
        }
        tracing::warn!("Exchange with {} cancelled midway", self.remote_addr);
        self.set_state(ConnectionState::Failed);
        self.shutdown.cancel();

        let (Some(this), Ok(runtime)) = (self.this.upgrade(), Handle::try_current()) else {
            return;
        };
        runtime.spawn(async move {
            this.gate.lock().await.take();
            this.finish(
                ConnectionState::Failed,
                Some("Exchange cancelled midway".to_string()),
            )
            .await;
        });
    }

    fn raise_error(&self, reason: &str) {
        tracing::warn!("Error from {}: {}", self.remote_addr, reason);
        if self.announced.load(Ordering::SeqCst) {
            if let Some(this) = self.this.upgrade() {
                self.emit(ConnectionEvent::Error {
                    connection: this,
                    reason: reason.to_string(),
                });
            }
        }
    }

    /// Terminal transition; runs once whichever path gets here first
    async fn finish(&self, state: ConnectionState, error: Option<String>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(state);
        self.shutdown.cancel();

        if let Some(reason) = error {
            self.raise_error(&reason);
        }

        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.remove(&self.id).await;
        }

        if self.announced.load(Ordering::SeqCst) {
            if let Some(this) = self.this.upgrade() {
                self.emit(ConnectionEvent::Disconnected(this));
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Reject reserved ids that are not part of the control protocol
fn check_outgoing(envelope: &Envelope) -> ConnectionResult<()> {
    if envelope.is_control() {
        Control::from_envelope(envelope)
            .map_err(|e| ConnectionError::ReservedId(e.to_string()))?;
    }
    Ok(())
}

/// Whether `envelope` is the ack control envelope
pub fn is_ack(envelope: &Envelope) -> bool {
    envelope.id == control_ids::ACK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BincodeCodec;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn wiring(role: Role, name: &str, events: Option<EventSender>) -> Wiring {
        Wiring {
            role,
            local_name: name.to_string(),
            config: NetworkConfig::default(),
            codec: Arc::new(BincodeCodec),
            events,
            registry: None,
            is_back_channel: false,
        }
    }

    async fn pair(
        client_events: Option<EventSender>,
        server_events: Option<EventSender>,
    ) -> (Arc<Connection>, Arc<Connection>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = Connection::new(stream, wiring(Role::Server, "srv", server_events)).unwrap();
            conn.accept_handshake().await.unwrap();
            conn.announce();
            conn
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = Connection::new(stream, wiring(Role::Client, "cli", client_events)).unwrap();
        client.handshake_client().await.unwrap();
        client.announce();

        (client, accept.await.unwrap())
    }

    #[test]
    fn test_error_classification() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(ConnectionError::from(reset), ConnectionError::PeerReset));

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(ConnectionError::from(timed_out), ConnectionError::Timeout));

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(ConnectionError::from(other), ConnectionError::Transport(_)));

        let big = FrameError::TooLarge(10, 1);
        assert!(matches!(
            ConnectionError::from(big),
            ConnectionError::ProtocolViolation(_)
        ));

        assert!(!ConnectionError::NotConnected.is_fatal());
        assert!(ConnectionError::PeerReset.is_fatal());
    }

    #[tokio::test]
    async fn test_handshake_records_names() {
        let (client, server) = pair(None, None).await;
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(server.state(), ConnectionState::Open);
        assert_eq!(server.peer_name().await, "cli");
        assert_eq!(client.peer_name().await, "srv");
    }

    #[tokio::test]
    async fn test_send_receive_and_receive() {
        let (client, server) = pair(None, None).await;

        let responder = tokio::spawn(async move {
            let request = server.receive().await.unwrap().unwrap();
            assert_eq!(request.id, "ping");
            server.send(Envelope::empty("pong", "srv")).await.unwrap();
            server
        });

        let reply = client.send_receive(Envelope::empty("ping", "cli")).await.unwrap();
        assert_eq!(reply, Envelope::empty("pong", "srv"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_control_is_consumed() {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let (client, server) = pair(Some(client_tx), None).await;

        let error = Control::Error {
            reason: "boom".into(),
        }
        .into_envelope("srv");
        server.send(error).await.unwrap();
        server.send(Envelope::empty("after", "srv")).await.unwrap();

        let next = client.receive().await.unwrap().unwrap();
        assert_eq!(next.id, "after");

        assert!(matches!(client_rx.recv().await, Some(ConnectionEvent::Connected(_))));
        match client_rx.recv().await {
            Some(ConnectionEvent::Error { reason, .. }) => assert_eq!(reason, "boom"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_graceful_close_is_seen_by_peer() {
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (client, server) = pair(None, Some(server_tx)).await;

        let reader = tokio::spawn({
            let server = server.clone();
            async move { server.receive().await }
        });

        client.close().await;
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);

        assert!(matches!(reader.await.unwrap(), Ok(None)));
        assert_eq!(server.state(), ConnectionState::Closed);

        assert!(matches!(server_rx.recv().await, Some(ConnectionEvent::Connected(_))));
        assert!(matches!(server_rx.recv().await, Some(ConnectionEvent::Disconnected(_))));
        assert!(server_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_abort_is_a_reset_for_the_peer() {
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (client, server) = pair(None, Some(server_tx)).await;

        client.abort().await;

        assert!(matches!(server.receive().await, Err(ConnectionError::PeerReset)));
        assert_eq!(server.state(), ConnectionState::Failed);

        assert!(matches!(server_rx.recv().await, Some(ConnectionEvent::Connected(_))));
        assert!(matches!(server_rx.recv().await, Some(ConnectionEvent::Error { .. })));
        assert!(matches!(server_rx.recv().await, Some(ConnectionEvent::Disconnected(_))));
        assert!(server_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let (client, _server) = pair(None, None).await;
        client.close().await;

        assert!(matches!(
            client.send(Envelope::empty("x", "cli")).await,
            Err(ConnectionError::NotConnected)
        ));
        assert!(matches!(
            client.send_receive(Envelope::empty("x", "cli")).await,
            Err(ConnectionError::NotConnected)
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_close_interrupts_idle_receive() {
        let (client, _server) = pair(None, None).await;

        let reader = tokio::spawn({
            let client = client.clone();
            async move { client.receive().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        client.close().await;
        assert!(matches!(reader.await.unwrap(), Ok(None)));
    }

    #[tokio::test]
    async fn test_client_cannot_be_asked_for_back_channel() {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let (client, server) = pair(Some(client_tx), None).await;

        let reader = tokio::spawn({
            let client = client.clone();
            async move { client.receive().await }
        });

        let request = Control::OpenBackChannel {
            name: "x".into(),
            port: 1,
        }
        .into_envelope("srv");
        // The client answers with an error control envelope
        let result = server.send_receive(request).await;
        assert!(matches!(result, Err(ConnectionError::BackChannelRefused(_))));

        client.close().await;
        reader.await.unwrap().unwrap();
        assert!(matches!(client_rx.recv().await, Some(ConnectionEvent::Connected(_))));
    }

    #[tokio::test]
    async fn test_cancelled_send_receive_fails_connection() {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let (client, server) = pair(Some(client_tx), None).await;

        let responder = tokio::spawn(async move {
            let slow = server.receive().await.unwrap().unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            let _ = server
                .send(Envelope::empty(format!("re-{}", slow.id), "srv"))
                .await;
            if let Ok(Some(next)) = server.receive().await {
                let _ = server
                    .send(Envelope::empty(format!("re-{}", next.id), "srv"))
                    .await;
            }
        });

        let first = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            client.send_receive(Envelope::empty("slow", "cli")),
        )
        .await;
        assert!(first.is_err());
        assert_eq!(client.state(), ConnectionState::Failed);

        match client.send_receive(Envelope::empty("fast", "cli")).await {
            Err(ConnectionError::NotConnected) => {}
            Ok(reply) => assert_eq!(reply.id, "re-fast"),
            Err(other) => panic!("unexpected {:?}", other),
        }

        assert!(matches!(client_rx.recv().await, Some(ConnectionEvent::Connected(_))));
        assert!(matches!(client_rx.recv().await, Some(ConnectionEvent::Error { .. })));
        assert!(matches!(client_rx.recv().await, Some(ConnectionEvent::Disconnected(_))));
        responder.abort();
    }

    #[tokio::test]
    async fn test_cancelled_idle_receive_keeps_connection() {
        let (client, server) = pair(None, None).await;

        let idle =
            tokio::time::timeout(std::time::Duration::from_millis(50), client.receive()).await;
        assert!(idle.is_err());
        assert_eq!(client.state(), ConnectionState::Open);

        server.send(Envelope::text("late", "srv", "x")).await.unwrap();
        let next = client.receive().await.unwrap().unwrap();
        assert_eq!(next, Envelope::text("late", "srv", "x"));
    }

    #[tokio::test]
    async fn test_unknown_reserved_id_is_refused_locally() {
        let (client, server) = pair(None, None).await;

        assert!(matches!(
            client.send(Envelope::empty("__custom", "cli")).await,
            Err(ConnectionError::ReservedId(_))
        ));
        assert!(matches!(
            client.send_receive(Envelope::empty("__custom", "cli")).await,
            Err(ConnectionError::ReservedId(_))
        ));
        assert_eq!(client.state(), ConnectionState::Open);

        client.send(Envelope::empty("ok", "cli")).await.unwrap();
        assert_eq!(server.receive().await.unwrap().unwrap().id, "ok");
    }
}
