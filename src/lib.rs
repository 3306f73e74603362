//! PeerLink - LAN peer discovery and bidirectional message channels
//!
//! A server advertises a service name over UDP multicast; clients find it,
//! connect over TCP and exchange length-prefixed [`Envelope`]s with
//! request/response semantics. Either side can upgrade the channel with a
//! server-initiated back-channel.

pub mod config;
pub mod discovery;
pub mod network;
pub mod protocol;

pub use discovery::{find_server, DiscoveryConfig, DiscoveryError, Responder};
pub use network::{
    Client, ClientError, Connection, ConnectionError, ConnectionEvent, ConnectionState, Handler,
    NetworkConfig, Server, ServerError,
};
pub use protocol::{BincodeCodec, Codec, CodecKind, Envelope, JsonCodec};
