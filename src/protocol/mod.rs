//! Protocol module - Defines the wire protocol for PeerLink communication
//!
//! Every TCP frame is laid out as:
//! - 4 bytes payload length (big-endian)
//! - Variable length payload (one codec-encoded [`Envelope`])
//!
//! Discovery datagrams reuse the same length prefix around a UTF-8 string.

mod message;
mod codec;
mod frame;

pub use message::*;
pub use codec::*;
pub use frame::*;

use std::net::Ipv4Addr;

/// Well-known multicast group used by discovery
pub const DEFAULT_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(226, 10, 10, 2);

/// Well-known multicast port used by discovery
pub const DEFAULT_MULTICAST_PORT: u16 = 37992;

/// Maximum frame size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Size of the length prefix on frames and datagrams
pub const LENGTH_PREFIX_SIZE: usize = 4;
