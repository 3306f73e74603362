//! Protocol message definitions
//!
//! Everything on the wire is an [`Envelope`]. A handful of reserved ids form an
//! in-band control plane; [`Message::classify`] separates those from
//! application traffic once, right after decoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved envelope ids consumed by the protocol engine
pub mod control_ids {
    pub const CONNECT: &str = "__connect";
    pub const ACK: &str = "__ack";
    pub const DISCONNECT: &str = "__disconnect";
    pub const ERROR: &str = "__error";
    pub const OPEN_BACK_CHANNEL: &str = "__open_back_channel";

    /// Prefix shared by every reserved id
    pub const PREFIX: &str = "__";
}

/// The unit exchanged on the wire
///
/// Ids starting with `__` are reserved for the control protocol; connections
/// refuse to send any that it does not define.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Control or application-defined identifier
    pub id: String,
    /// Display name of the sending peer
    pub sender: String,
    /// Opaque application payload
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(id: impl Into<String>, sender: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            payload,
        }
    }

    /// An envelope with no payload
    pub fn empty(id: impl Into<String>, sender: impl Into<String>) -> Self {
        Self::new(id, sender, Vec::new())
    }

    /// An envelope whose payload is a UTF-8 string
    pub fn text(id: impl Into<String>, sender: impl Into<String>, text: &str) -> Self {
        Self::new(id, sender, text.as_bytes().to_vec())
    }

    /// An envelope carrying a bincode-serialized value
    pub fn with_value<T: Serialize>(
        id: impl Into<String>,
        sender: impl Into<String>,
        value: &T,
    ) -> Result<Self, bincode::Error> {
        Ok(Self::new(id, sender, bincode::serialize(value)?))
    }

    /// Deserialize a payload written by [`Envelope::with_value`]
    pub fn value<T: DeserializeOwned>(&self) -> Result<T, bincode::Error> {
        bincode::deserialize(&self.payload)
    }

    /// Payload as UTF-8, if valid
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Whether the id is in the reserved control namespace
    pub fn is_control(&self) -> bool {
        self.id.starts_with(control_ids::PREFIX)
    }
}

/// Errors raised while interpreting a control envelope
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ControlError {
    #[error("Unknown control id: {0}")]
    UnknownId(String),

    #[error("Malformed {id} payload: {reason}")]
    MalformedPayload { id: &'static str, reason: String },
}

/// Control-plane messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// First message from a client; the envelope sender is its display name
    Connect { name: String },
    /// Informational acknowledgement
    Ack,
    /// Graceful close, never answered
    Disconnect,
    /// Human-readable failure reason
    Error { reason: String },
    /// Client advertises a listener at `port` on its own machine
    OpenBackChannel { name: String, port: u16 },
}

impl Control {
    /// Reserved id for this control message
    pub fn id(&self) -> &'static str {
        match self {
            Control::Connect { .. } => control_ids::CONNECT,
            Control::Ack => control_ids::ACK,
            Control::Disconnect => control_ids::DISCONNECT,
            Control::Error { .. } => control_ids::ERROR,
            Control::OpenBackChannel { .. } => control_ids::OPEN_BACK_CHANNEL,
        }
    }

    /// Build the wire envelope, sent as `sender`
    pub fn into_envelope(self, sender: &str) -> Envelope {
        match self {
            Control::Connect { name } => Envelope::empty(control_ids::CONNECT, name),
            Control::Ack => Envelope::empty(control_ids::ACK, sender),
            Control::Disconnect => Envelope::empty(control_ids::DISCONNECT, sender),
            Control::Error { reason } => Envelope::text(control_ids::ERROR, sender, &reason),
            Control::OpenBackChannel { name, port } => Envelope::text(
                control_ids::OPEN_BACK_CHANNEL,
                sender,
                &format!("{}:{}", name, port),
            ),
        }
    }

    /// Interpret a reserved-id envelope
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ControlError> {
        match envelope.id.as_str() {
            control_ids::CONNECT => Ok(Control::Connect {
                name: envelope.sender.clone(),
            }),
            control_ids::ACK => Ok(Control::Ack),
            control_ids::DISCONNECT => Ok(Control::Disconnect),
            control_ids::ERROR => Ok(Control::Error {
                reason: String::from_utf8_lossy(&envelope.payload).into_owned(),
            }),
            control_ids::OPEN_BACK_CHANNEL => {
                let malformed = |reason: &str| ControlError::MalformedPayload {
                    id: control_ids::OPEN_BACK_CHANNEL,
                    reason: reason.to_string(),
                };
                let text = envelope
                    .payload_str()
                    .ok_or_else(|| malformed("not UTF-8"))?;
                let (name, port) = text
                    .rsplit_once(':')
                    .ok_or_else(|| malformed("expected name:port"))?;
                let port = port
                    .parse::<u16>()
                    .map_err(|_| malformed("invalid port"))?;
                Ok(Control::OpenBackChannel {
                    name: name.to_string(),
                    port,
                })
            }
            other => Err(ControlError::UnknownId(other.to_string())),
        }
    }
}

/// A decoded envelope, tagged as control or application traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Control(Control),
    Application(Envelope),
}

impl Message {
    /// Split control traffic from application traffic
    pub fn classify(envelope: Envelope) -> Result<Self, ControlError> {
        if envelope.is_control() {
            Control::from_envelope(&envelope).map(Message::Control)
        } else {
            Ok(Message::Application(envelope))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_envelope_passes_through() {
        let env = Envelope::text("ping", "c1", "hello");
        assert_eq!(Message::classify(env.clone()), Ok(Message::Application(env)));
    }

    #[test]
    fn test_connect_uses_sender_as_name() {
        let env = Control::Connect { name: "c1".into() }.into_envelope("ignored");
        assert_eq!(env.sender, "c1");
        assert_eq!(
            Message::classify(env),
            Ok(Message::Control(Control::Connect { name: "c1".into() }))
        );
    }

    #[test]
    fn test_open_back_channel_payload() {
        let env = Control::OpenBackChannel {
            name: "10.0.0.4".into(),
            port: 5123,
        }
        .into_envelope("c1");
        assert_eq!(env.payload_str(), Some("10.0.0.4:5123"));

        match Message::classify(env).unwrap() {
            Message::Control(Control::OpenBackChannel { name, port }) => {
                assert_eq!(name, "10.0.0.4");
                assert_eq!(port, 5123);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_open_back_channel_rejects_bad_port() {
        let env = Envelope::text(control_ids::OPEN_BACK_CHANNEL, "c1", "host:99999");
        assert!(matches!(
            Message::classify(env),
            Err(ControlError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_unknown_reserved_id() {
        let env = Envelope::empty("__bogus", "c1");
        assert_eq!(
            Message::classify(env),
            Err(ControlError::UnknownId("__bogus".into()))
        );
    }

    #[test]
    fn test_error_reason() {
        let env = Control::Error {
            reason: "nope".into(),
        }
        .into_envelope("srv");
        assert_eq!(
            Message::classify(env),
            Ok(Message::Control(Control::Error {
                reason: "nope".into()
            }))
        );
    }

    #[test]
    fn test_typed_payload() {
        let env = Envelope::with_value("sum", "c1", &vec![1u32, 2, 3]).unwrap();
        let values: Vec<u32> = env.value().unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }
}
