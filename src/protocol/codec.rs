//! Envelope codecs
//!
//! The connection engine only sees the [`Codec`] trait. Two implementations
//! ship with the crate: compact bincode (the default) and JSON for debugging
//! traffic with ordinary tools.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use super::Envelope;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes envelopes to and from frame payloads
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError>;
}

/// Bincode envelope codec
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(envelope)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// JSON envelope codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(envelope)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Codec selection as written in configuration files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Bincode,
    Json,
}

impl CodecKind {
    pub fn build(self) -> Arc<dyn Codec> {
        match self {
            CodecKind::Bincode => Arc::new(BincodeCodec),
            CodecKind::Json => Arc::new(JsonCodec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new("ping", "c1", vec![0, 1, 2, 255])
    }

    #[test]
    fn test_bincode_roundtrip() {
        let codec = BincodeCodec;
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec;
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(JsonCodec.decode(b"not json").is_err());
        assert!(BincodeCodec.decode(&[0xff]).is_err());
    }

    #[test]
    fn test_codec_kind_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            codec: CodecKind,
        }
        let parsed: Wrapper = toml::from_str("codec = \"json\"").unwrap();
        assert_eq!(parsed.codec, CodecKind::Json);
    }
}
