//! Length-prefixed framing
//!
//! Frames are a 4-byte big-endian length followed by exactly that many bytes.
//! End-of-stream and socket resets both surface as [`FrameError::PeerGone`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};

/// Framing errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Peer gone")]
    PeerGone,

    #[error("Frame too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),

    #[error("Truncated frame: declared {declared} bytes, got {actual}")]
    Truncated { declared: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        if is_peer_gone(&e) {
            FrameError::PeerGone
        } else {
            FrameError::Io(e)
        }
    }
}

/// Whether an I/O error means the other end went away
pub fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Prepend the length prefix to `payload`
pub fn encode_prefixed(payload: &[u8], max_size: usize) -> Result<Bytes, FrameError> {
    if payload.len() > max_size {
        return Err(FrameError::TooLarge(payload.len(), max_size));
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Strip the length prefix from a complete buffer (one datagram)
pub fn decode_prefixed(mut buf: &[u8], max_size: usize) -> Result<&[u8], FrameError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Err(FrameError::Truncated {
            declared: LENGTH_PREFIX_SIZE,
            actual: buf.len(),
        });
    }
    let length = buf.get_u32() as usize;
    if length > max_size {
        return Err(FrameError::TooLarge(length, max_size));
    }
    if buf.len() < length {
        return Err(FrameError::Truncated {
            declared: length,
            actual: buf.len(),
        });
    }
    Ok(&buf[..length])
}

/// Reads and writes frames over one stream
pub struct FrameTransport<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_frame_size: usize,
}

impl<S> FrameTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_size(stream, MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(stream: S, max_frame_size: usize) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Write one frame and flush
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() > self.max_frame_size {
            return Err(FrameError::TooLarge(payload.len(), self.max_frame_size));
        }

        self.write_buf.clear();
        self.write_buf.put_u32(payload.len() as u32);
        self.write_buf.put_slice(payload);

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Block until one whole frame has arrived
    ///
    /// Cancel-safe: bytes of a partially received frame stay buffered and the
    /// next call picks up where this one stopped.
    pub async fn read_frame(&mut self) -> Result<Bytes, FrameError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(frame);
            }

            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(FrameError::PeerGone);
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.read_buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.read_buf[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_be_bytes(prefix) as usize;
        if length > self.max_frame_size {
            return Err(FrameError::TooLarge(length, self.max_frame_size));
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if self.read_buf.len() < total {
            self.read_buf.reserve(total - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.read_buf.split_to(length).freeze()))
    }

    /// Shut down the write half
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_frames_in_order() {
        let (a, b) = tokio::io::duplex(64);
        let mut writer = FrameTransport::new(a);
        let mut reader = FrameTransport::new(b);

        let write = tokio::spawn(async move {
            writer.write_frame(b"first").await.unwrap();
            writer.write_frame(&[7u8; 200]).await.unwrap();
            writer.write_frame(b"").await.unwrap();
        });

        assert_eq!(&reader.read_frame().await.unwrap()[..], b"first");
        assert_eq!(&reader.read_frame().await.unwrap()[..], &[7u8; 200][..]);
        assert!(reader.read_frame().await.unwrap().is_empty());
        write.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_is_peer_gone() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut reader = FrameTransport::new(b);
        assert!(matches!(reader.read_frame().await, Err(FrameError::PeerGone)));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_peer_gone() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(a);
        let mut reader = FrameTransport::new(b);
        assert!(matches!(reader.read_frame().await, Err(FrameError::PeerGone)));
    }

    #[tokio::test]
    async fn test_cancelled_read_keeps_partial_frame() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FrameTransport::new(b);

        a.write_all(&[0, 0, 0, 5, b'h', b'e']).await.unwrap();
        let first = tokio::time::timeout(Duration::from_millis(50), reader.read_frame()).await;
        assert!(first.is_err());

        a.write_all(b"llo").await.unwrap();
        a.write_all(&[0, 0, 0, 1, b'!']).await.unwrap();
        assert_eq!(&reader.read_frame().await.unwrap()[..], b"hello");
        assert_eq!(&reader.read_frame().await.unwrap()[..], b"!");
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let mut reader = FrameTransport::with_max_frame_size(b, 1024);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::TooLarge(_, 1024))
        ));
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let (a, _b) = tokio::io::duplex(64);
        let mut writer = FrameTransport::with_max_frame_size(a, 4);
        assert!(matches!(
            writer.write_frame(b"too long").await,
            Err(FrameError::TooLarge(8, 4))
        ));
    }

    #[test]
    fn test_prefixed_datagram() {
        let bytes = encode_prefixed(b"svc", 64).unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0, 3, b's', b'v', b'c']);
        assert_eq!(decode_prefixed(&bytes, 64).unwrap(), b"svc");
    }

    #[test]
    fn test_prefixed_datagram_truncated() {
        assert!(matches!(
            decode_prefixed(&[0, 0, 0, 9, b'x'], 64),
            Err(FrameError::Truncated { declared: 9, actual: 1 })
        ));
        assert!(decode_prefixed(&[0, 0], 64).is_err());
    }
}
