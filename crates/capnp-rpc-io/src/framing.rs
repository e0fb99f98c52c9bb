//! Turns an `AsyncRead`/`AsyncWrite` pair into a stream of opaque frame
//! byte vectors, the same shape `Peer::dispatch` and
//! `Peer::pop_outbound_frame` trade in.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::IoError;
use crate::limits::IoLimits;

const READ_CHUNK: usize = 8192;

/// Buffers bytes off `R` and peels complete frames out front using
/// `capnp_message::decode_frame`'s consumed-byte count, the same way the
/// frame module's own doc comment describes reading frames off a pipe.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    limits: IoLimits,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, limits: IoLimits) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            limits,
        }
    }

    /// Reads the next complete frame. `Ok(None)` means the stream closed
    /// cleanly with no partial frame buffered; a stream that closes
    /// mid-frame is an `IoError::Io` of kind `UnexpectedEof`.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, IoError> {
        loop {
            if !self.buf.is_empty() {
                match capnp_message::decode_frame(&Bytes::copy_from_slice(&self.buf)) {
                    Ok((_, consumed)) => {
                        let frame = self.buf.split_to(consumed);
                        return Ok(Some(frame.to_vec()));
                    }
                    Err(capnp_message::DecodeError::TruncatedFrame) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if self.buf.len() as u64 > self.limits.max_frame_bytes() {
                return Err(IoError::OversizeFrame {
                    limit: self.limits.max_frame_bytes(),
                });
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "stream ended mid-frame").into())
                };
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Writes already-framed bytes (as produced by `capnp_message::encode_frame`
/// and handed out by `Peer::pop_outbound_frame`) to `W`. A frame's segment
/// table is self-delimiting, so no extra length prefix is added.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), IoError> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
