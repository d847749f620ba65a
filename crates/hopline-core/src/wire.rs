//! hopline wire format: length-prefixed frames over any byte stream.
//!
//! A frame is a 4-byte big-endian unsigned length followed by exactly that
//! many payload bytes. The same framing runs over TCP sockets and named
//! pipes. There is no header beyond the length: no version, no type tag.
//!
//! Readers never hand out a partial frame. Short reads and short writes are
//! resumed where they stopped; would-block conditions are retried in place.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::fault::{classify, Fault};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload a single frame can carry.
pub const MAX_FRAME_LEN: usize = u32::MAX as usize;

/// Acknowledgment byte a node sends to the orchestrator after a probe.
pub const PROBE_ACK: u8 = 6;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer went away: EOF, reset, broken pipe. The endpoint is dead.
    #[error("endpoint disconnected: {0}")]
    Disconnected(#[source] io::Error),

    #[error("frame i/o failed: {0}")]
    Io(#[source] io::Error),

    #[error("payload length {0} exceeds maximum {}", MAX_FRAME_LEN)]
    TooLarge(usize),
}

impl FrameError {
    /// True when the endpoint must be recreated before it can be used again.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, FrameError::Disconnected(_))
    }

    fn from_io(err: io::Error) -> Self {
        match classify(&err) {
            Fault::TransportLoss => FrameError::Disconnected(err),
            _ => FrameError::Io(err),
        }
    }
}

// ── Reading ───────────────────────────────────────────────────────────────────

/// Read one complete frame and return its payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    fill(reader, &mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;

    let mut payload = BytesMut::zeroed(len);
    fill(reader, &mut payload).await?;
    Ok(payload.freeze())
}

/// Fill `buf` completely, resuming after short reads.
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => {
                return Err(FrameError::Disconnected(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream closed after {filled} of {} bytes", buf.len()),
                )))
            }
            Ok(n) => filled += n,
            Err(e) if classify(&e) == Fault::Transient => tokio::task::yield_now().await,
            Err(e) => return Err(FrameError::from_io(e)),
        }
    }
    Ok(())
}

// ── Writing ───────────────────────────────────────────────────────────────────

/// Write `payload` as one frame: length prefix, then payload, then flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let prefix = length_prefix(payload.len())?;
    drain(writer, &prefix).await?;
    drain(writer, payload).await?;
    loop {
        match writer.flush().await {
            Ok(()) => return Ok(()),
            Err(e) if classify(&e) == Fault::Transient => tokio::task::yield_now().await,
            Err(e) => return Err(FrameError::from_io(e)),
        }
    }
}

/// Build a complete frame in memory.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let prefix = length_prefix(payload.len())?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.put_slice(&prefix);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn length_prefix(len: usize) -> Result<[u8; LENGTH_PREFIX_LEN], FrameError> {
    let len = u32::try_from(len).map_err(|_| FrameError::TooLarge(len))?;
    Ok(len.to_be_bytes())
}

/// Write all of `buf`, resuming after short writes.
async fn drain<W>(writer: &mut W, buf: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]).await {
            Ok(0) => {
                return Err(FrameError::Disconnected(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "endpoint accepted zero bytes",
                )))
            }
            Ok(n) => written += n,
            Err(e) if classify(&e) == Fault::Transient => tokio::task::yield_now().await,
            Err(e) => return Err(FrameError::from_io(e)),
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
