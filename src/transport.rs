//! # Stream Transport
//!
//! TCP listener and dialer plus the frame codec used on every connection.
//!
//! ## Framing
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE)| bincode-encoded Frame     |
//! +----------------+---------------------------+
//! ```
//!
//! The length is checked against [`MAX_FRAME_SIZE`] before any body bytes are
//! buffered, and the body is decoded with the same limit.
//!
//! Addresses are dialing hints only. The identity of the remote side comes
//! from the handshake frames.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::trace;

use crate::messages::{Frame, MAX_FRAME_SIZE, decode_frame, encode_frame};

/// Time allowed for dialing plus the handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn listen(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr.parse().context("invalid socket address")?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

pub async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow::anyhow!("connection to {addr} timed out"))?
        .with_context(|| format!("failed to connect to {addr}"))?;
    stream.set_nodelay(true).context("failed to set TCP_NODELAY")?;
    Ok(stream)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame).context("failed to serialize frame")?;
    if bytes.len() > MAX_FRAME_SIZE {
        bail!("frame too large: {} bytes (max {})", bytes.len(), MAX_FRAME_SIZE);
    }
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    trace!(frame = frame.kind(), size = bytes.len(), "frame written");
    Ok(())
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    // SECURITY: Reject before allocating the body.
    if len > MAX_FRAME_SIZE {
        bail!("rejecting oversized frame: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("stream closed mid-frame")?;
    let frame = decode_frame(&body).context("failed to deserialize frame")?;
    Ok(Some(frame))
}
