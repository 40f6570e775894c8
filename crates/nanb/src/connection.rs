//! Wire framing and socket helpers for the kernel connection.
//!
//! A frame is a big-endian `u32` byte count followed by that many bytes of
//! JSON (one `protocol` message):
//!
//! ```text
//! | len: u32 BE | payload: len bytes |
//! ```
//!
//! The first frame of a connection is read under [`FrameLimit::Control`], so
//! a peer that has not said hello yet cannot make us allocate 100 MiB.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Size cap applied when reading a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLimit {
    /// Handshake frames, 64 KiB.
    Control,
    /// Everything after the handshake, 100 MiB.
    Message,
}

impl FrameLimit {
    pub const fn max_len(self) -> usize {
        match self {
            FrameLimit::Control => 64 * 1024,
            FrameLimit::Message => 100 * 1024 * 1024,
        }
    }
}

fn oversized(kind: std::io::ErrorKind, len: usize, limit: FrameLimit) -> std::io::Error {
    std::io::Error::new(
        kind,
        format!("{} byte frame exceeds the {:?} limit of {}", len, limit, limit.max_len()),
    )
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    if payload.len() > FrameLimit::Message.max_len() {
        return Err(oversized(
            std::io::ErrorKind::InvalidInput,
            payload.len(),
            FrameLimit::Message,
        ));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one frame. `Ok(None)` means the peer closed the stream between
/// frames; a stream that ends inside a frame is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: FrameLimit,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut header).await {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Ok(None),
            _ => Err(e),
        };
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > limit.max_len() {
        return Err(oversized(std::io::ErrorKind::InvalidData, len, limit));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Serialize `message` and write it as one frame.
pub async fn send_json_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload).await.map_err(Error::from)
}

/// Read one frame and decode it. I/O failures come back as
/// [`Error::Transport`] and undecodable payloads as [`Error::Protocol`], so
/// callers can tell a dropped connection from a malformed message.
pub async fn recv_json_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>> {
    recv_json(reader, FrameLimit::Message).await
}

/// [`recv_json_frame`] under the handshake limit.
pub async fn recv_json_control_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>> {
    recv_json(reader, FrameLimit::Control).await
}

async fn recv_json<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
    limit: FrameLimit,
) -> Result<Option<T>> {
    let Some(payload) = read_frame(reader, limit).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))
}

/// Unique socket path for a new kernel: `<prefix><uuid>`.
pub fn socket_path(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", prefix, uuid::Uuid::new_v4().simple()))
}

/// Remove a socket file left behind by a kernel that is gone.
///
/// If something still accepts connections on `path`, returns `AddrInUse`
/// instead of stealing the address.
pub async fn clear_stale_socket(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    match tokio::net::UnixStream::connect(path).await {
        Ok(_) => Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("socket {} is in use", path.display()),
        )),
        Err(_) => {
            log::info!("[connection] Removing stale socket {}", path.display());
            match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        }
    }
}
