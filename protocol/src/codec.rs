//! Framing for the local command channel.
//!
//! Each message is a 4-byte little-endian length followed by that many
//! bytes of JSON. Readers deliver whole frames or an error, never a
//! partial frame; writers emit exactly two byte ranges, header then
//! body.

use std::io::Read;

use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::warn;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::command::Command;
use crate::notify::Notify;

/// Upper bound on a frame body. Anything larger is rejected on both
/// the read and the write side.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    Oversize(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed message body: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// True when the underlying stream ended mid-read: the peer hung
    /// up rather than sending a malformed message.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Frames `body` into a single buffer. Handy for tests and for
/// transports that want one write.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::Oversize(body.len()));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Reads one frame body from a blocking reader.
pub fn read_frame_from<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_MESSAGE_SIZE {
        warn!("rejecting oversized {len} byte frame");
        return Err(ProtocolError::Oversize(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

/// Reads one frame body from an async reader.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_MESSAGE_SIZE {
        warn!("rejecting oversized {len} byte frame");
        return Err(ProtocolError::Oversize(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Writes one frame: header, then body.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::Oversize(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads and decodes one command frame.
pub async fn read_command<R>(reader: &mut R) -> Result<Command, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame(reader).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Encodes and writes one command frame.
pub async fn write_command<W>(writer: &mut W, command: &Command) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(command)?;
    write_frame(writer, &body).await
}

/// Reads and decodes one notification frame.
pub async fn read_notify<R>(reader: &mut R) -> Result<Notify, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame(reader).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Encodes and writes one notification frame.
pub async fn write_notify<W>(writer: &mut W, notify: &Notify) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(notify)?;
    write_frame(writer, &body).await
}
