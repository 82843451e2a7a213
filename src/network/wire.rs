//! Length-prefixed bincode framing of envelopes.
//!
//! Frame format: [4-byte length (u32 big-endian)][bincode Envelope]

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::error::CommError;
use crate::network::signed_message::Envelope;

pub const MAX_FRAME_SIZE: u32 = DEFAULT_MAX_FRAME_SIZE;

/// Serialize an envelope into a length-prefixed frame.
pub fn serialize_frame(envelope: &Envelope, max_frame_size: u32) -> Result<Vec<u8>, CommError> {
    let payload = bincode::serialize(envelope)?;

    if payload.len() > max_frame_size as usize {
        return Err(CommError::Codec(format!(
            "Message too large: {} bytes (max: {})",
            payload.len(),
            max_frame_size
        )));
    }
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
    max_frame_size: u32,
) -> Result<(), CommError> {
    let frame = serialize_frame(envelope, max_frame_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns Ok(None) on clean EOF.
pub async fn read_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: u32,
) -> Result<Option<Envelope>, CommError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > max_frame_size {
        return Err(CommError::Codec(format!(
            "Frame too large: {} bytes (max: {})",
            len, max_frame_size
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    let envelope: Envelope = bincode::deserialize(&payload)?;
    Ok(Some(envelope))
}
