//! Length-prefixed frames over any async byte stream.
//!
//! ```text
//! +-------------------+--------------------+
//! | u32 little-endian |   payload          |
//! | payload length    |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The prefix does not count itself. An empty payload is a valid frame.

use std::io::ErrorKind;

use strata_config::NetworkConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Limits applied by the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    /// Largest accepted payload in bytes. Chunk responses are the largest
    /// messages, so this bounds the biggest chunk a peer can send.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 4 * 1024 * 1024,
        }
    }
}

impl FrameConfig {
    pub fn from_config(network: &NetworkConfig) -> Self {
        Self {
            max_payload_size: network.max_frame_bytes,
        }
    }

    fn check(&self, size: u64) -> Result<(), FrameError> {
        if size > u64::from(self.max_payload_size) {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            });
        }
        Ok(())
    }
}

/// Errors from reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: u64, max: u32 },

    /// The stream ended, cleanly or in the middle of a frame.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("frame i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Reads one frame and returns its payload.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let len = reader.read_u32_le().await.map_err(eof_as_closed)?;
    config.check(u64::from(len))?;

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(eof_as_closed)?;
    Ok(payload)
}

/// Writes one frame and flushes it.
///
/// The header and payload go out in a single write so a frame is never
/// interleaved with another writer's bytes on a shared buffer.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    config.check(payload.len() as u64)?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
