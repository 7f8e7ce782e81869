//! Optional LZ4 compression of encoded messages.
//!
//! Every packet starts with a flag byte saying whether the rest is raw or
//! LZ4 with a prepended size. Small messages are never compressed, and a
//! payload that does not shrink (chunk bytes are already DEFLATE-compressed)
//! is sent raw.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use strata_config::NetworkConfig;

/// Rest of the packet is the message as encoded.
pub const FLAG_RAW: u8 = 0x00;

/// Rest of the packet is LZ4 with a u32 LE decompressed-size prefix.
pub const FLAG_LZ4: u8 = 0x01;

/// Upper bound for a claimed decompressed size.
pub const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// When to compress outgoing packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Minimum encoded size before compression is attempted.
    pub threshold: usize,
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 512,
            enabled: true,
        }
    }
}

impl CompressionConfig {
    pub fn from_config(network: &NetworkConfig) -> Self {
        Self {
            threshold: network.compression_threshold,
            enabled: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("packet has no compression flag")]
    EmptyPayload,
    #[error("unknown compression flag 0x{0:02X}")]
    UnknownFlag(u8),
    #[error("packet claims {0} decompressed bytes")]
    TooLarge(usize),
    #[error("lz4 decompression failed: {0}")]
    Lz4(#[from] lz4_flex::block::DecompressError),
}

/// Prefixes `data` with a flag byte, compressing it when that pays off.
pub fn compress_payload(data: &[u8], config: &CompressionConfig) -> Vec<u8> {
    if config.enabled && data.len() >= config.threshold {
        let compressed = compress_prepend_size(data);
        if compressed.len() < data.len() {
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(FLAG_LZ4);
            out.extend_from_slice(&compressed);
            return out;
        }
    }
    let mut out = Vec::with_capacity(1 + data.len());
    out.push(FLAG_RAW);
    out.extend_from_slice(data);
    out
}

/// Strips the flag byte and decompresses if needed.
pub fn decompress_payload(packet: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let (&flag, body) = packet.split_first().ok_or(CompressionError::EmptyPayload)?;
    match flag {
        FLAG_RAW => Ok(body.to_vec()),
        FLAG_LZ4 => {
            if let Some(prefix) = body.get(..4) {
                let claimed = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
                if claimed > MAX_DECOMPRESSED_SIZE {
                    return Err(CompressionError::TooLarge(claimed));
                }
            }
            Ok(decompress_size_prepended(body)?)
        }
        other => Err(CompressionError::UnknownFlag(other)),
    }
}
