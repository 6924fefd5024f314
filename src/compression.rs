use crate::error::{CodecError, Result};
use crate::protocol::CompressionType;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::borrow::Cow;
use std::io::{Read, Write};

pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;
pub const DEFAULT_MAX_DECOMPRESSED_BYTES: usize = 64 * 1024 * 1024;
const ZSTD_LEVEL: i32 = 3;

impl CompressionType {
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    pub fn from_tag(tag: u8) -> std::result::Result<Self, CodecError> {
        match tag {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Deflate),
            2 => Ok(CompressionType::Lz4),
            3 => Ok(CompressionType::Zstd),
            other => Err(CodecError::UnsupportedAlgorithm(format!("tag {}", other))),
        }
    }
}

/// Size-gated payload compression over interchangeable algorithms.
#[derive(Debug, Clone)]
pub struct CompressionManager {
    enabled: Vec<CompressionType>,
    max_decompressed_bytes: usize,
}

impl CompressionManager {
    pub fn new() -> Self {
        Self {
            enabled: CompressionType::ALL.to_vec(),
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
        }
    }

    /// Restricts the manager to `algorithms`; `None` is always accepted.
    pub fn with_algorithms(algorithms: &[CompressionType]) -> Self {
        let mut enabled = vec![CompressionType::None];
        enabled.extend(algorithms.iter().copied().filter(|a| *a != CompressionType::None));
        Self {
            enabled,
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
        }
    }

    /// Payloads that would inflate past `bytes` are rejected.
    pub fn with_max_decompressed_size(mut self, bytes: usize) -> Self {
        self.max_decompressed_bytes = bytes;
        self
    }

    pub fn max_decompressed_size(&self) -> usize {
        self.max_decompressed_bytes
    }

    pub fn supported_algorithms(&self) -> &[CompressionType] {
        &self.enabled
    }

    pub fn supports(&self, algorithm: CompressionType) -> bool {
        self.enabled.contains(&algorithm)
    }

    /// Small payloads often grow under compression, so only payloads strictly
    /// larger than the threshold qualify.
    pub fn should_compress(&self, payload_size: usize, threshold_bytes: usize) -> bool {
        payload_size > threshold_bytes
    }

    pub fn compress<'a>(&self, data: &'a [u8], algorithm: CompressionType) -> Result<Cow<'a, [u8]>> {
        self.ensure_supported(algorithm)?;

        let compressed = match algorithm {
            CompressionType::None => return Ok(Cow::Borrowed(data)),
            CompressionType::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| CodecError::Compression(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| CodecError::Compression(e.to_string()))?
            }
            CompressionType::Lz4 => lz4_flex::compress_prepend_size(data),
            CompressionType::Zstd => zstd::encode_all(data, ZSTD_LEVEL)
                .map_err(|e| CodecError::Compression(e.to_string()))?,
        };

        Ok(Cow::Owned(compressed))
    }

    pub fn decompress<'a>(&self, data: &'a [u8], algorithm: CompressionType) -> Result<Cow<'a, [u8]>> {
        self.ensure_supported(algorithm)?;

        let decompressed = match algorithm {
            CompressionType::None => return Ok(Cow::Borrowed(data)),
            CompressionType::Deflate => self.read_capped(DeflateDecoder::new(data), data.len())?,
            CompressionType::Lz4 => {
                let declared = data
                    .get(..4)
                    .and_then(|prefix| <[u8; 4]>::try_from(prefix).ok())
                    .map(u32::from_le_bytes)
                    .ok_or_else(|| CodecError::Decompression("lz4 payload missing size prefix".to_string()))?;
                if declared as usize > self.max_decompressed_bytes {
                    return Err(self.too_large().into());
                }
                lz4_flex::decompress_size_prepended(data)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?
            }
            CompressionType::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(data)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?;
                self.read_capped(decoder, data.len())?
            }
        };

        Ok(Cow::Owned(decompressed))
    }

    fn read_capped(&self, reader: impl Read, input_len: usize) -> std::result::Result<Vec<u8>, CodecError> {
        let limit = self.max_decompressed_bytes;
        let mut out = Vec::with_capacity(input_len.saturating_mul(2).min(limit));
        reader
            .take(limit as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        if out.len() > limit {
            return Err(self.too_large());
        }
        Ok(out)
    }

    fn too_large(&self) -> CodecError {
        CodecError::Decompression(format!(
            "decompressed payload exceeds {} bytes",
            self.max_decompressed_bytes
        ))
    }

    fn ensure_supported(&self, algorithm: CompressionType) -> std::result::Result<(), CodecError> {
        if self.supports(algorithm) {
            Ok(())
        } else {
            Err(CodecError::UnsupportedAlgorithm(algorithm.name().to_string()))
        }
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}

pub fn compression_ratio(original_size: usize, compressed_size: usize) -> f64 {
    if compressed_size == 0 {
        0.0
    } else {
        original_size as f64 / compressed_size as f64
    }
}
