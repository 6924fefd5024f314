use crate::codec::{codec_for, ProtocolCodec, TelemetryCodecOptions};
use crate::compression::DEFAULT_COMPRESSION_THRESHOLD;
use crate::error::{LinkError, Result};
use crate::protocol::{CompressionType, Protocol, ValueKind};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

const SMALL_PAYLOAD_BYTES: usize = 256;
const LARGE_OBJECT_BYTES: usize = 1024;
const ZSTD_PREFERRED_BYTES: usize = 64 * 1024;

/// What the selector knows about a payload before encoding it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PayloadProfile {
    pub kind: ValueKind,
    pub estimated_size: usize,
    pub debug: bool,
}

impl PayloadProfile {
    pub fn new(kind: ValueKind, estimated_size: usize) -> Self {
        Self { kind, estimated_size, debug: false }
    }

    pub fn for_debugging(mut self) -> Self {
        self.debug = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub protocol: Protocol,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfiguration {
    pub protocol: Protocol,
    pub compression: CompressionType,
    pub validate_schema: bool,
    pub options: TelemetryCodecOptions,
}

/// Pure suitability table from payload profile to protocol.
pub fn recommend_protocol(profile: &PayloadProfile) -> Recommendation {
    let (protocol, reason) = if profile.debug {
        (Protocol::Json, "human-readable payload requested for debugging")
    } else {
        match profile.kind {
            ValueKind::Matrix | ValueKind::Vector => {
                (Protocol::Bincode, "numeric arrays pack densely with tagged binary")
            }
            ValueKind::Numeric | ValueKind::Boolean if profile.estimated_size <= SMALL_PAYLOAD_BYTES => {
                (Protocol::MessagePack, "small scalar payload, map binary has lowest overhead")
            }
            ValueKind::Numeric | ValueKind::Boolean => {
                (Protocol::Bincode, "large scalar payload, tagged binary avoids field names")
            }
            ValueKind::String => (Protocol::MessagePack, "text values are stored verbatim in map binary"),
            ValueKind::Object if profile.estimated_size <= LARGE_OBJECT_BYTES => {
                (Protocol::MessagePack, "structured payload keeps field names in map binary")
            }
            ValueKind::Object => (Protocol::Bincode, "large structured payload favours tagged binary"),
        }
    };

    Recommendation {
        protocol,
        reason: reason.to_string(),
    }
}

/// Chooses the compression algorithm for a payload of `estimated_size` bytes
/// encoded with a codec supporting `available` algorithms.
pub fn recommend_compression(estimated_size: usize, threshold: usize, available: &[CompressionType]) -> CompressionType {
    if estimated_size <= threshold {
        return CompressionType::None;
    }

    let preference = if estimated_size >= ZSTD_PREFERRED_BYTES {
        [CompressionType::Zstd, CompressionType::Lz4, CompressionType::Deflate]
    } else {
        [CompressionType::Lz4, CompressionType::Zstd, CompressionType::Deflate]
    };

    preference
        .into_iter()
        .find(|algorithm| available.contains(algorithm))
        .unwrap_or(CompressionType::None)
}

/// Caches one codec instance per protocol.
pub struct CodecSelector {
    codecs: Arc<RwLock<AHashMap<Protocol, Arc<dyn ProtocolCodec>>>>,
    compression_threshold: usize,
}

impl CodecSelector {
    pub fn new() -> Self {
        Self::with_compression_threshold(DEFAULT_COMPRESSION_THRESHOLD)
    }

    pub fn with_compression_threshold(threshold: usize) -> Self {
        Self {
            codecs: Arc::new(RwLock::new(AHashMap::new())),
            compression_threshold: threshold,
        }
    }

    pub fn codec(&self, protocol: Protocol) -> Result<Arc<dyn ProtocolCodec>> {
        {
            let codecs = self.codecs.read().map_err(LinkError::lock_poisoned)?;
            if let Some(codec) = codecs.get(&protocol) {
                return Ok(Arc::clone(codec));
            }
        }

        let mut codecs = self.codecs.write().map_err(LinkError::lock_poisoned)?;
        let codec = codecs
            .entry(protocol)
            .or_insert_with(|| {
                tracing::debug!(%protocol, "constructing codec");
                Arc::from(codec_for(protocol))
            });

        Ok(Arc::clone(codec))
    }

    pub fn cached_count(&self) -> usize {
        self.codecs.read().map(|codecs| codecs.len()).unwrap_or(0)
    }

    pub fn recommend(&self, profile: &PayloadProfile) -> Recommendation {
        recommend_protocol(profile)
    }

    pub fn get_telemetry_configuration(&self, kind: ValueKind, estimated_size: usize) -> Result<TelemetryConfiguration> {
        let recommendation = self.recommend(&PayloadProfile::new(kind, estimated_size));
        let codec = self.codec(recommendation.protocol)?;

        let compression = if codec.supports_compression() {
            recommend_compression(
                estimated_size,
                self.compression_threshold,
                &codec.supported_compression_algorithms(),
            )
        } else {
            CompressionType::None
        };

        Ok(TelemetryConfiguration {
            protocol: recommendation.protocol,
            compression,
            validate_schema: true,
            options: TelemetryCodecOptions::default(),
        })
    }
}

impl Default for CodecSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CodecSelector {
    fn clone(&self) -> Self {
        Self {
            codecs: Arc::clone(&self.codecs),
            compression_threshold: self.compression_threshold,
        }
    }
}
