use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unsupported compression algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Decompression failed: {0}")]
    Decompression(String),
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Schema already registered: {0}")]
    SchemaConflict(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl LinkError {
    /// Whether the same operation may succeed with a different protocol,
    /// fallback path, or after the connection recovers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::Integrity(_)
                | LinkError::Protocol(_)
                | LinkError::Codec(_)
                | LinkError::Transport(_)
                | LinkError::ConnectionClosed
        )
    }

    pub(crate) fn lock_poisoned(what: impl std::fmt::Display) -> Self {
        LinkError::Unknown(format!("Lock poisoned: {}", what))
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_is_not_retryable() {
        assert!(!LinkError::Validation("bad shape".to_string()).is_retryable());
        assert!(!LinkError::Config("capacity".to_string()).is_retryable());
    }

    #[test]
    fn test_codec_error_converts() {
        let err: LinkError = CodecError::UnsupportedAlgorithm("brotli".to_string()).into();
        assert!(matches!(err, LinkError::Codec(CodecError::UnsupportedAlgorithm(_))));
        assert!(err.is_retryable());
    }
}
