//! Error types for sinkhole
//!
//! This module defines the main error type used throughout sinkhole. Errors
//! are annotated at each layer (codec, archive, backend) with the operation
//! and path so the topmost driver can decide whether to continue or abort.

use thiserror::Error;

/// Result type alias for sinkhole operations
pub type Result<T> = std::result::Result<T, SinkholeError>;

/// Main error type for sinkhole operations
#[derive(Error, Debug)]
pub enum SinkholeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Archive error: {0}")]
    Archive(String),

    /// Archive payload ended where the framing said it should not.
    /// `offset` is the stream position at which the archive became unreadable.
    #[error("corrupted archive after {offset} bytes: {reason}")]
    Corrupted { offset: u64, reason: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Replay error: {0}")]
    Replay(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}

impl SinkholeError {
    /// Create an archive error from a message
    pub fn archive_msg(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    /// Create a backend error from a message
    pub fn backend_msg(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a codec error from a message
    pub fn codec_msg(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SinkholeError::Config("missing tls key".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing tls key");

        let err = SinkholeError::Corrupted {
            offset: 1024,
            reason: "unexpected end of stream".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "corrupted archive after 1024 bytes: unexpected end of stream"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SinkholeError = io_err.into();
        assert!(matches!(err, SinkholeError::Io(_)));
    }
}
