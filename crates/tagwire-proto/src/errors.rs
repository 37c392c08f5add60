//! Error types for frame layout

use thiserror::Error;

/// Result alias for frame layout operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Frame layout errors.
///
/// Every variant is an integrity failure when raised on received data: the
/// frame authenticated but its contents are malformed, so the stream must
/// be torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer too short to hold the structure being parsed
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum number of bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Plaintext longer than the frame length allows
    #[error("frame too long: {size} bytes exceeds {max}")]
    FrameTooLong {
        /// Plaintext size
        size: usize,
        /// Largest allowed plaintext size
        max: usize,
    },

    /// Declared payload length exceeds what a frame can carry
    #[error("payload too large: {size} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Declared payload length
        size: usize,
        /// Largest payload for this frame length
        max: usize,
    },

    /// Declared payload length exceeds the bytes actually present
    #[error("payload truncated: header declares {declared} bytes, {available} present")]
    PayloadTruncated {
        /// Payload length from the header
        declared: usize,
        /// Bytes following the header
        available: usize,
    },

    /// A byte after the declared payload is not zero
    #[error("non-zero padding at offset {offset}")]
    NonZeroPadding {
        /// Offset of the first offending byte within the plaintext
        offset: usize,
    },

    /// A frame without the final flag was shorter than the frame length
    #[error("short non-final frame: {size} bytes, expected {expected}")]
    ShortNonFinalFrame {
        /// Plaintext size received
        size: usize,
        /// Required plaintext size
        expected: usize,
    },

    /// Configured frame length is outside the supported range
    #[error("invalid frame length {size}: must be between {min} and {max}")]
    InvalidFrameLength {
        /// Configured length
        size: usize,
        /// Smallest supported length
        min: usize,
        /// Largest supported length
        max: usize,
    },
}
