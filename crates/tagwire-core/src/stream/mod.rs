//! Secured streams over raw byte connections.
//!
//! A [`StreamWriter`] turns written bytes into encrypted frames; a
//! [`StreamReader`] verifies and decrypts them. Each direction of a
//! connection has its own frame key and its own implicit frame counter
//! starting at 0, so frames must arrive in order.
//!
//! ```text
//!   initiator ──► [tag] frame₀ frame₁ ... frameₙ(final) ──► responder
//!   initiator ◄── frame₀ frame₁ ... frameₙ(final)        ◄── responder
//! ```
//!
//! Only the initiator sends a tag, once, before its first frame.

mod reader;
mod writer;

use std::io;

use tagwire_crypto::{SecretBytes, derive_frame_key};
use tagwire_proto::{MAX_FRAME_LENGTH, ProtocolError, validate_frame_length};
use thiserror::Error;

pub use reader::StreamReader;
pub use writer::StreamWriter;

use crate::context::ConnectionContext;

/// Stream framing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Ciphertext length of a full frame, MAC included
    pub frame_length: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { frame_length: MAX_FRAME_LENGTH }
    }
}

impl StreamConfig {
    /// Check the frame length is usable.
    ///
    /// # Errors
    ///
    /// - `StreamError::Format` if the frame length cannot hold a header,
    ///   a MAC and one payload byte, or exceeds `MAX_FRAME_LENGTH`
    pub fn validate(&self) -> Result<(), StreamError> {
        validate_frame_length(self.frame_length)
            .map_err(|source| StreamError::Format { frame_number: 0, source })
    }
}

/// Secured stream errors.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The underlying connection failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection ended in the middle of the stream
    #[error("stream truncated at frame {frame_number}")]
    Truncated {
        /// Frame that was expected
        frame_number: u64,
    },

    /// MAC verification failed
    #[error("authentication failed for frame {frame_number}")]
    Authentication {
        /// Frame that failed
        frame_number: u64,
    },

    /// The frame authenticated but its plaintext is malformed
    #[error("malformed frame {frame_number}: {source}")]
    Format {
        /// Frame that failed
        frame_number: u64,
        /// Layout violation
        source: ProtocolError,
    },

    /// The cipher refused to seal a frame
    #[error("encryption failed for frame {frame_number}")]
    Encryption {
        /// Frame that failed
        frame_number: u64,
    },

    /// Every frame number of this direction has been used
    #[error("frame counter exhausted")]
    FrameCounterExhausted,

    /// Write after close, or read after a failure
    #[error("stream closed")]
    Closed,
}

impl StreamError {
    /// Returns true if the peer sent something that could be tampering.
    ///
    /// Integrity failures tear the stream down and are never retried.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Truncated { .. } | Self::Authentication { .. } | Self::Format { .. })
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        if let StreamError::Io(e) = err {
            return e;
        }
        let kind = match &err {
            StreamError::Truncated { .. } => io::ErrorKind::UnexpectedEof,
            StreamError::Closed => io::ErrorKind::BrokenPipe,
            e if e.is_integrity_failure() => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Frame key of the initiator's stream (`from_initiator`) or the
/// responder's stream.
fn frame_key(ctx: &ConnectionContext, from_initiator: bool) -> SecretBytes {
    derive_frame_key(&ctx.secret, ctx.stream_number, ctx.alice, from_initiator)
}

/// Wrap `source` as the incoming half of the connection described by
/// `ctx`, using full-size frames.
pub fn create_secured_reader<R: io::Read>(source: R, ctx: &ConnectionContext) -> StreamReader<R> {
    StreamReader::new(source, &frame_key(ctx, !ctx.is_initiator()), StreamConfig::default())
}

/// Wrap `sink` as the outgoing half of the connection described by `ctx`,
/// using full-size frames.
///
/// If the local side is the initiator, the connection's tag is written
/// before the first frame.
pub fn create_secured_writer<W: io::Write>(sink: W, ctx: &ConnectionContext) -> StreamWriter<W> {
    StreamWriter::for_context(sink, ctx, StreamConfig::default())
}

/// [`create_secured_reader`] with an explicit frame length.
///
/// # Errors
///
/// Fails if `config` is invalid.
pub fn create_secured_reader_with_config<R: io::Read>(
    source: R,
    ctx: &ConnectionContext,
    config: StreamConfig,
) -> Result<StreamReader<R>, StreamError> {
    config.validate()?;
    Ok(StreamReader::new(source, &frame_key(ctx, !ctx.is_initiator()), config))
}

/// [`create_secured_writer`] with an explicit frame length.
///
/// # Errors
///
/// Fails if `config` is invalid.
pub fn create_secured_writer_with_config<W: io::Write>(
    sink: W,
    ctx: &ConnectionContext,
    config: StreamConfig,
) -> Result<StreamWriter<W>, StreamError> {
    config.validate()?;
    Ok(StreamWriter::for_context(sink, ctx, config))
}
