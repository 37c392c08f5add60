//! Tagwire wire format.
//!
//! A secured connection on the wire is an optional stream tag followed by
//! a sequence of authenticated frames:
//!
//! ```text
//! [tag: 16 bytes, initiator only]
//! [frame 0] [frame 1] ... [final frame]
//!
//! frame = encrypt(header: 2 | payload | zero padding) | MAC: 16
//! ```
//!
//! Every frame except the final one is exactly the stream's frame length.
//! The final frame carries no padding and may be shorter. Frame numbers are
//! never transmitted; both sides count frames and mix the number into the
//! IV and the associated data, so reordering, truncation and splicing are
//! caught by the MAC.
//!
//! This crate is pure layout: encryption lives in `tagwire-crypto`.

#![forbid(unsafe_code)]

mod errors;
mod frame;
mod header;
mod nonce;

pub use errors::{ProtocolError, Result};
pub use frame::{DecodedFrame, decode_frame, encode_frame, plaintext_capacity, validate_frame_length};
pub use header::FrameHeader;
pub use nonce::{frame_aad, frame_iv};

/// Length of a stream tag.
pub const TAG_LENGTH: usize = 16;

/// Length of the frame header (final flag + payload length).
pub const HEADER_LENGTH: usize = 2;

/// Length of the authentication tag appended to every frame.
pub const MAC_LENGTH: usize = 16;

/// Length of the per-frame IV.
pub const IV_LENGTH: usize = 24;

/// Length of the per-frame associated data.
pub const AAD_LENGTH: usize = 6;

/// Largest (and default) ciphertext frame length, MAC included.
pub const MAX_FRAME_LENGTH: usize = 1024;

/// Largest payload a frame of [`MAX_FRAME_LENGTH`] can carry.
pub const MAX_PAYLOAD_LENGTH: usize = MAX_FRAME_LENGTH - HEADER_LENGTH - MAC_LENGTH;

/// Smallest usable frame length: header, one payload byte and the MAC.
pub const MIN_FRAME_LENGTH: usize = HEADER_LENGTH + MAC_LENGTH + 1;
