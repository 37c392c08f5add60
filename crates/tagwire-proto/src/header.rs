//! Frame header with zero-copy parsing.
//!
//! The header is the first two bytes of every frame's plaintext. It is
//! encrypted along with the payload, so an observer sees neither the
//! payload length nor whether a frame is the last one.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    HEADER_LENGTH, MAC_LENGTH,
    errors::{ProtocolError, Result},
};

/// Two-byte frame header (Big Endian).
///
/// ```text
/// bit 15      final-frame flag
/// bits 0..15  payload length
/// ```
///
/// # Security
///
/// Every 16-bit pattern is a valid `FrameHeader`, so casting untrusted
/// bytes cannot fail structurally. The payload length is bounded against
/// the stream's frame length in [`FrameHeader::from_bytes`]; an
/// authenticated header that claims more than the frame can hold is an
/// integrity failure.
#[repr(C, packed)]
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    word: [u8; 2],
}

impl FrameHeader {
    /// Size of the serialized header (2 bytes)
    pub const SIZE: usize = HEADER_LENGTH;

    /// Bit carrying the final-frame flag
    const FINAL_BIT: u16 = 0x8000;

    /// Largest payload length the 15-bit field can express
    pub const MAX_ENCODABLE_LENGTH: usize = 0x7FFF;

    /// Largest payload a frame of `frame_length` ciphertext bytes can carry.
    pub fn max_payload_length(frame_length: usize) -> usize {
        frame_length.saturating_sub(HEADER_LENGTH + MAC_LENGTH)
    }

    /// Build a header for a frame of `frame_length` ciphertext bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if `payload_length` exceeds
    ///   `frame_length - HEADER_LENGTH - MAC_LENGTH`
    pub fn new(payload_length: usize, is_final: bool, frame_length: usize) -> Result<Self> {
        let max = Self::max_payload_length(frame_length).min(Self::MAX_ENCODABLE_LENGTH);
        if payload_length > max {
            return Err(ProtocolError::PayloadTooLarge { size: payload_length, max });
        }

        let mut value = payload_length as u16;
        if is_final {
            value |= Self::FINAL_BIT;
        }
        Ok(Self { word: value.to_be_bytes() })
    }

    /// Parse the header at the start of `bytes` (zero-copy).
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if fewer than 2 bytes are given
    /// - `ProtocolError::PayloadTooLarge` if the declared payload length
    ///   exceeds what a frame of `frame_length` bytes can carry
    pub fn from_bytes(bytes: &[u8], frame_length: usize) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort { expected: Self::SIZE, actual: bytes.len() })?
            .0;

        let max = Self::max_payload_length(frame_length);
        if header.payload_length() > max {
            return Err(ProtocolError::PayloadTooLarge { size: header.payload_length(), max });
        }

        Ok(header)
    }

    /// Serialize header to bytes (zero-copy)
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// True if this is the last frame of the stream.
    #[must_use]
    pub fn is_final(&self) -> bool {
        u16::from_be_bytes(self.word) & Self::FINAL_BIT != 0
    }

    /// Number of payload bytes following the header.
    #[must_use]
    pub fn payload_length(&self) -> usize {
        usize::from(u16::from_be_bytes(self.word) & !Self::FINAL_BIT)
    }
}

impl fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHeader")
            .field("is_final", &self.is_final())
            .field("payload_length", &self.payload_length())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_FRAME_LENGTH;

    #[test]
    fn final_flag_is_high_bit() {
        let header = FrameHeader::new(5, true, MAX_FRAME_LENGTH).unwrap();
        assert_eq!(header.to_bytes(), [0x80, 0x05]);
        assert!(header.is_final());
        assert_eq!(header.payload_length(), 5);
    }

    #[test]
    fn non_final_header_layout() {
        let header = FrameHeader::new(0x0123, false, MAX_FRAME_LENGTH).unwrap();
        assert_eq!(header.to_bytes(), [0x01, 0x23]);
        assert!(!header.is_final());
    }

    #[test]
    fn rejects_payload_beyond_frame_bound() {
        let max = MAX_FRAME_LENGTH - HEADER_LENGTH - MAC_LENGTH;
        assert!(FrameHeader::new(max, false, MAX_FRAME_LENGTH).is_ok());

        let result = FrameHeader::new(max + 1, false, MAX_FRAME_LENGTH);
        assert_eq!(result, Err(ProtocolError::PayloadTooLarge { size: max + 1, max }));
    }

    #[test]
    fn parse_rejects_oversized_declared_length() {
        let bytes = [0x80, 0xFF, 0x00];
        let result = FrameHeader::from_bytes(&bytes, 64);
        assert_eq!(result, Err(ProtocolError::PayloadTooLarge { size: 0xFF, max: 46 }));
    }

    #[test]
    fn parse_rejects_short_buffer() {
        let result = FrameHeader::from_bytes(&[0x80], MAX_FRAME_LENGTH);
        assert_eq!(result, Err(ProtocolError::FrameTooShort { expected: 2, actual: 1 }));
    }

    #[test]
    fn parse_round_trip() {
        let header = FrameHeader::new(1000, true, MAX_FRAME_LENGTH).unwrap();
        let bytes = header.to_bytes();
        let parsed = FrameHeader::from_bytes(&bytes, MAX_FRAME_LENGTH).unwrap();
        assert_eq!(*parsed, header);
    }
}
