//! Frame plaintext layout.
//!
//! A frame's plaintext is `header | payload | zero padding`. Non-final
//! frames are padded to exactly [`plaintext_capacity`] bytes; the final
//! frame is not padded. The MAC is appended after encryption by the stream
//! layer.

use bytes::BufMut;

use crate::{
    FrameHeader, HEADER_LENGTH, MAC_LENGTH, MAX_FRAME_LENGTH, MIN_FRAME_LENGTH,
    errors::{ProtocolError, Result},
};

/// Check that a frame length is usable.
///
/// # Errors
///
/// - `ProtocolError::InvalidFrameLength` if `frame_length` is outside
///   [`MIN_FRAME_LENGTH`]`..=`[`MAX_FRAME_LENGTH`]
pub fn validate_frame_length(frame_length: usize) -> Result<()> {
    if (MIN_FRAME_LENGTH..=MAX_FRAME_LENGTH).contains(&frame_length) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidFrameLength {
            size: frame_length,
            min: MIN_FRAME_LENGTH,
            max: MAX_FRAME_LENGTH,
        })
    }
}

/// Plaintext bytes of a full (non-final) frame: the frame length minus the
/// MAC.
pub fn plaintext_capacity(frame_length: usize) -> usize {
    frame_length.saturating_sub(MAC_LENGTH)
}

/// Write one frame's plaintext into `dst`.
///
/// Non-final frames are zero-padded to [`plaintext_capacity`]; the final
/// frame is written without padding. Returns the number of bytes written,
/// which is the plaintext length mixed into the frame's AAD.
///
/// # Errors
///
/// - `ProtocolError::PayloadTooLarge` if `payload` does not fit a frame of
///   `frame_length` bytes
pub fn encode_frame(
    dst: &mut impl BufMut,
    payload: &[u8],
    is_final: bool,
    frame_length: usize,
) -> Result<usize> {
    let header = FrameHeader::new(payload.len(), is_final, frame_length)?;

    dst.put_slice(&header.to_bytes());
    dst.put_slice(payload);

    let mut written = HEADER_LENGTH + payload.len();
    if !is_final {
        let padding = plaintext_capacity(frame_length).saturating_sub(written);
        dst.put_bytes(0, padding);
        written += padding;
    }

    Ok(written)
}

/// A validated frame plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame<'a> {
    /// True if this was the last frame of the stream
    pub is_final: bool,
    /// Payload bytes, borrowed from the plaintext
    pub payload: &'a [u8],
}

/// Validate a decrypted frame plaintext and locate its payload.
///
/// Checks, in order: the header parses and its payload length fits the
/// frame length, the plaintext is no longer than a full frame, the declared
/// payload is present, a non-final frame is exactly full length, and every
/// byte after the payload is zero.
///
/// # Errors
///
/// Every error is an integrity failure. The caller must tear down the
/// stream and must not reveal which check failed to the peer.
///
/// # Security
///
/// - Padding Oracle: padding is checked after authentication, and every
///   byte is checked, so malformed padding cannot be used to probe
///   plaintext.
/// - Truncation: a short frame is only accepted when it carries the final
///   flag, which is itself authenticated.
pub fn decode_frame(plaintext: &[u8], frame_length: usize) -> Result<DecodedFrame<'_>> {
    let header = FrameHeader::from_bytes(plaintext, frame_length)?;

    let capacity = plaintext_capacity(frame_length);
    if plaintext.len() > capacity {
        return Err(ProtocolError::FrameTooLong { size: plaintext.len(), max: capacity });
    }

    let body = &plaintext[HEADER_LENGTH..];
    let payload_length = header.payload_length();
    if payload_length > body.len() {
        return Err(ProtocolError::PayloadTruncated {
            declared: payload_length,
            available: body.len(),
        });
    }

    if !header.is_final() && plaintext.len() != capacity {
        return Err(ProtocolError::ShortNonFinalFrame { size: plaintext.len(), expected: capacity });
    }

    let (payload, padding) = body.split_at(payload_length);
    if let Some(position) = padding.iter().position(|b| *b != 0) {
        return Err(ProtocolError::NonZeroPadding {
            offset: HEADER_LENGTH + payload_length + position,
        });
    }

    Ok(DecodedFrame { is_final: header.is_final(), payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_final_frame_is_padded() {
        let mut buf = Vec::new();
        let written = encode_frame(&mut buf, b"abc", false, 64).unwrap();

        assert_eq!(written, 48);
        assert_eq!(buf.len(), 48);
        assert_eq!(&buf[..5], &[0x00, 0x03, b'a', b'b', b'c']);
        assert!(buf[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn final_frame_is_not_padded() {
        let mut buf = Vec::new();
        let written = encode_frame(&mut buf, b"abc", true, 64).unwrap();

        assert_eq!(written, 5);
        assert_eq!(buf, [0x80, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn empty_final_frame() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, &[], true, 64).unwrap();

        let decoded = decode_frame(&buf, 64).unwrap();
        assert!(decoded.is_final);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn rejects_non_zero_padding() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, b"abc", false, 64).unwrap();
        buf[40] = 1;

        assert_eq!(decode_frame(&buf, 64), Err(ProtocolError::NonZeroPadding { offset: 40 }));
    }

    #[test]
    fn rejects_short_non_final_frame() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, b"abc", false, 64).unwrap();
        buf.truncate(20);

        assert_eq!(
            decode_frame(&buf, 64),
            Err(ProtocolError::ShortNonFinalFrame { size: 20, expected: 48 })
        );
    }

    #[test]
    fn rejects_payload_past_end() {
        let buf = [0x80, 0x10, 1, 2, 3];
        assert_eq!(
            decode_frame(&buf, 64),
            Err(ProtocolError::PayloadTruncated { declared: 16, available: 3 })
        );
    }

    #[test]
    fn final_frame_may_carry_zero_padding() {
        let buf = [0x80, 0x01, 9, 0, 0, 0];
        let decoded = decode_frame(&buf, 64).unwrap();
        assert_eq!(decoded.payload, &[9]);
    }

    #[test]
    fn frame_length_bounds() {
        assert!(validate_frame_length(MAX_FRAME_LENGTH).is_ok());
        assert!(validate_frame_length(MIN_FRAME_LENGTH).is_ok());
        assert!(validate_frame_length(MIN_FRAME_LENGTH - 1).is_err());
        assert!(validate_frame_length(MAX_FRAME_LENGTH + 1).is_err());
    }
}
