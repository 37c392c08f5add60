//! Per-frame IV and associated data.
//!
//! Both are derived from the implicit frame number, which starts at 0 for
//! each direction of each stream and is never transmitted.

use crate::{AAD_LENGTH, IV_LENGTH};

/// IV for frame `frame_number`: the number as 4 bytes big-endian, then
/// zeroes.
///
/// Each frame key is used for a single stream direction, so the frame
/// number alone makes every IV unique under its key.
pub fn frame_iv(frame_number: u32) -> [u8; IV_LENGTH] {
    let mut iv = [0u8; IV_LENGTH];
    iv[0..4].copy_from_slice(&frame_number.to_be_bytes());
    iv
}

/// Associated data for frame `frame_number` carrying `plaintext_length`
/// bytes of plaintext (header, payload and padding; MAC excluded).
///
/// Layout: frame number (4 bytes BE) then plaintext length (2 bytes BE).
pub fn frame_aad(frame_number: u32, plaintext_length: u16) -> [u8; AAD_LENGTH] {
    let mut aad = [0u8; AAD_LENGTH];
    aad[0..4].copy_from_slice(&frame_number.to_be_bytes());
    aad[4..6].copy_from_slice(&plaintext_length.to_be_bytes());
    aad
}
