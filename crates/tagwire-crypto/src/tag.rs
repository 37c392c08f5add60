//! Stream tags

use std::fmt;

use hmac::{Hmac, Mac, digest::generic_array::GenericArray};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::secret::{SECRET_LENGTH, SecretBytes};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 block size; HMAC zero-pads shorter keys to this length.
const HMAC_BLOCK_LENGTH: usize = 64;

/// Length of a stream tag on the wire.
pub const TAG_LENGTH: usize = 16;

/// Pseudorandom identifier of one stream of one rotating secret.
///
/// Sent in the clear by the connection initiator before the first frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag([u8; TAG_LENGTH]);

impl Tag {
    /// Wrap tag bytes read off the wire.
    pub fn from_bytes(bytes: [u8; TAG_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw tag bytes.
    pub fn as_bytes(&self) -> &[u8; TAG_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Compute the tag of `stream_number` under `tag_key`.
///
/// `tag = HMAC-SHA256(tag_key, stream_number)` truncated to
/// [`TAG_LENGTH`] bytes, with the stream number encoded big-endian.
pub fn compute_tag(tag_key: &SecretBytes, stream_number: u32) -> Tag {
    let mut block = Zeroizing::new([0u8; HMAC_BLOCK_LENGTH]);
    block[..SECRET_LENGTH].copy_from_slice(tag_key.as_bytes());
    let mut mac = <HmacSha256 as Mac>::new(GenericArray::from_slice(block.as_slice()));
    mac.update(&stream_number.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let mut tag = [0u8; TAG_LENGTH];
    tag.copy_from_slice(&digest[..TAG_LENGTH]);
    Tag(tag)
}
