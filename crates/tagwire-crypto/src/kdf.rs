//! Labelled key derivation and the one-way secret ratchet
//!
//! All derivations are HKDF-SHA256-Expand with the parent secret as the
//! pseudorandom key and `label || 0x00 || context` as the info string,
//! where the context is a big-endian `u64`.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::secret::{SECRET_LENGTH, SecretBytes};

/// Label for the per-period ratchet step
const ROTATE_LABEL: &[u8] = b"ROTATE";

/// Label for an endpoint's period-0 secret
const FIRST_LABEL: &[u8] = b"FIRST";

/// Tag key labels
const A_TAG_LABEL: &[u8] = b"A_TAG";
const B_TAG_LABEL: &[u8] = b"B_TAG";

/// Frame key labels: `{side}_FRAME_{direction}` where direction A is the
/// initiator's stream and B is the responder's stream
const A_FRAME_A_LABEL: &[u8] = b"A_FRAME_A";
const A_FRAME_B_LABEL: &[u8] = b"A_FRAME_B";
const B_FRAME_A_LABEL: &[u8] = b"B_FRAME_A";
const B_FRAME_B_LABEL: &[u8] = b"B_FRAME_B";

/// Both HKDF calls only fail on lengths below (PRK) or far above (output)
/// one SHA-256 block, and every secret here is exactly one block.
#[allow(clippy::expect_used)]
fn kdf(secret: &SecretBytes, label: &[u8], context: u64) -> SecretBytes {
    let hkdf = Hkdf::<Sha256>::from_prk(secret.as_bytes()).expect("PRK is one SHA-256 block");

    // Capacity: longest label (9) + separator (1) + context (8)
    let mut info = Vec::with_capacity(18);
    info.extend_from_slice(label);
    info.push(0);
    info.extend_from_slice(&context.to_be_bytes());

    let mut output = [0u8; SECRET_LENGTH];
    hkdf.expand(&info, &mut output).expect("output is one SHA-256 block");

    SecretBytes::new(output)
}

/// Derive the period-0 secret of one transport from a pairing master
/// secret.
///
/// Different transport indices yield unrelated secrets, so compromising
/// one transport's chain reveals nothing about another's.
pub fn derive_initial_secret(master: &SecretBytes, transport_index: u32) -> SecretBytes {
    kdf(master, FIRST_LABEL, u64::from(transport_index))
}

/// Ratchet a secret forward into `period`.
///
/// `secret` must be the secret of `period - 1`. Applying this repeatedly
/// fast-forwards a chain; there is no operation that steps backwards.
///
/// # Security
///
/// - One-way: recovering the input from the output requires inverting
///   HKDF-Expand
/// - The caller is responsible for erasing the input once it is no longer
///   live
pub fn derive_next_secret(secret: &SecretBytes, period: u64) -> SecretBytes {
    kdf(secret, ROTATE_LABEL, period)
}

/// Derive the key used to compute tags for streams initiated by the
/// `alice` (or bob) side of an endpoint.
pub fn derive_tag_key(secret: &SecretBytes, alice: bool) -> SecretBytes {
    let label = if alice { A_TAG_LABEL } else { B_TAG_LABEL };
    kdf(secret, label, 0)
}

/// Derive the frame key for one direction of one stream.
///
/// `alice` is the flag of the side that initiated the stream. `initiator`
/// selects the initiator-to-responder direction (`true`) or the reverse.
pub fn derive_frame_key(
    secret: &SecretBytes,
    stream_number: u32,
    alice: bool,
    initiator: bool,
) -> SecretBytes {
    let label = match (alice, initiator) {
        (true, true) => A_FRAME_A_LABEL,
        (true, false) => A_FRAME_B_LABEL,
        (false, true) => B_FRAME_A_LABEL,
        (false, false) => B_FRAME_B_LABEL,
    };
    kdf(secret, label, u64::from(stream_number))
}
