//! Frame encryption using `XChaCha20-Poly1305`
//!
//! Frames are sealed in place with a detached MAC so the stream layer can
//! keep one fixed-size buffer per direction.

use chacha20poly1305::{
    Tag as PolyTag, XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};

use crate::{error::CryptoError, secret::SecretBytes};

/// Poly1305 tag size (16 bytes)
pub const MAC_SIZE: usize = 16;

/// `XChaCha20` nonce size (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// AEAD keyed with one frame key.
///
/// One instance serves every frame of one stream direction; the caller
/// must supply a distinct nonce per frame.
pub struct FrameCipher {
    cipher: XChaCha20Poly1305,
}

impl FrameCipher {
    /// Key a cipher with a frame key.
    pub fn new(key: &SecretBytes) -> Self {
        Self { cipher: XChaCha20Poly1305::new(key.as_bytes().into()) }
    }

    /// Encrypt `buffer` in place and return the detached MAC.
    ///
    /// `aad` is authenticated but not encrypted.
    ///
    /// # Errors
    ///
    /// - `EncryptionFailed`: the buffer exceeds what the cipher can encrypt
    ///   under one nonce. Never happens for frame-sized buffers.
    pub fn seal_in_place(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buffer: &mut [u8],
    ) -> Result<[u8; MAC_SIZE], CryptoError> {
        let tag = self
            .cipher
            .encrypt_in_place_detached(XNonce::from_slice(nonce), aad, buffer)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(tag.as_slice());
        Ok(mac)
    }

    /// Verify `mac` and decrypt `buffer` in place.
    ///
    /// # Errors
    ///
    /// - `AuthenticationFailed`: MAC, AAD, nonce or ciphertext was altered.
    ///   The buffer contents are unspecified and must be discarded.
    pub fn open_in_place(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buffer: &mut [u8],
        mac: &[u8; MAC_SIZE],
    ) -> Result<(), CryptoError> {
        self.cipher
            .decrypt_in_place_detached(XNonce::from_slice(nonce), aad, buffer, PolyTag::from_slice(mac))
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}
