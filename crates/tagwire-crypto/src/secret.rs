//! Zero-on-drop secret buffer

use std::fmt;

use zeroize::Zeroize;

use crate::error::CryptoError;

/// Length of every secret, tag key and frame key in bytes.
pub const SECRET_LENGTH: usize = 32;

/// Fixed-length secret key material.
///
/// The buffer is zeroed when the value is dropped or explicitly erased.
/// The type is not `Copy`; duplicating a secret requires an explicit
/// [`Clone::clone`], and the clone is erased independently of the original.
///
/// # Security
///
/// - `Debug` never prints the bytes
/// - Equality is evaluated without early exit
pub struct SecretBytes([u8; SECRET_LENGTH]);

impl SecretBytes {
    /// Wrap raw key material. The caller's array is moved in.
    pub fn new(bytes: [u8; SECRET_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Copy key material out of a slice of exactly [`SECRET_LENGTH`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let Ok(array) = <[u8; SECRET_LENGTH]>::try_from(bytes) else {
            return Err(CryptoError::InvalidKeyLength {
                expected: SECRET_LENGTH,
                actual: bytes.len(),
            });
        };
        Ok(Self(array))
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SECRET_LENGTH] {
        &self.0
    }

    /// Overwrite the buffer with zeroes.
    ///
    /// Dropping the value has the same effect; this exists for owners that
    /// must erase before the value goes out of scope.
    pub fn erase(&mut self) {
        self.0.zeroize();
    }

    /// True if every byte is zero (e.g. after [`erase`](Self::erase)).
    pub fn is_erased(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Clone for SecretBytes {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl PartialEq for SecretBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0.iter().zip(other.0.iter()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
    }
}

impl Eq for SecretBytes {}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBytes(..)")
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_zeroes_buffer() {
        let mut secret = SecretBytes::new([0xAB; SECRET_LENGTH]);
        assert!(!secret.is_erased());

        secret.erase();
        assert!(secret.is_erased());
    }

    #[test]
    fn clone_is_independent() {
        let original = SecretBytes::new([7; SECRET_LENGTH]);
        let mut copy = original.clone();
        copy.erase();

        assert!(copy.is_erased());
        assert_eq!(original.as_bytes(), &[7; SECRET_LENGTH]);
    }

    #[test]
    fn debug_is_redacted() {
        let secret = SecretBytes::new([0x42; SECRET_LENGTH]);
        let shown = format!("{secret:?}");
        assert!(!shown.contains("42"));
        assert!(!shown.contains("66"));
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        let result = SecretBytes::from_slice(&[0u8; 16]);
        assert_eq!(result, Err(CryptoError::InvalidKeyLength { expected: 32, actual: 16 }));
    }
}
