//! Tagwire Cryptographic Primitives
//!
//! Pure, deterministic building blocks for the tagwire transport: a
//! one-way secret ratchet, stream tags and frame encryption. Nothing here
//! touches a clock, storage or the network.
//!
//! # Key Hierarchy
//!
//! Every (contact, transport) endpoint starts from one shared secret. The
//! secret is ratcheted once per rotation period, and each period's secret
//! yields a tag key per role and a frame key per stream and direction.
//!
//! ```text
//! Initial Secret (period 0)
//!        │
//!        ▼  ROTATE(p)
//! Period Secret p ──► ROTATE(p+1) ──► ...
//!        │
//!        ├─► A_TAG / B_TAG ──► HMAC(stream number) → Tag
//!        │
//!        └─► {A,B}_FRAME_{A,B}(stream number) → Frame Key
//!                                                  │
//!                                                  ▼
//!                                  XChaCha20-Poly1305 → Frames
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - The ratchet is HKDF-Expand keyed by the previous secret; no inverse
//!   operation exists in this crate
//! - Every secret lives in [`SecretBytes`], which zeroes its buffer on drop
//!
//! Role Separation:
//! - Tag keys differ between the alice and bob sides of an endpoint
//! - Frame keys differ per stream number, per side and per direction
//!
//! Unlinkability:
//! - Tags are PRF outputs; without the tag key an observer cannot link two
//!   tags to the same endpoint

#![forbid(unsafe_code)]

mod aead;
mod error;
mod kdf;
mod secret;
mod tag;

pub use aead::{FrameCipher, MAC_SIZE, NONCE_SIZE};
pub use error::CryptoError;
pub use kdf::{derive_frame_key, derive_initial_secret, derive_next_secret, derive_tag_key};
pub use secret::{SECRET_LENGTH, SecretBytes};
pub use tag::{TAG_LENGTH, Tag, compute_tag};
