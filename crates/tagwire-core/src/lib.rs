//! Tagwire Core
//!
//! Recognises which contact an anonymous incoming connection belongs to and
//! turns raw byte streams into authenticated, encrypted channels.
//!
//! # Architecture
//!
//! ```text
//!   Scheduler ──► KeyManager ──► SecretStore
//!                   │   ▲
//!       add/remove  │   │ accept_connection / get_connection_context
//!                   ▼   │
//!              TagRecognizer ──► ReorderingWindow (per secret)
//!                   │
//!                   ▼
//!           ConnectionContext ──► StreamReader / StreamWriter
//! ```
//!
//! - [`KeyManager`] owns every rotating secret, ratchets them forward as
//!   rotation periods pass and keeps the old, current and new generation of
//!   each endpoint live.
//! - [`TagRecognizer`] indexes the tags of every unseen stream number of
//!   every live secret and consumes each tag exactly once.
//! - [`StreamReader`] and [`StreamWriter`] wrap blocking byte streams with
//!   the frame format from `tagwire-proto`.
//!
//! Time, storage and scheduling are injected through [`Environment`],
//! [`SecretStore`] and [`Scheduler`] so the whole layer runs
//! deterministically in tests.
//!
//! # Concurrency
//!
//! The key manager and the recognizer each own their state behind their own
//! mutex. Neither calls into the other, or into storage, while holding its
//! state lock.

#![forbid(unsafe_code)]

pub mod context;
pub mod env;
pub mod ids;
pub mod key_manager;
pub mod recognizer;
pub mod rotation;
pub mod scheduler;
pub mod secret;
pub mod storage;
pub mod stream;
pub mod window;

pub use context::{ConnectionContext, Role};
pub use env::{Environment, ManualClock};
pub use ids::{ContactId, Endpoint, SecretId, TransportId};
pub use key_manager::{KeyManager, KeyManagerConfig, KeyManagerError, KeyManagerEvent};
pub use recognizer::{RecognizerError, TagRecognizer};
pub use rotation::{RotationSchedule, SecretPhase};
pub use scheduler::{ManualScheduler, Scheduler, TaskHandle};
pub use secret::RotatingSecret;
pub use storage::{ChaoticStorage, MemoryStorage, SecretStore, StorageError};
pub use stream::{
    StreamConfig, StreamError, StreamReader, StreamWriter, create_secured_reader,
    create_secured_writer,
};
pub use window::{ReorderingWindow, WindowChange, WindowError, WindowState};

// The wire constants and the primitives that fill them must agree.
const _: () = assert!(tagwire_proto::TAG_LENGTH == tagwire_crypto::TAG_LENGTH);
const _: () = assert!(tagwire_proto::MAC_LENGTH == tagwire_crypto::MAC_SIZE);
const _: () = assert!(tagwire_proto::IV_LENGTH == tagwire_crypto::NONCE_SIZE);
