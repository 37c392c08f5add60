//! Durable secret storage.
//!
//! Implements [`tagwire_core::SecretStore`] on an embedded database so
//! secrets, reordering windows and stream counters survive restarts.

mod redb;

pub use self::redb::RedbStorage;
