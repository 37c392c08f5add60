//! Tagwire node.
//!
//! Production glue around `tagwire-core`:
//!
//! - [`RedbStorage`]: durable secrets, stream counters, reordering windows
//!   and transport latencies
//! - [`TokioScheduler`]: runs the key manager's rotation cycle and event
//!   handling on a dedicated thread
//! - [`ConnectionDispatcher`]: reads the tag of each accepted TCP
//!   connection, recognises it and hands the secured streams to a
//!   [`ConnectionHandler`]
//! - [`SystemEnv`]: wall-clock time
//!
//! Stream I/O is blocking. The dispatcher accepts connections on Tokio and
//! moves each one to the blocking pool once accepted.

#![forbid(unsafe_code)]

pub mod dispatcher;
pub mod error;
pub mod scheduler;
pub mod storage;
pub mod system_env;

pub use dispatcher::{
    ConnectionDispatcher, ConnectionHandler, DispatchOutcome, DispatcherConfig, SecuredConnection,
};
pub use error::NodeError;
pub use scheduler::TokioScheduler;
pub use storage::RedbStorage;
pub use system_env::SystemEnv;
