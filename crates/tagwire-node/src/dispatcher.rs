//! TCP connection dispatch.
//!
//! Every incoming connection starts with a 16-byte tag. The dispatcher
//! reads it under a timeout, asks the key manager who sent it and hands
//! the secured streams of recognised connections to a [`ConnectionHandler`].
//! Connections with unknown tags are closed without a reply, so a scanner
//! cannot tell a tagwire node from a closed port that happens to accept.
//!
//! # Threading
//!
//! Connections are accepted on Tokio and dispatched on the blocking pool:
//! tag recognition touches storage and the secured streams are blocking.
//! At most `max_connections` connections are dispatched at once.

use std::{
    io::{self, Read},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use tagwire_core::{
    ConnectionContext, ContactId, Environment, KeyManager, Role, Scheduler, SecretStore,
    StreamReader, StreamWriter, TransportId, create_secured_reader, create_secured_writer,
};
use tagwire_crypto::{TAG_LENGTH, Tag};
use tokio::{net::TcpListener, sync::Semaphore};

use crate::error::NodeError;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a new connection may take to send its tag
    pub tag_read_timeout: Duration,
    /// Connections dispatched concurrently
    pub max_connections: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { tag_read_timeout: Duration::from_secs(30), max_connections: 64 }
    }
}

/// A connection whose tag was recognised (or that we opened), wrapped in
/// its secured streams.
pub struct SecuredConnection {
    /// Remote contact
    pub contact: ContactId,
    /// Rotation period of the connection's secret
    pub period: u64,
    /// Stream number within the period
    pub stream_number: u32,
    /// Local role
    pub role: Role,
    /// Decrypts what the remote side sends
    pub reader: StreamReader<TcpStream>,
    /// Encrypts what we send; writes the tag first if we initiated
    pub writer: StreamWriter<TcpStream>,
}

impl SecuredConnection {
    fn new(stream: TcpStream, ctx: &ConnectionContext) -> io::Result<Self> {
        let reader = create_secured_reader(stream.try_clone()?, ctx);
        let writer = create_secured_writer(stream, ctx);
        Ok(Self {
            contact: ctx.contact,
            period: ctx.period,
            stream_number: ctx.stream_number,
            role: ctx.role,
            reader,
            writer,
        })
    }
}

/// Application-side consumer of recognised connections.
///
/// Called on a blocking thread; the connection is closed when the handler
/// drops it.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve one connection.
    ///
    /// # Errors
    ///
    /// Errors are logged by the dispatcher and close the connection.
    fn handle(&self, connection: SecuredConnection) -> Result<(), NodeError>;
}

/// What happened to one incoming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Tag recognised, handler ran
    Accepted(ContactId),
    /// Tag not ours (or connection closed before sending one); closed
    Unrecognised,
    /// No tag within `tag_read_timeout`; closed
    TimedOut,
}

/// Routes incoming connections on one transport to a handler.
pub struct ConnectionDispatcher<E: Environment, S: SecretStore, R: Scheduler, H: ConnectionHandler>
{
    manager: Arc<KeyManager<E, S, R>>,
    transport: TransportId,
    handler: H,
    config: DispatcherConfig,
}

impl<E, S, R, H> ConnectionDispatcher<E, S, R, H>
where
    E: Environment,
    S: SecretStore,
    R: Scheduler,
    H: ConnectionHandler,
{
    /// Create a dispatcher for connections arriving on `transport`.
    pub fn new(
        manager: Arc<KeyManager<E, S, R>>,
        transport: TransportId,
        handler: H,
        config: DispatcherConfig,
    ) -> Self {
        Self { manager, transport, handler, config }
    }

    /// Transport this dispatcher serves.
    pub fn transport(&self) -> &TransportId {
        &self.transport
    }

    /// Recognise one accepted connection and run the handler on it.
    ///
    /// Blocks for up to `tag_read_timeout` waiting for the tag, then for as
    /// long as the handler runs.
    ///
    /// # Errors
    ///
    /// - `Transport` if the socket fails
    /// - `KeyManager` if tag recognition fails (storage error); the
    ///   connection is closed
    /// - whatever the handler returns
    pub fn dispatch(&self, mut stream: TcpStream) -> Result<DispatchOutcome, NodeError> {
        let timeout = Some(self.config.tag_read_timeout).filter(|t| !t.is_zero());
        stream.set_read_timeout(timeout)?;

        let mut tag = [0u8; TAG_LENGTH];
        if let Err(e) = stream.read_exact(&mut tag) {
            return match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    tracing::debug!("no tag before timeout");
                    Ok(DispatchOutcome::TimedOut)
                },
                io::ErrorKind::UnexpectedEof => Ok(DispatchOutcome::Unrecognised),
                _ => Err(e.into()),
            };
        }

        let Some(ctx) = self.manager.accept_connection(&self.transport, &Tag::from_bytes(tag))?
        else {
            tracing::debug!(transport = %self.transport, "unrecognised tag, closing");
            return Ok(DispatchOutcome::Unrecognised);
        };

        stream.set_read_timeout(None)?;
        let contact = ctx.contact;
        tracing::info!(
            contact = %contact,
            transport = %self.transport,
            period = ctx.period,
            stream = ctx.stream_number,
            "incoming connection recognised"
        );

        let connection = SecuredConnection::new(stream, &ctx)?;
        drop(ctx);
        self.handler.handle(connection)?;
        Ok(DispatchOutcome::Accepted(contact))
    }

    /// Open an outgoing connection to `contact` at `addr`.
    ///
    /// Returns `Ok(None)` if the key manager has no current secret for the
    /// contact on this transport. The tag goes out with the first write or
    /// flush.
    ///
    /// # Errors
    ///
    /// - `KeyManager` if the stream counter could not be advanced
    /// - `Transport` if the connection fails
    pub fn connect(
        &self,
        contact: ContactId,
        addr: impl ToSocketAddrs,
    ) -> Result<Option<SecuredConnection>, NodeError> {
        let Some(ctx) = self.manager.get_connection_context(contact, &self.transport)? else {
            return Ok(None);
        };
        let stream = TcpStream::connect(addr)?;
        tracing::debug!(
            contact = %contact,
            period = ctx.period,
            stream = ctx.stream_number,
            "outgoing connection opened"
        );
        Ok(Some(SecuredConnection::new(stream, &ctx)?))
    }

    /// Accept connections from `listener` until the listener fails.
    ///
    /// Each accepted connection is dispatched on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the listener stops accepting.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), NodeError> {
        let permits = Arc::new(Semaphore::new(self.config.max_connections.max(1)));

        loop {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                return Ok(());
            };
            let (socket, peer) = listener.accept().await?;

            let stream = match socket.into_std().and_then(|s| s.set_nonblocking(false).map(|()| s)) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "failed to prepare connection");
                    continue;
                },
            };

            let dispatcher = Arc::clone(&self);
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                dispatcher.log_outcome(peer, dispatcher.dispatch(stream));
            });
        }
    }

    fn log_outcome(&self, peer: SocketAddr, outcome: Result<DispatchOutcome, NodeError>) {
        match outcome {
            Ok(outcome) => tracing::debug!(%peer, ?outcome, "connection closed"),
            Err(e) if e.is_fatal() => {
                tracing::error!(%peer, transport = %self.transport, error = %e, "dispatch failed");
            },
            Err(e) => tracing::warn!(%peer, error = %e, "dispatch failed"),
        }
    }
}
