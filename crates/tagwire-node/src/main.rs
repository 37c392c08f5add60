//! Tagwire node binary.
//!
//! # Usage
//!
//! ```bash
//! # Generate a master secret to share with a contact out of band
//! tagwire-node generate-secret
//!
//! # Register the contact (both peers, same secret and epoch, one --alice)
//! tagwire-node --db alice.redb add-contact --contact 2 --secret <hex> \
//!     --epoch-millis 1700000000000 --alice
//!
//! # Accept connections
//! tagwire-node --db bob.redb run --bind 0.0.0.0:7777
//!
//! # Send a message
//! tagwire-node --db alice.redb send --contact 2 --to 127.0.0.1:7777 --message hello
//! ```

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use tagwire_core::{ContactId, Endpoint, KeyManager, KeyManagerConfig, TransportId};
use tagwire_crypto::{SECRET_LENGTH, SecretBytes, derive_initial_secret};
use tagwire_node::{
    ConnectionDispatcher, ConnectionHandler, DispatcherConfig, NodeError, RedbStorage,
    SecuredConnection, SystemEnv, TokioScheduler,
};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroize;

type Manager = KeyManager<SystemEnv, RedbStorage, TokioScheduler>;

/// Tagwire transport-security node
#[derive(Parser, Debug)]
#[command(name = "tagwire-node")]
#[command(about = "Tagged, rotating-key transport security node")]
#[command(version)]
struct Args {
    /// Path to the secret database
    #[arg(long, default_value = "tagwire.redb")]
    db: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Clock difference tolerated between peers, in seconds
    #[arg(long, default_value = "86400")]
    max_clock_skew_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh random master secret as hex
    GenerateSecret,

    /// Register a transport and a contact's endpoint on it
    AddContact {
        /// Contact identifier
        #[arg(long)]
        contact: u64,

        /// Transport name
        #[arg(long, default_value = "tcp")]
        transport: String,

        /// Maximum latency of the transport, in seconds
        #[arg(long, default_value = "60")]
        max_latency_secs: u64,

        /// Shared master secret (hex, 32 bytes)
        #[arg(long)]
        secret: String,

        /// Index of the transport within the master secret
        #[arg(long, default_value = "0")]
        transport_index: u32,

        /// Endpoint creation time agreed with the contact (ms since Unix epoch)
        #[arg(long)]
        epoch_millis: u64,

        /// Take the alice side of the endpoint (exactly one peer does)
        #[arg(long)]
        alice: bool,
    },

    /// Accept connections until interrupted
    Run {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:7777")]
        bind: String,

        /// Transport name
        #[arg(long, default_value = "tcp")]
        transport: String,

        /// Seconds a new connection has to send its tag
        #[arg(long, default_value = "30")]
        tag_timeout_secs: u64,

        /// Maximum concurrently dispatched connections
        #[arg(long, default_value = "64")]
        max_connections: usize,
    },

    /// Send one message to a contact
    Send {
        /// Contact identifier
        #[arg(long)]
        contact: u64,

        /// Transport name
        #[arg(long, default_value = "tcp")]
        transport: String,

        /// Address of the contact's node
        #[arg(long)]
        to: String,

        /// Message text
        #[arg(long)]
        message: String,
    },
}

/// Logs what each recognised connection sends.
struct LoggingHandler;

impl ConnectionHandler for LoggingHandler {
    fn handle(&self, mut connection: SecuredConnection) -> Result<(), NodeError> {
        let mut received = Vec::new();
        connection.reader.read_to_end(&mut received)?;
        tracing::info!(
            contact = %connection.contact,
            bytes = received.len(),
            "message received"
        );
        tracing::debug!(message = %String::from_utf8_lossy(&received), "message content");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = KeyManagerConfig {
        max_clock_skew: Duration::from_secs(args.max_clock_skew_secs),
        ..KeyManagerConfig::default()
    };

    match args.command {
        Command::GenerateSecret => generate_secret()?,
        Command::AddContact {
            contact,
            transport,
            max_latency_secs,
            secret,
            transport_index,
            epoch_millis,
            alice,
        } => {
            let manager = open_manager(&args.db, config)?;
            let transport = TransportId::new(transport);
            let max_latency = Duration::from_secs(max_latency_secs);
            let initial = derive_initial_secret(&parse_secret(secret)?, transport_index);

            manager.transport_added(transport.clone(), max_latency)?;
            manager.start()?;
            let endpoint =
                Endpoint { contact: ContactId(contact), transport, epoch: epoch_millis, alice };
            let result = manager.endpoint_added(endpoint, initial);
            manager.stop();
            result?;
            tracing::info!(contact, "contact added");
        },
        Command::Run { bind, transport, tag_timeout_secs, max_connections } => {
            let manager = open_manager(&args.db, config)?;
            manager.start()?;

            let dispatcher = Arc::new(ConnectionDispatcher::new(
                Arc::clone(&manager),
                TransportId::new(transport),
                LoggingHandler,
                DispatcherConfig {
                    tag_read_timeout: Duration::from_secs(tag_timeout_secs),
                    max_connections,
                },
            ));

            let listener = TcpListener::bind(&bind).await?;
            tracing::info!(
                transport = %dispatcher.transport(),
                "node listening on {}",
                listener.local_addr()?
            );

            let result = tokio::select! {
                result = Arc::clone(&dispatcher).serve(listener) => result,
                () = wait_for_halt(&manager) => {
                    Err(NodeError::Config("key manager halted".to_string()))
                },
                signal = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                    signal.map_err(NodeError::from)
                },
            };
            manager.stop();
            result?;
        },
        Command::Send { contact, transport, to, message } => {
            let manager = open_manager(&args.db, config)?;
            manager.start()?;

            let dispatcher = ConnectionDispatcher::new(
                Arc::clone(&manager),
                TransportId::new(transport),
                LoggingHandler,
                DispatcherConfig::default(),
            );
            // Connecting and writing block, keep them off the runtime
            let result = tokio::task::spawn_blocking(move || {
                send(&dispatcher, ContactId(contact), &to, message.as_bytes())
            })
            .await;
            manager.stop();
            result??;
        },
    }

    Ok(())
}

fn open_manager(db: &Path, config: KeyManagerConfig) -> Result<Arc<Manager>, NodeError> {
    let storage = RedbStorage::open(db)?;
    let scheduler = TokioScheduler::new()?;
    Ok(Arc::new(KeyManager::new(SystemEnv::new(), storage, scheduler, config)))
}

fn send(
    dispatcher: &ConnectionDispatcher<SystemEnv, RedbStorage, TokioScheduler, LoggingHandler>,
    contact: ContactId,
    to: &str,
    message: &[u8],
) -> Result<(), NodeError> {
    let Some(mut connection) = dispatcher.connect(contact, to)? else {
        return Err(NodeError::Config(format!("no current secret for contact {contact}")));
    };
    connection.writer.write_all(message)?;
    connection.writer.close()?;
    tracing::info!(
        contact = %contact,
        period = connection.period,
        stream = connection.stream_number,
        bytes = message.len(),
        "message sent"
    );
    Ok(())
}

async fn wait_for_halt(manager: &Manager) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        if manager.is_halted() {
            tracing::error!("key manager halted, exiting");
            return;
        }
    }
}

fn parse_secret(mut hex_secret: String) -> Result<SecretBytes, NodeError> {
    let decoded = hex::decode(&hex_secret);
    hex_secret.zeroize();
    let mut bytes = decoded.map_err(|e| NodeError::Config(format!("secret is not hex: {e}")))?;
    let secret = SecretBytes::from_slice(&bytes).map_err(|_| {
        NodeError::Config(format!("secret must be {SECRET_LENGTH} bytes, got {}", bytes.len()))
    });
    bytes.zeroize();
    secret
}

#[allow(clippy::print_stdout)]
fn generate_secret() -> Result<(), NodeError> {
    let mut bytes = [0u8; SECRET_LENGTH];
    getrandom::fill(&mut bytes).map_err(|e| NodeError::Config(format!("no randomness: {e}")))?;
    println!("{}", hex::encode(bytes));
    bytes.zeroize();
    Ok(())
}
