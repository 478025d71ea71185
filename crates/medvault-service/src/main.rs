use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use medvault_api::FileAuditLog;
use medvault_core::{Clock, Directory};
use medvault_store::SharedRecordStore;
use time::UtcOffset;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod server;
mod session;
mod tls;

use session::ServerState;

#[derive(Debug, Parser)]
#[command(name = "medvault-server")]
#[command(about = "Mutually authenticated TLS service for role-scoped medical records")]
struct Args {
    #[arg(long, env = "MEDVAULT_BIND", default_value = "0.0.0.0:12345")]
    bind: SocketAddr,
    /// Identity directory file (divisions, then persons).
    #[arg(long, env = "MEDVAULT_DIRECTORY", default_value = "./Database/ClientInfo")]
    directory: PathBuf,
    #[arg(long, env = "MEDVAULT_RECORDS", default_value = "./Database/records")]
    records: PathBuf,
    #[arg(long, env = "MEDVAULT_AUDIT_LOG", default_value = "./Database/Logs")]
    audit_log: PathBuf,
    /// PEM bundle of CAs trusted to sign client certificates.
    #[arg(long, env = "MEDVAULT_CA_CERT", default_value = "./Certificates/Server/ca.pem")]
    ca_cert: PathBuf,
    #[arg(long, env = "MEDVAULT_SERVER_CERT", default_value = "./Certificates/Server/server.pem")]
    server_cert: PathBuf,
    #[arg(long, env = "MEDVAULT_SERVER_KEY", default_value = "./Certificates/Server/server.key")]
    server_key: PathBuf,
    /// Close sessions idle for this many seconds; 0 disables the limit.
    #[arg(long, env = "MEDVAULT_IDLE_TIMEOUT_SECS", default_value_t = 900)]
    idle_timeout_secs: u64,
    #[arg(long, env = "MEDVAULT_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    handshake_timeout_secs: u64,
    /// On shutdown, wait this long for open sessions before aborting them.
    #[arg(long, env = "MEDVAULT_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // must run before the runtime spawns worker threads
    let offset = UtcOffset::current_local_offset().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "local UTC offset unavailable, using UTC");
        UtcOffset::UTC
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run(args, Clock::system(offset)))
}

async fn run(args: Args, clock: Clock) -> Result<()> {
    tracing::info!("starting server");
    let _ = rustls::crypto::ring::default_provider().install_default();

    let directory = match Directory::load(&args.directory) {
        Ok(directory) => directory,
        Err(err) => {
            tracing::warn!(error = %err, "continuing with an empty identity directory");
            Directory::default()
        }
    };
    let directory = Arc::new(directory);
    let store = SharedRecordStore::open(directory.clone(), &args.records)?;
    let audit = FileAuditLog::open(&args.audit_log)?;

    let acceptor = tls::build_acceptor(&args.ca_cert, &args.server_cert, &args.server_key)
        .context("cannot start server without TLS credentials")?;
    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    let idle_timeout =
        (args.idle_timeout_secs > 0).then(|| Duration::from_secs(args.idle_timeout_secs));
    let state = Arc::new(ServerState::new(directory, store, Arc::new(audit), clock, idle_timeout));

    server::serve(
        listener,
        acceptor,
        state.clone(),
        Duration::from_secs(args.handshake_timeout_secs),
        Duration::from_secs(args.shutdown_grace_secs),
        shutdown_signal(),
    )
    .await;

    // sessions have all ended; this covers any that were aborted
    state.checkpoint().await;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
}
