//! mplex CLI - multiplexed echo server and load generator
//!
//! `listen` accepts TCP connections and echoes every stream opened on them.
//! `dial` opens many streams to such a server and checks what comes back.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use mplex_connection::{Connection, MuxConfig, Role, Stream};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// mplex - stream multiplexing over a single connection
#[derive(Parser, Debug)]
#[command(name = "mplex")]
#[command(about = "mplex - stream multiplexing over a single connection")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("MPLEX_GIT_HASH"), " ", env!("MPLEX_BUILD_TIME"), ")"))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Maximum payload bytes per MESSAGE frame
    #[arg(long, global = true, env = "MPLEX_MAX_FRAME_SIZE", default_value = "65536")]
    max_frame_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept connections and echo every inbound stream
    Listen {
        /// Address to bind (e.g., 127.0.0.1:7000)
        #[arg(long, env = "MPLEX_BIND", default_value = "127.0.0.1:7000")]
        bind: String,
    },

    /// Connect to an echo server and push messages over many streams
    #[command(long_about = r#"
Connect to an mplex echo server, open STREAMS streams and write MESSAGES
messages on each. Every stream is half-closed after its last write and the
echoed data is read back and counted.

EXAMPLES:
  mplex listen --bind 127.0.0.1:7000
  mplex dial --addr 127.0.0.1:7000 --streams 100 --messages 1000
    "#)]
    Dial {
        /// Server address
        #[arg(long, env = "MPLEX_ADDR", default_value = "127.0.0.1:7000")]
        addr: String,

        /// Number of streams to open
        #[arg(long, default_value = "10")]
        streams: usize,

        /// Messages written on each stream
        #[arg(long, default_value = "100")]
        messages: usize,

        /// Message payload
        #[arg(long, default_value = "simple msg")]
        payload: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Echo a stream's data back until the remote closes its side
async fn echo(stream: Stream) {
    let id = stream.id();
    let mut echoed = 0usize;

    loop {
        match stream.read().await {
            Ok(Some(chunk)) => {
                echoed += chunk.len();
                if let Err(e) = stream.write(chunk).await {
                    debug!("Stream {} write failed: {}", id, e);
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stream {} ended: {}", id, e);
                return;
            }
        }
    }

    if let Err(e) = stream.close().await {
        debug!("Stream {} close failed: {}", id, e);
    }
    debug!("Stream {} echoed {} bytes", id, echoed);
}

async fn run_listener(bind: &str, config: MuxConfig) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening on {}", listener.local_addr()?);

    loop {
        let (socket, peer) = listener.accept().await.context("Accept failed")?;
        socket.set_nodelay(true)?;

        let conn = Connection::with_config(socket, Role::Responder, config.clone())?;
        info!("[{}] Accepted connection from {}", conn.connection_id(), peer);
        conn.on_stream(|stream| {
            tokio::spawn(echo(stream));
        });

        tokio::spawn(async move {
            let cause = conn.closed().await;
            info!("[{}] Connection ended: {}", conn.connection_id(), cause);
        });
    }
}

/// Write `messages` copies of `payload`, half-close, and count echoed bytes
async fn drive_stream(stream: Stream, payload: Bytes, messages: usize) -> Result<usize> {
    for _ in 0..messages {
        stream.write(payload.clone()).await?;
    }
    stream.close().await?;

    let echoed = stream.read_to_end().await?;
    Ok(echoed.iter().map(Bytes::len).sum())
}

async fn run_dialer(
    addr: &str,
    config: MuxConfig,
    streams: usize,
    messages: usize,
    payload: String,
) -> Result<()> {
    let socket = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    socket.set_nodelay(true)?;

    let conn = Connection::with_config(socket, Role::Initiator, config)?;
    info!("[{}] Connected to {}", conn.connection_id(), addr);

    let payload = Bytes::from(payload);
    let started = Instant::now();
    let mut tasks = Vec::with_capacity(streams);
    for _ in 0..streams {
        let stream = conn.new_stream().await?;
        tasks.push(tokio::spawn(drive_stream(stream, payload.clone(), messages)));
    }

    let expected = payload.len() * messages;
    let mut failed = 0usize;
    let mut total = 0usize;
    for task in tasks {
        match task.await {
            Ok(Ok(echoed)) => {
                if echoed != expected {
                    warn!("Stream echoed {} bytes, expected {}", echoed, expected);
                    failed += 1;
                }
                total += echoed;
            }
            Ok(Err(e)) => {
                error!("Stream failed: {:#}", e);
                failed += 1;
            }
            Err(e) => {
                error!("Stream task panicked: {}", e);
                failed += 1;
            }
        }
    }

    let elapsed = started.elapsed();
    let stats = conn.stats();
    info!(
        "{} streams x {} messages: {} bytes echoed in {:.2?} ({} frames sent, {} received)",
        streams, messages, total, elapsed, stats.frames_sent, stats.frames_received
    );

    tokio::time::timeout(Duration::from_secs(10), conn.close())
        .await
        .context("Timed out closing connection")?;

    if failed > 0 {
        anyhow::bail!("{} of {} streams failed", failed, streams);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    let config = MuxConfig::default().with_max_frame_size(cli.max_frame_size);
    config.validate()?;

    let task = match cli.command {
        Commands::Listen { bind } => tokio::spawn(async move { run_listener(&bind, config).await }),
        Commands::Dial {
            addr,
            streams,
            messages,
            payload,
        } => tokio::spawn(async move {
            run_dialer(&addr, config, streams, messages, payload).await
        }),
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = task => match result {
            Ok(result) => result,
            Err(e) => {
                error!("Task panicked: {}", e);
                Err(e.into())
            }
        }
    }
}
