//! Botster Remote CLI - inspect frames, follow session event streams, and
//! manage device configuration.
//!
//! This is the main binary entry point. See the `botster_remote` library
//! for the core functionality.

use anyhow::{Context, Result};
use botster_remote::constants::{RECONNECT_INITIAL_BACKOFF, RECONNECT_MAX_BACKOFF};
use botster_remote::protocol::{decode_frame, read_frame, Frame};
use botster_remote::session::DeviceKeyPair;
use botster_remote::stream::{open_event_stream, StreamTransport};
use botster_remote::{Config, StreamError};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "botster-remote")]
#[command(version = VERSION)]
#[command(about = "Remote command relay and session event streaming for botster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config,
    /// Decode a hex-encoded command or decision frame
    InspectFrame {
        /// Frame bytes as hex, length prefix included
        hex: String,
    },
    /// Print a session's daemon events as JSON lines
    Watch {
        /// Session to follow
        session_id: String,
        /// Read the shared-memory ring instead of the daemon socket
        #[arg(long)]
        shm: bool,
    },
    /// Generate a device key pair and print its public key
    Keygen,
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(path) = std::env::var("BOTSTER_REMOTE_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.format_timestamp_secs().init();
    Ok(())
}

fn inspect_frame(hex: &str) -> Result<()> {
    let cleaned: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = data_encoding::HEXLOWER_PERMISSIVE
        .decode(cleaned.as_bytes())
        .context("Frame is not valid hex")?;
    let (body, consumed) = read_frame(&bytes)?;
    if consumed < bytes.len() {
        println!("note: {} trailing byte(s) ignored", bytes.len() - consumed);
    }

    match decode_frame(body)? {
        Frame::Command(command) => {
            println!("type:        command");
            println!("command_id:  {}", command.command_id);
            println!("flags:       0x{:02x}", command.flags);
            println!("payload:     {} byte(s)", command.encrypted_payload.len());
        }
        Frame::Decision(decision) => {
            println!("type:        decision");
            println!("command_id:  {}", decision.command_id);
            println!("decision:    {}", decision.decision);
            println!("result:      {} byte(s)", decision.result.len());
        }
    }
    Ok(())
}

/// Follow a session until Ctrl-C, reconnecting with exponential backoff
/// whenever the stream ends or cannot be opened.
async fn watch(config: Config, session_id: String, shm: bool) -> Result<()> {
    let transport = if shm {
        StreamTransport::SharedMemory(config.stream.region_dir.clone())
    } else {
        StreamTransport::Socket(config.stream.socket_path.clone())
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut backoff = RECONNECT_INITIAL_BACKOFF;
    while !cancel.is_cancelled() {
        let stream = open_event_stream(&transport, &session_id, &config.stream);
        match stream.subscribe(&cancel).await {
            Ok(mut subscription) => {
                backoff = RECONNECT_INITIAL_BACKOFF;
                loop {
                    let event = tokio::select! {
                        biased;
                        () = cancel.cancelled() => None,
                        event = subscription.next() => event,
                    };
                    let Some(event) = event else { break };
                    println!("{}", serde_json::to_string(&event)?);
                }
                stream.disconnect().await;
                log::info!("[Watch] Stream for {session_id} ended");
            }
            Err(StreamError::Cancelled) => break,
            Err(e) => {
                log::warn!("[Watch] Could not subscribe to {session_id}: {e}");
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        log::info!("[Watch] Reconnecting in {backoff:?}");
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            if let Err(e) = config.validate() {
                eprintln!("warning: {e}");
            }
        }
        Commands::InspectFrame { hex } => {
            inspect_frame(&hex)?;
        }
        Commands::Watch { session_id, shm } => {
            let config = Config::load()?;
            config.validate()?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(watch(config, session_id, shm))?;
        }
        Commands::Keygen => {
            let keys = DeviceKeyPair::generate();
            println!("{}", keys.public_key().to_base64());
        }
    }

    Ok(())
}
