//! Terminal chat client entry point.
//!
//! `swarmchat join <room> [as <name>]` joins a room over the QUIC swarm and
//! forwards stdin lines into the session until stdin closes or Ctrl-C.

mod events;

use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use swarmchat_core::adapters::drive::memory::MemoryDriveFactory;
use swarmchat_core::adapters::quic::swarm::QuicSwarm;
use swarmchat_core::{RoomSession, SessionConfig};

use crate::events::TerminalEvents;

const INPUT_BUFFER: usize = 64;
const ANON_SUFFIX_LEN: usize = 6;

#[derive(Debug, Parser)]
#[command(name = "swarmchat")]
#[command(about = "Peer-to-peer chat rooms with a shared drive", long_about = None)]
#[command(version)]
struct Cli {
    /// Tracker to announce to and look peers up from
    #[arg(long, global = true, env = "SWARMCHAT_TRACKER", default_value = "127.0.0.1:4433")]
    tracker: SocketAddr,

    /// Local address for the swarm endpoint
    #[arg(long, global = true, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Seconds to wait for a peer's drive key before creating a drive
    #[arg(long, global = true, default_value_t = 10)]
    fallback_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Join a chat room
    Join {
        /// Room name; peers using the same name meet each other
        #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new())]
        room: String,

        /// `as <name>` picks the display name; anything else is ignored
        #[arg(value_name = "as NAME", trailing_var_arg = true, allow_hyphen_values = true)]
        rest: Vec<String>,
    },
}

/// The display name from `as <name>`, if one was given.
fn requested_name(rest: &[String]) -> Option<String> {
    match rest {
        [keyword, name, ..] if keyword == "as" && !name.is_empty() => Some(name.clone()),
        _ => None,
    }
}

fn anonymous_name() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ANON_SUFFIX_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("anon-{suffix}")
}

/// Read stdin on a plain thread so a pending read never holds up runtime
/// shutdown. Lines stop flowing on EOF or Ctrl-C.
fn spawn_input() -> mpsc::Receiver<String> {
    let (raw_tx, mut raw_rx) = mpsc::channel::<String>(INPUT_BUFFER);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if raw_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    let (tx, rx) = mpsc::channel(INPUT_BUFFER);
    tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                line = raw_rx.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };
            if tx.send(line).await.is_err() {
                break;
            }
        }
        debug!("Input closed");
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Chat output owns stdout; keep logs on stderr and quiet by default.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let Commands::Join { room, rest } = cli.command;
    let display_name = requested_name(&rest).unwrap_or_else(anonymous_name);
    info!(%room, %display_name, tracker = %cli.tracker, "Starting");

    let mut config = SessionConfig::new(room, display_name);
    config.fallback_delay = Duration::from_secs(cli.fallback_secs);

    let swarm = QuicSwarm::connect(cli.bind, cli.tracker).await?;
    let session = RoomSession::new(
        config,
        Arc::new(swarm),
        Arc::new(MemoryDriveFactory),
        Arc::new(TerminalEvents),
    )?;

    session.run(spawn_input()).await
}
