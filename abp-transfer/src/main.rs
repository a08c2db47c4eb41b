//! Entry point for `abp-transfer`.
//!
//! Parses CLI arguments and dispatches into either **receive** or **send** mode.
//! All actual protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, argument parsing, address resolution).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use abp_transfer::simulator::{Simulator, SimulatorConfig};
use abp_transfer::socket::Socket;
use abp_transfer::timer::TimerConfig;
use abp_transfer::{Receiver, ReceiverConfig, Sender, SenderConfig, StaleFinPolicy};

/// Reliable file transfer over UDP (Alternating Bit Protocol).
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Receive files from any number of senders into a directory.
    Receive {
        /// Local address to listen on.
        #[arg(short, long, default_value = "127.0.0.1:1234")]
        bind: SocketAddr,
        /// Randomly drop, duplicate and corrupt outbound replies.
        #[arg(long)]
        simulate_faults: bool,
        /// Seconds of silence after which a sender is declared dead.
        #[arg(long, default_value_t = 10)]
        session_timeout_secs: u64,
        /// Directory in which received files are created.
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
        /// Ignore a FIN with the wrong bit after close instead of tearing down.
        #[arg(long)]
        tolerate_stale_fin: bool,
    },
    /// Send one file to a receiver.
    Send {
        /// Receiver address as host:port.
        target: String,
        /// File to upload; the name is transmitted as given.
        filename: PathBuf,
        /// Milliseconds to wait for an acknowledgement before re-sending.
        #[arg(long, default_value_t = 5000)]
        ack_timeout_ms: u64,
        /// Give up after this many transmissions of one packet.
        #[arg(long)]
        max_retries: Option<u32>,
        /// Randomly drop, duplicate and corrupt outbound packets.
        #[arg(long)]
        simulate_faults: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Receive {
            bind,
            simulate_faults,
            session_timeout_secs,
            output_dir,
            tolerate_stale_fin,
        } => {
            let config = ReceiverConfig {
                timer: TimerConfig {
                    session_timeout: Duration::from_secs(session_timeout_secs),
                    ..TimerConfig::default()
                },
                output_dir,
                stale_fin_policy: if tolerate_stale_fin {
                    StaleFinPolicy::Tolerate
                } else {
                    StaleFinPolicy::Violation
                },
                ..ReceiverConfig::default()
            };

            let mut socket = Socket::bind(bind)
                .await
                .with_context(|| format!("cannot bind {bind}"))?;
            if simulate_faults {
                log::info!("enabling packet loss simulation");
                socket = socket.with_simulator(Simulator::new(SimulatorConfig::lossy()));
            }

            Receiver::from_socket(socket, config)
                .run()
                .await
                .context("receive loop failed")?;
        }
        Mode::Send {
            target,
            filename,
            ack_timeout_ms,
            max_retries,
            simulate_faults,
        } => {
            // Fail on an unreadable source before any network activity.
            tokio::fs::metadata(&filename)
                .await
                .with_context(|| format!("cannot open {}", filename.display()))?;

            let resolved = tokio::net::lookup_host(&target)
                .await
                .with_context(|| format!("cannot resolve {target}"))?;
            let peer = prefer_ipv4(resolved)
                .with_context(|| format!("{target} resolved to no address"))?;
            log::info!("{target} resolved to {peer}");

            let config = SenderConfig {
                ack_timeout: Duration::from_millis(ack_timeout_ms),
                max_retries,
            };
            let mut sender = if simulate_faults {
                let local: SocketAddr = if peer.is_ipv4() {
                    "0.0.0.0:0".parse()?
                } else {
                    "[::]:0".parse()?
                };
                let socket = Socket::bind(local)
                    .await?
                    .with_simulator(Simulator::new(SimulatorConfig::lossy()));
                Sender::with_socket(socket, peer, config)
            } else {
                Sender::connect(peer, config).await?
            };

            log::info!("sending {} to {peer} from {}", filename.display(), sender.local_addr());
            let report = sender.send_file(&filename).await?;
            println!(
                "sent {} bytes in {} chunks ({} datagrams)",
                report.bytes, report.chunks, report.transmissions
            );
        }
    }

    Ok(())
}

/// First IPv4 address, else the first address of any family.
///
/// `localhost` often resolves to `[::1]` first while receivers bind IPv4.
fn prefer_ipv4(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<SocketAddr> {
    let mut fallback = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        fallback = fallback.or(Some(addr));
    }
    fallback
}
