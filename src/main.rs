#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # modemd
//!
//! Modem management daemon for Linux devices.
//!
//! modemd owns one serial AT port, serializes every command sent to it, and
//! keeps track of the modem's CDMA registration state, logging unsolicited
//! indications as they arrive. It is the glue around the `modemd` library,
//! which does the actual work.
//!
//! ## Subcommands
//!
//! - `modemd run` (default) — open the configured port and poll registration
//! - `modemd send --cmd 'AT+CSQ'` — one-shot AT command, print the reply
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, poller, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! error.rs         — crate-wide error taxonomy
//! flow.rs          — generic step machine (Sequence + drive)
//! serial/
//!   tty.rs         — descriptor open, termios, locking, flash primitives
//!   queue.rs       — port task: refcounted open, FIFO queue, timeouts,
//!                    cancellation, reply cache, demux
//!   parser.rs      — V.250 final codes + unsolicited extraction
//!   mod.rs         — SerialPort handle, port/config types, AtChannel
//! cdma/
//!   registration.rs — registration-check step machine
//!   bits.rs        — bit-level reader/writer
//!   pdu.rs         — CDMA SMS PDU codec
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use modemd::cdma::registration::RegistrationCheck;
use modemd::cdma::NoProbe;
use modemd::config::Config;
use modemd::serial::{PortEvent, SerialPort};
use modemd::flow;

/// Modem management daemon for Linux devices.
#[derive(Parser)]
#[command(name = "modemd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the configured port and run the daemon (default).
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Send one AT command and print the response.
    Send {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// The command, without trailing CR (e.g. 'AT+CSQ').
        #[arg(long)]
        cmd: String,
        /// Response timeout in seconds.
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Send {
            config,
            cmd,
            timeout_secs,
        }) => run_send(config.as_deref(), &cmd, timeout_secs).await,
        Some(Commands::Run { config }) => run_daemon(config.as_deref()).await,
        None => run_daemon(None).await,
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

/// Open the port and run the init sequence shared by both subcommands.
async fn open_port(config: &Config) -> SerialPort {
    let port = SerialPort::new(config.serial.port_config());
    if let Err(e) = port.open().await {
        eprintln!("cannot open {}: {e}", config.serial.device);
        std::process::exit(1);
    }

    // Disable echo so replies parse cleanly. Best-effort: some devices are
    // deaf for a moment right after open.
    match port.at_command("ATE0", Duration::from_secs(2)).await {
        Ok(_) => info!("echo disabled"),
        Err(e) => warn!("ATE0 failed ({e}), continuing anyway"),
    }

    for prefix in &config.registration.unsolicited {
        let _ = port.register_unsolicited(prefix).await;
    }

    port
}

async fn run_send(config_path: Option<&str>, cmd: &str, timeout_secs: u64) {
    let config = Config::load(config_path);
    init_tracing(&config);

    let port = open_port(&config).await;
    match port
        .at_command(cmd, Duration::from_secs(timeout_secs))
        .await
    {
        Ok(response) => println!("{response}"),
        Err(e) => {
            eprintln!("{cmd}: {e}");
            let _ = port.close().await;
            std::process::exit(1);
        }
    }
    let _ = port.close().await;
}

async fn run_daemon(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("modemd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Port: {}", config.serial.device);

    let port = open_port(&config).await;

    // Forward port notifications to the log; a forced close means the
    // device is gone and there is nothing left to manage.
    let mut events = port.subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PortEvent::Unsolicited(note) => info!("unsolicited: {}", note.line),
                PortEvent::ResponseTimeouts(n) => warn!("{n} consecutive command timeouts"),
                PortEvent::BufferOverrun { dropped } => {
                    warn!("device flooding the line, dropped {dropped} bytes");
                }
                PortEvent::ForcedClose => {
                    warn!("port force-closed, modem is gone");
                    break;
                }
            }
        }
    });

    // Registration poller.
    let poll_port = port.clone();
    let timeout = config.registration.command_timeout();
    let interval = config.registration.poll_interval();
    let poll_task = tokio::spawn(async move {
        let probe = NoProbe;
        let mut ticker = tokio::time::interval(interval);
        let mut last_service = None;
        loop {
            ticker.tick().await;
            let check = RegistrationCheck::new(&poll_port, &probe, timeout);
            match flow::drive(check, None).await {
                Ok(result) => {
                    let has_service = result.has_service();
                    if last_service != Some(has_service) {
                        info!(
                            "service {}: cdma1x={} evdo={} sid={:?}",
                            if has_service { "acquired" } else { "lost" },
                            result.cdma1x.as_str(),
                            result.evdo.as_str(),
                            result.sid
                        );
                        last_service = Some(has_service);
                    }
                }
                Err(e) => warn!("registration check failed: {e}"),
            }
        }
    });

    info!("Ready");

    // Graceful shutdown
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to register SIGTERM");
    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    info!("Shutting down...");
    poll_task.abort();
    event_task.abort();
    let _ = port.close().await;
    info!("Goodbye");
}
