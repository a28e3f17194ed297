//! deskstream — entry point.
//!
//! ```text
//! deskstream                          Loopback (capture and present locally)
//! deskstream server [port]            Stream to the client that reports in
//! deskstream client <ip> <port>       Receive from a server
//! deskstream host [port]              Server that prints a shareable session id
//! deskstream join <session-id>        Client that finds its host by session id
//! deskstream --config <path>          Load a custom config TOML
//! deskstream --gen-config             Write default config to stdout
//! ```

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use deskstream::config::{AppConfig, LoggingConfig};
use deskstream::service::{Mode, StreamService};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "deskstream", version, about = "Low-latency screen streaming over UDP")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, global = true, default_value = "deskstream.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long, global = true)]
    gen_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Capture and present locally.
    Loopback,
    /// Listen for a client and stream to it.
    Server {
        /// UDP port; defaults to `network.port`.
        port: Option<u16>,
        /// Starting bitrate in Mbps; defaults to `abr.initial_mbps`.
        #[arg(long)]
        bitrate: Option<u32>,
    },
    /// Receive from a server.
    Client { address: String, port: u16 },
    /// Serve and print a session id for `join`.
    Host {
        port: Option<u16>,
        #[arg(long)]
        bitrate: Option<u32>,
    },
    /// Join a host by session id.
    Join { session_id: String },
}

impl Command {
    fn into_mode(self, config: &AppConfig) -> Mode {
        match self {
            Self::Loopback => Mode::Loopback,
            Self::Server { port, bitrate } => Mode::Server {
                port: port.unwrap_or(config.network.port),
                bitrate_mbps: bitrate.unwrap_or(config.abr.initial_mbps),
            },
            Self::Client { address, port } => Mode::Client { address, port },
            Self::Host { port, bitrate } => Mode::Host {
                port: port.unwrap_or(config.network.port),
                bitrate_mbps: bitrate.unwrap_or(config.abr.initial_mbps),
            },
            Self::Join { session_id } => Mode::Join { session_id },
        }
    }
}

// ── Logging ──────────────────────────────────────────────────────

/// `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = File::options().create(true).append(true).open(&logging.file)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    }
    Ok(())
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version land here too and are not failures.
            let failed = e.use_stderr();
            let _ = e.print();
            return if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS };
        }
    };

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        return match toml::to_string_pretty(&AppConfig::default()) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("cannot render default config: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let config = AppConfig::load(&cli.config);
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("cannot open log file {}: {e}", config.logging.file);
        return ExitCode::FAILURE;
    }

    info!("deskstream v{}", env!("CARGO_PKG_VERSION"));
    let mode = cli.command.unwrap_or(Command::Loopback).into_mode(&config);
    info!(fps = config.pipeline.fps, codec = %config.pipeline.codec, "mode: {mode}");

    let mut service = StreamService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            stop.stop();
        }
    });

    // Initialization may block on signaling and the session loop always
    // blocks, so both run off the async workers.
    let outcome = tokio::task::spawn_blocking(move || {
        match service.initialize(&mode) {
            Ok(Some(id)) => println!("session id: {id}"),
            Ok(None) => {}
            Err(e) => {
                error!("initialization failed: {e}");
                return ExitCode::FAILURE;
            }
        }
        match service.run() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("session ended with error: {e}");
                ExitCode::FAILURE
            }
        }
    })
    .await;

    outcome.unwrap_or_else(|e| {
        error!("session thread failed: {e}");
        ExitCode::FAILURE
    })
}
