//! muxd: a multiplexed multi-client request server
//!
//! Serves one of several small request protocols:
//! - calc: fixed-frame integer arithmetic over TCP (and a Unix socket)
//! - quiz: a question and its answer per client over TCP
//! - max: running maximum of the numbers clients send over TCP
//! - chunk: ordered reassembly of chunked messages over UDP
//!
//! Features:
//! - Bounded number of concurrently served clients
//! - Single-threaded event loop or thread-per-client runtime
//! - Graceful shutdown on SIGINT/SIGTERM, SIGUSR1 pauses admission
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;

use config::Config;
use runtime::{ServerContext, Shutdown, Signal, SignalPipe};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        protocol = ?config.protocol,
        runtime = ?config.runtime,
        max_clients = config.max_clients,
        "Starting muxd server"
    );

    runtime::ignore_sigpipe()?;
    let signals = SignalPipe::install(&[Signal::Interrupt, Signal::Terminate, Signal::ToggleAccept])?;

    let ctx = ServerContext::from_config(&config)?;

    if let Err(e) = runtime::run(&config, ctx, Shutdown::new(), Some(signals)) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }

    info!("Server has terminated");
    Ok(())
}
