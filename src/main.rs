//! mux-bench: a throughput benchmark over multiplexed reliable streams
//!
//! The client asks for a byte count; the server answers with an amplified
//! reply of that many bytes times the amplification factor, and the client
//! reports how fast it arrived.
//!
//! Features:
//! - Chunked, backpressure-aware reply writer
//! - Minimal stream multiplexer over TCP with per-stream flow control
//! - Multi-worker server with SO_REUSEPORT load balancing
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;
mod session;
mod transfer;
mod transport;

use config::{Config, Mode};
use transfer::report::Rate;
use tracing::{info, warn};
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
        .init();

    info!(
        mode = ?config.mode,
        host = %config.host,
        port = config.port,
        amplification = config.amplification,
        chunk_size = config.chunk_size,
        reliability = ?config.reliability(),
        "Starting mux-bench"
    );

    match config.mode {
        Mode::Server => run_server(config),
        Mode::Client => run_client(config),
    }
}

fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    runtime::run_server(&config)?;
    Ok(())
}

/// Run one transfer and print its record. An unmeasured run is reported,
/// not treated as a process failure.
fn run_client(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = runtime::run_client(&config)?;
    if let Rate::Unmeasured(reason) = &outcome.record.rate {
        warn!(state = ?outcome.state, reason = %reason, "Transfer was not measured");
    }
    info!("{}", outcome.record.line(&config.labels()));
    Ok(())
}
