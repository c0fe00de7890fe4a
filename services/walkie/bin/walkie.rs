//! Main Entrypoint for the Walkie Voice Client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Initializing logging.
//! 3. Opening the microphone, the speaker and the agent transport.
//! 4. Running the console until the operator quits or presses Ctrl+C.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use walkie_core::{SessionController, transport::HttpAgentTransport};
use walkie_service::{
    audio::{CpalMicrophone, RodioSpeaker},
    config::Config,
    console,
};

/// Push-to-talk voice client for a remote conversational agent.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Request the agent's introduction for this phone number at start-up.
    #[arg(long)]
    phone: Option<String>,
}

/// Listens for the `Ctrl+C` signal to shut down gracefully.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(
        agent_http_url = %config.agent_http_url,
        agent_ws_url = %config.agent_ws_url,
        turn_timeout = ?config.turn_timeout,
        "Configuration loaded. Opening devices..."
    );

    // --- 3. Devices and Transport ---
    let transport =
        HttpAgentTransport::new(config.transport()).context("Failed to build the agent client")?;
    if let Err(e) = transport.check_health().await {
        warn!(error = %e, "Agent health check failed; continuing anyway");
    }
    let speaker = RodioSpeaker::new(config.intro_timeout).context("Failed to open the speaker")?;
    let microphone = CpalMicrophone::new(config.max_capture);

    let session = SessionController::with_turn_deadline(
        Arc::new(transport),
        Box::new(microphone),
        Arc::new(speaker),
        config.turn_timeout,
    );

    // --- 4. Run ---
    tokio::select! {
        result = console::run(session, args.phone) => result?,
        _ = shutdown_signal() => {}
    }

    info!("Walkie has shut down.");
    Ok(())
}
