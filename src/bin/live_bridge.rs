//! Live Bridge Application
//!
//! Streams the microphone to the live agent and plays its replies. Peer
//! calls to this engine's id are accepted as well.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_voice_engine::{
    audio::device::list_devices,
    config::AppConfig,
    session::SessionState,
    VoiceEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting live bridge");

    // Config path from args, platform config dir otherwise
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => AppConfig::load_from(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load()?,
    };

    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
    }
    println!();

    let engine = VoiceEngine::open(config)?;
    println!("Peer id: {}\n", engine.local_id());

    engine
        .connect_agent()
        .await
        .context("connecting to the live service")?;

    let mut state = engine.session().subscribe_state();
    let mut agent_speaking = engine.agent_speaking();
    let mut local_speaking = engine.local_speaking();

    println!("Talking to the agent. Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                tracing::info!("Session {:?}", current);
                if matches!(current, SessionState::Closed | SessionState::Error) {
                    if let Some(e) = engine.session().last_error() {
                        tracing::error!("Session ended: {}", e);
                    }
                    break;
                }
            }
            Ok(()) = agent_speaking.changed() => {
                if *agent_speaking.borrow_and_update() {
                    tracing::info!("Agent speaking");
                } else {
                    tracing::info!("Agent quiet");
                }
            }
            Ok(()) = local_speaking.changed() => {
                let speaking = local_speaking.borrow_and_update().speaking;
                tracing::debug!("Microphone speaking: {}", speaking);
            }
        }
    }

    engine.disconnect_agent();
    engine.shutdown();

    Ok(())
}
