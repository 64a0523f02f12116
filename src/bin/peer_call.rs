//! Peer Call Application
//!
//! Direct UDP voice links. Prints the id to share, calls the id given on the
//! command line if any, and accepts every incoming call.

use anyhow::Result;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_voice_engine::{config::AppConfig, peer::PeerEvent, VoiceEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting peer call");

    let config = AppConfig::load()?;
    let engine = VoiceEngine::open(config)?;
    let mut events = engine.subscribe_peers();

    println!("\nYour id: {}", engine.local_id());
    println!("Share it with a friend, or pass theirs as an argument.\n");

    if let Some(peer_id) = std::env::args().nth(1) {
        match engine.call_peer(&peer_id).await {
            Ok(link) => println!("Connected to {}", link.participant.label),
            Err(e) => tracing::error!("Call failed: {}", e),
        }
    }

    let mut status = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(PeerEvent::Connected { peer_id, .. }) => println!("{} joined", peer_id),
                Ok(PeerEvent::Disconnected { peer_id }) => println!("{} left", peer_id),
                Ok(PeerEvent::Failed { peer_id, error }) => println!("{} failed: {}", peer_id, error),
                Ok(PeerEvent::Connecting { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = status.tick() => {
                for link in engine.links() {
                    let speaking = engine.is_peer_speaking(&link.peer_id);
                    tracing::info!(
                        "{} [{:?}]{}",
                        link.participant.label,
                        link.state,
                        if speaking { " speaking" } else { "" }
                    );
                }
            }
        }
    }

    engine.disconnect_peers();
    engine.shutdown();

    Ok(())
}
