//! GhostDrop - loopback demonstration peer.
//!
//! Runs both sides of a drop in one process against the in-memory signaling
//! directory: the offerer creates a room, the joiner connects with its code,
//! and one file travels over a real data channel. Useful as a smoke check of
//! the whole negotiation and transfer path without any external relay.
//!
//! ```bash
//! RUST_LOG=ghostdrop=debug cargo run
//! ```
//!
//! Override the STUN servers with a comma-separated list:
//! ```bash
//! GHOSTDROP_STUN=stun:stun.example.org:3478 cargo run
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ghostdrop::net::{MemoryDirectory, Session, SessionConfig, SessionEvent};

/// Payload streamed across the loopback channel: big enough for several
/// chunks, small enough to finish instantly.
const DEMO_FILE_SIZE: usize = 40_000;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let directory: Arc<dyn ghostdrop::net::SignalingDirectory> =
        Arc::new(MemoryDirectory::new());
    let config = session_config_from_env();

    // Offerer: create the room and display the code a real user would share.
    let (offerer, mut offerer_events) =
        Session::offer(directory.clone(), config.clone()).await?;
    info!(code = %offerer.room_code(), "room created");

    // Joiner: enter the code.
    let code = offerer.room_code().clone();
    let (joiner, mut joiner_events) = Session::join(directory, code, config)
        .await
        .context("join failed")?;

    let offerer = Arc::new(offerer);
    let joiner = Arc::new(joiner);

    // Best-effort cleanup on ctrl-c: fire the teardown without waiting on it,
    // since the process may not stay alive long enough for a round trip.
    let cancel = CancellationToken::new();
    {
        let offerer = offerer.clone();
        let joiner = joiner.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; tearing down");
                tokio::spawn(async move {
                    offerer.destroy().await;
                    joiner.destroy().await;
                });
                cancel.cancel();
            }
        });
    }

    info!("waiting for the tunnel to open...");
    tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        _ = offerer.wait_open() => {}
    }
    tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        _ = joiner.wait_open() => {}
    }
    info!("tunnel established");

    let payload: Vec<u8> = (0..DEMO_FILE_SIZE).map(|i| (i % 251) as u8).collect();
    offerer
        .send_file("report.pdf", "application/pdf", &payload)
        .await
        .context("send failed")?;

    // Wait for the joiner to reassemble the file.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = joiner_events.recv() => match event {
                Some(SessionEvent::FileReceived(file)) => {
                    info!(name = %file.name, size = file.bytes.len(), "file received");
                    assert_eq!(file.bytes.as_ref(), payload.as_slice());
                    break;
                }
                Some(other) => info!(event = ?other, "joiner event"),
                None => anyhow::bail!("joiner event stream ended early"),
            },
        }
    }

    // The joiner hangs up; the offerer must see a peer-initiated disconnect.
    joiner.destroy().await;
    loop {
        match offerer_events.recv().await {
            Some(SessionEvent::PeerDisconnected) => {
                info!("offerer observed peer disconnect");
                break;
            }
            Some(other) => info!(event = ?other, "offerer event"),
            None => break,
        }
    }
    offerer.destroy().await;

    info!("demo complete");
    Ok(())
}

/// Builds the session configuration, honoring `GHOSTDROP_STUN`.
fn session_config_from_env() -> SessionConfig {
    let mut config = SessionConfig::default();
    if let Ok(servers) = std::env::var("GHOSTDROP_STUN") {
        config.ice_servers = servers
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
    }
    config
}

/// Initialize logging with tracing.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ghostdrop=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
