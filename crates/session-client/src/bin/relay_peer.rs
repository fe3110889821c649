//! Relay Peer
//!
//! Joins a room over WebSocket with loopback media and logs every session
//! event until Ctrl-C, then leaves cleanly. Useful for checking a deployed
//! registry end to end without a browser.

#![warn(clippy::pedantic)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::config::ObservabilityConfig;
use session_client::config::ClientConfig;
use session_client::link;
use session_client::media::loopback::{LoopbackDevice, LoopbackMedia};
use session_client::{JoinMode, SessionActor, SessionEvent, SessionSettings};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const LINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_vars: HashMap<String, String> = std::env::vars().collect();

    ObservabilityConfig::from_vars(&env_vars)?
        .init_tracing("session_client=debug,relay_peer=debug")?;

    let config = ClientConfig::from_vars(&env_vars).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        signaling_url = %config.signaling_url,
        room_id = %config.room_id,
        user_id = %config.user_id,
        spectator = config.spectator,
        ice_servers = config.ice_servers.len(),
        "Configuration loaded successfully"
    );

    let cancel_token = CancellationToken::new();
    let (client_link, link_task) =
        link::connect(&config.signaling_url, cancel_token.child_token()).await?;

    let (session, session_task) = SessionActor::spawn(
        SessionSettings::from(&config),
        client_link,
        Arc::new(LoopbackMedia::new()),
        Arc::new(LoopbackDevice::new()),
        cancel_token.child_token(),
    );

    let mut events = session.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Error(e)) => warn!(error = %e, "Session error"),
                Ok(event) => info!(event = ?event, "Session event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    session.join(JoinMode::from_spectator(config.spectator)).await?;
    info!("Joined room, press Ctrl-C to leave");

    signal::ctrl_c().await?;
    info!("Shutdown signal received, leaving room");

    if let Err(e) = session.leave().await {
        warn!(error = %e, "Leave failed");
    }

    // Stopping the session drops its end of the link; the bridge flushes
    // the leave frame and exits on its own.
    session.cancel();
    let _ = session_task.await;
    if tokio::time::timeout(LINK_DRAIN_TIMEOUT, link_task).await.is_err() {
        warn!("Signaling link did not drain in time");
    }
    cancel_token.cancel();
    logger.abort();

    info!("Relay peer stopped");
    Ok(())
}
