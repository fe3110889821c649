//! Room Registry
//!
//! Signaling server holding authoritative room state for an SFU.
//!
//! # Servers
//!
//! - WebSocket server for client signaling (default: 0.0.0.0:3000, path `/ws`)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Initialize tracing
//! 2. Load configuration from environment
//! 3. Initialize Prometheus metrics recorder
//! 4. Initialize media engine and actor system (`RegistryActorHandle`)
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start signaling server
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::config::ObservabilityConfig;
use room_registry::actors::{ActorMetrics, RegistryActorHandle, RegistrySettings, RoomSettings};
use room_registry::config::Config;
use room_registry::media::loopback::LoopbackEngine;
use room_registry::media::MediaEngine;
use room_registry::network::AddressResolver;
use room_registry::observability::{health_router, init_metrics_recorder, HealthState};
use room_registry::signaling::signaling_router;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_vars: HashMap<String, String> = std::env::vars().collect();

    ObservabilityConfig::from_vars(&env_vars)?
        .init_tracing("room_registry=debug,tower_http=debug")?;

    info!("Starting Room Registry");

    let config = Config::from_vars(&env_vars).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        public_ip = ?config.public_ip,
        listen_ip = %config.listen_ip,
        max_rooms = config.max_rooms,
        max_participants_per_room = config.max_participants_per_room,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!(e)
    })?;

    let health_state = Arc::new(HealthState::new());

    let engine = Arc::new(LoopbackEngine::default());
    let resolver = Arc::new(AddressResolver::new(
        config.public_ip,
        config.public_ip_lookup_url.clone(),
        config.public_ip_lookup_timeout,
    ));

    let settings = RegistrySettings {
        max_rooms: config.max_rooms,
        room: RoomSettings {
            max_participants: config.max_participants_per_room,
            ..RoomSettings::default()
        },
        listen_ip: config.listen_ip,
    };

    let registry = RegistryActorHandle::new(
        config.instance_id.clone(),
        Arc::clone(&engine) as Arc<dyn MediaEngine>,
        resolver,
        settings,
        ActorMetrics::new(),
    );
    info!("Actor system initialized");

    let shutdown_token = registry.child_token();

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        anyhow::anyhow!("Invalid health bind address: {e}")
    })?;
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            anyhow::anyhow!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_app = health_router(Arc::clone(&health_state), prometheus_handle);
    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        anyhow::anyhow!("Invalid signaling bind address: {e}")
    })?;
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            anyhow::anyhow!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_app = signaling_router(registry.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http());
    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    if engine.is_ready() {
        health_state.set_ready();
    } else {
        warn!("Media engine not ready at startup");
    }

    info!("Room Registry running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();

    if let Err(e) = registry.shutdown().await {
        warn!(error = %e, "Actor system shutdown error");
    }

    // Give servers and room actors time to drain
    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Room Registry shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
