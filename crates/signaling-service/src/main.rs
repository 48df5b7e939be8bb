//! Telehealth Signaling Service
//!
//! WebSocket signaling and media orchestration for telemedicine sessions.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:4443, path `/ws`)
//! - HTTP server for health, metrics and session statistics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to Redis (appointments, chat, vitals, audit)
//! 4. Start media workers and watch them for fatal exits
//! 5. Start the audit emitter and the session registry
//! 6. Start health HTTP server (liveness, readiness, metrics, sessions)
//! 7. Start the signaling server
//! 8. Wait for a shutdown signal or a fatal worker exit
//!
//! A media worker exit is unrecoverable: the process drains and exits
//! with a non-zero status so the orchestrator restarts it.

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use signaling_service::actors::{ActorMetrics, SessionRegistryHandle, SessionServices};
use signaling_service::audit::AuditEmitter;
use signaling_service::config::Config;
use signaling_service::media::loopback::LoopbackEngine;
use signaling_service::media::worker_pool::WorkerPool;
use signaling_service::observability::{
    health_router, init_metrics_recorder, sessions_router, HealthState,
};
use signaling_service::signaling::{signaling_router, GatewayContext, SignalingState};
use signaling_service::storage::redis_store::RedisStore;
use signaling_service::storage::{AuditSink, SessionDirectory, SessionStore};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time allowed for live sessions to end and release their routers.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signaling_service=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Telehealth Signaling Service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        media_workers = config.media_workers,
        max_sessions = config.max_sessions,
        max_participants_per_session = config.max_participants_per_session,
        max_session_duration_seconds = config.max_session_duration_seconds,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    info!("Connecting to Redis...");
    let store = RedisStore::connect(&config.redis_url).await.map_err(|e| {
        error!(error = %e, "Failed to connect to Redis");
        e
    })?;
    store.ping().await.map_err(|e| {
        error!(error = %e, "Redis did not answer ping");
        e
    })?;
    let store = Arc::new(store);
    info!("Redis connection established");

    // Any worker exit cancels this token
    let fatal = CancellationToken::new();
    let health_state = Arc::new(HealthState::new(fatal.clone()));

    info!(workers = config.media_workers, "Starting media workers...");
    let engine = LoopbackEngine::new();
    let pool = Arc::new(
        WorkerPool::start(&engine, &config.worker_pool_settings())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to start media workers");
                e
            })?,
    );
    let death_watches = pool.spawn_death_watch(fatal.clone());
    info!(workers = pool.size(), "Media workers started");

    let audit_token = CancellationToken::new();
    let (audit, audit_task) = AuditEmitter::spawn(
        Arc::clone(&store) as Arc<dyn AuditSink>,
        config.audit_settings(),
        audit_token.clone(),
    );

    info!("Initializing actor system...");
    let actor_metrics = ActorMetrics::new();
    let registry = SessionRegistryHandle::new(
        config.instance_id.clone(),
        SessionServices {
            pool: Arc::clone(&pool),
            store: Arc::clone(&store) as Arc<dyn SessionStore>,
            audit: audit.clone(),
            settings: config.session_settings(),
            metrics: Arc::clone(&actor_metrics),
        },
        config.max_sessions,
        fatal.clone(),
    );
    info!("Actor system initialized");

    let shutdown_token = CancellationToken::new();

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let health_app = health_router(Arc::clone(&health_state))
        .merge(metrics_router)
        .merge(sessions_router(registry.clone()));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    let health_server = tokio::spawn(async move {
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
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_app = signaling_router(SignalingState {
        context: Arc::new(GatewayContext {
            registry: registry.clone(),
            directory: Arc::clone(&store) as Arc<dyn SessionDirectory>,
            audit,
            metrics: Arc::clone(&actor_metrics),
        }),
        allowed_origin: config.allowed_origin.clone(),
        shutdown: shutdown_token.child_token(),
    })
    .layer(TraceLayer::new_for_http());

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    let signaling_server = tokio::spawn(async move {
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

    health_state.mark_started();
    info!("Telehealth Signaling Service running - press Ctrl+C to shutdown");

    let fatal_exit = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            false
        }
        () = fatal.cancelled() => {
            error!("Media worker failed, shutting down");
            true
        }
    };

    // Not ready from here on so the load balancer stops sending joins
    health_state.begin_draining();

    // End sessions first so clients still receive session-ended
    if let Err(e) = registry.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }

    shutdown_token.cancel();
    let _ = signaling_server.await;
    let _ = health_server.await;

    pool.close();
    for watch in death_watches {
        watch.abort();
    }

    // Flush audit records queued by session finalization
    audit_token.cancel();
    let _ = audit_task.await;

    if fatal_exit {
        return Err("media worker exited unexpectedly".into());
    }

    info!("Telehealth Signaling Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
