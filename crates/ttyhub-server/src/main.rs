mod auth;
mod config;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;

use libttyhub::{ConnectionHub, SessionRegistry};
use ttyhub_protocol::ServerMessage;
use ttyhub_supervisor::{ProgramStore, ScreenClient, Supervisor, SysProcessBackend};

use crate::auth::AuthService;
use crate::config::Config;
use crate::ws::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ttyhub=info".into()),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let auth = Arc::new(AuthService::new(
        config.admin_user.clone(),
        config.admin_password.clone(),
        config.rate_limit_window,
        config.rate_limit_max_attempts,
    ));

    let hub = Arc::new(ConnectionHub::new());
    let registry = SessionRegistry::new(Arc::clone(&hub));
    let _poller = libttyhub::poller::spawn(Arc::clone(&registry));

    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    let supervisor = Arc::new(
        Supervisor::new(
            ProgramStore::new(&config.programs_file),
            ScreenClient::new(),
            Box::new(SysProcessBackend::new()),
            status_tx,
        )
        .context("failed to load program definitions")?,
    );
    supervisor.autostart().await;
    tokio::spawn(Arc::clone(&supervisor).run_monitor_loop());

    // Supervisor transitions fan out to every authenticated viewer.
    let status_hub = Arc::clone(&hub);
    tokio::spawn(async move {
        while let Some(program) = status_rx.recv().await {
            status_hub.broadcast(ServerMessage::ProgramStatusChanged { program });
        }
    });

    let cors = build_cors(&config.allowed_origins)?;
    let state = AppState {
        auth,
        hub,
        registry: Arc::clone(&registry),
        supervisor,
    };
    let app = Router::new()
        .route("/api/login", post(ws::login))
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .with_state(state);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("ttyhub listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Kill every live session and wait for each exit acknowledgement before
    // the process goes away.
    registry.drain().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown requested");
}

fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?,
        );
    }
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any))
}
