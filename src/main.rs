//! ==============================================================================
//! main.rs - sensorhub daemon entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the engine to the outside world. everything with invariants lives
//!     in the library; this file only:
//!     - initializes logging (RUST_LOG wins over [logging] level)
//!     - loads config/engine.toml (falls back to defaults)
//!     - builds the hal (mock or rppal, by cargo feature) and the switchboard
//!     - serves a small json api for the dashboard
//!     - on SIGINT/SIGTERM runs the switchboard's stop sequence before exiting
//!
//! routes:
//!     GET  /api/activity                     slot phase + active activity
//!     POST /api/activity/:kind/start         switch to an activity
//!     POST /api/activity/:kind/stop          stop it if it is the active one
//!     GET  /api/:kind/latest                 latest snapshot
//!     GET  /api/:kind/history                canonical history series
//!     POST /api/:kind/history/clear          wipe history
//!
//!     :kind is one of climate | distance | hazard | location
//!
//! ==============================================================================

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sensorhub::hal::Hal;
use sensorhub::sensors::HalDeviceFactory;
use sensorhub::{ActivityKind, EngineConfig, PersistenceError, Switchboard};

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: configuration, then logging at the configured level
    let config = EngineConfig::load_or_default();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    info!("sensorhub starting");
    config.log_summary();

    // step 2: hardware + engine
    let hal = Arc::new(build_hal(&config)?);
    let factory = Arc::new(HalDeviceFactory::new(hal, config.clone()));
    let board = Arc::new(Switchboard::new(config.clone(), factory));

    // step 3: web server until a shutdown signal arrives
    let app = Router::new()
        .route("/api/activity", get(activity_handler))
        .route("/api/activity/:kind/start", post(start_handler))
        .route("/api/activity/:kind/stop", post(stop_handler))
        .route("/api/:kind/latest", get(latest_handler))
        .route("/api/:kind/history", get(history_handler))
        .route("/api/:kind/history/clear", post(clear_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&board));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!(bind = %config.server.bind, "api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("web server failed")?;

    // step 4: ordered stop of whatever is running (outputs OFF, history saved)
    board.shutdown().await;
    info!("sensorhub stopped");
    Ok(())
}

#[cfg(not(feature = "hardware"))]
fn build_hal(config: &EngineConfig) -> Result<Hal> {
    // give the mock rangers something plausible to echo
    let ranger = config.distance.ranger;
    let mut hal = Hal::new()?.with_ranger(ranger.trigger_pin, ranger.echo_pin, 42.0);
    if let Some(secondary) = config.distance.secondary {
        hal = hal.with_ranger(secondary.trigger_pin, secondary.echo_pin, 57.5);
    }
    Ok(hal)
}

#[cfg(feature = "hardware")]
fn build_hal(_config: &EngineConfig) -> Result<Hal> {
    Hal::new().context("failed to open gpio")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("ctrl-c handler failed: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("SIGTERM handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    warn!(signal = reason, "shutting down");
}

// ==============================================================================
// handlers
// ==============================================================================

type Board = State<Arc<Switchboard>>;

async fn activity_handler(State(board): Board) -> Json<serde_json::Value> {
    let active = board.active_activity().await;
    Json(json!({"status": board.status(), "active": active}))
}

async fn start_handler(State(board): Board, Path(kind): Path<ActivityKind>) -> Response {
    match board.start_activity(kind).await {
        Ok(()) => Json(json!({"status": "ok", "activity": kind})).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "error", "activity": kind, "message": e.to_string()})),
        )
            .into_response(),
    }
}

async fn stop_handler(State(board): Board, Path(kind): Path<ActivityKind>) -> Json<serde_json::Value> {
    let stopped = board.stop_activity(kind).await;
    Json(json!({"status": "ok", "activity": kind, "stopped": stopped}))
}

async fn latest_handler(State(board): Board, Path(kind): Path<ActivityKind>) -> Response {
    Json(board.latest_reading(kind).await).into_response()
}

async fn history_handler(State(board): Board, Path(kind): Path<ActivityKind>) -> Response {
    match board.history(kind) {
        Some(series) => Json(series).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "message": format!("{} keeps no history", kind)})),
        )
            .into_response(),
    }
}

async fn clear_handler(State(board): Board, Path(kind): Path<ActivityKind>) -> Response {
    match board.clear_history(kind).await {
        Ok(()) => Json(json!({"status": "ok", "activity": kind})).into_response(),
        Err(e @ PersistenceError::NoHistory(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({"status": "error", "message": e.to_string()}))).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "message": e.to_string()})),
        )
            .into_response(),
    }
}
