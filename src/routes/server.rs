//! Server status and control endpoints.

use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::orchestrator::HostCommand;
use crate::state::{AppState, ServerMode, ServerPhase};

/// Body of `GET /api/server`
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerStatus {
    pub mode: ServerMode,
    pub phase: ServerPhase,
    pub running: bool,
    pub loopback_addr: Option<SocketAddr>,
    pub export_addr: Option<SocketAddr>,
    pub version: String,
}

/// Body of `POST /api/server/mode`
#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: ServerMode,
}

pub async fn status(State(state): State<AppState>) -> Json<ServerStatus> {
    let server = state.server.borrow().clone();
    Json(ServerStatus {
        mode: server.mode,
        phase: server.phase,
        running: server.running(),
        loopback_addr: server.loopback_addr,
        export_addr: server.export_addr,
        version: state.version.to_string(),
    })
}

/// Queue a mode switch. The restart happens after this response is sent,
/// since it drains this very listener.
pub async fn set_mode(
    State(state): State<AppState>,
    Json(request): Json<ModeRequest>,
) -> Result<StatusCode, AppError> {
    tracing::info!(mode = ?request.mode, "Mode switch requested");
    state.control.send(HostCommand::SwitchMode(request.mode))?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn stop(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    tracing::info!("Server stop requested");
    state.control.send(HostCommand::StopServer)?;
    Ok(StatusCode::ACCEPTED)
}
