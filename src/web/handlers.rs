use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::stream::SessionSnapshot;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Configured camera with its session state
#[derive(Serialize)]
pub struct CameraStatus {
    pub name: String,
    /// Dedicated viewer listener, if any
    pub ws_port: Option<u16>,
    pub session: SessionSnapshot,
}

async fn camera_status(state: &AppState, name: &str) -> Result<CameraStatus> {
    let config = state.config.get();
    let camera = config
        .camera(name)
        .ok_or_else(|| AppError::NotFound(format!("Camera '{}'", name)))?;

    // Looking at a camera must not create its session
    let session = match state.registry.get(name) {
        Some(handle) => handle.snapshot().await?,
        None => SessionSnapshot::idle(camera),
    };

    Ok(CameraStatus {
        name: camera.name.clone(),
        ws_port: camera.ws_port,
        session,
    })
}

pub async fn list_cameras(State(state): State<Arc<AppState>>) -> Result<Json<Vec<CameraStatus>>> {
    let config = state.config.get();
    let mut cameras = Vec::with_capacity(config.cameras.len());
    for camera in &config.cameras {
        cameras.push(camera_status(&state, &camera.name).await?);
    }
    Ok(Json(cameras))
}

pub async fn get_camera(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<CameraStatus>> {
    Ok(Json(camera_status(&state, &name).await?))
}

#[derive(Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

/// Stop the running muxer; attached viewers get a fresh one
pub async fn restart_camera(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>> {
    let session = state.session(&name)?;
    session.restart()?;
    info!(camera = %name, "Session restart requested");

    Ok(Json(ActionResponse {
        success: true,
        message: format!("Restart requested for '{}'", name),
    }))
}
