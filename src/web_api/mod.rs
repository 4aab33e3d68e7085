//! Web API - HTTP and WebSocket surface
//!
//! ## Endpoints
//!
//! - `GET /healthz` - service and upstream reachability
//! - `GET /stream/{camera_id}?token=` - live MJPEG multipart stream
//! - `GET /stream-frame/{camera_id}` - latest still frame (worker only)
//! - `POST /detect` - one detection frame with camera context
//! - `GET /alerts/live?token=` - WebSocket alert event channel

pub mod routes;

pub use routes::create_router;

use crate::models::HealthResponse;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let detector_reachable = state.detector.health_check().await.unwrap_or(false);
    let directory_reachable = state.directory.health_check().await.unwrap_or(false);

    Json(HealthResponse {
        status: "ok".to_string(),
        detector_reachable,
        directory_reachable,
        active_connections: state.hub.connection_count(),
    })
}
