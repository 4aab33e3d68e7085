//! Route definitions and handlers

use crate::auth::{bearer_token, worker_secret_valid, WORKER_IDENTITY};
use crate::detection::FrameContext;
use crate::error::{Error, Result};
use crate::mjpeg::{EMPTY_JPEG, STREAM_CONTENT_TYPE};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(super::health_check))
        .route("/stream/:camera_id", get(live_stream))
        .route("/stream-frame/:camera_id", get(latest_frame))
        .route("/detect", post(detect))
        .route("/alerts/live", get(alerts_live))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// `GET /stream/{camera_id}` - long-lived MJPEG multipart stream for one
/// viewer, scoped to the cameras its identity owns
async fn live_stream(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = bearer_token(&headers, query.token.as_deref())
        .ok_or_else(|| Error::Unauthorized("Missing token".to_string()))?;
    let owner_id = state.verifier.verify(&token).await?;

    let camera = state
        .directory
        .camera_for_owner(&owner_id, &camera_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Camera {} not found", camera_id)))?;

    let stream = state
        .broadcaster
        .attach_viewer(&camera_id, &camera.stream_url)
        .await?;

    tracing::info!(camera_id = %camera_id, owner_id = %owner_id, "Live stream opened");

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "close")
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(format!("response build failed: {}", e)))?;

    Ok(response)
}

/// `GET /stream-frame/{camera_id}` - latest decoded frame for the
/// frame-pull worker. Always answers 200 with a JPEG body; before the
/// first frame (or on a supplier error) that body is a minimal empty
/// image so the worker's loop keeps polling.
async fn latest_frame(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    if !worker_secret_valid(&headers, &state.config.worker_secret) {
        return Err(Error::Unauthorized("Invalid worker secret".to_string()));
    }

    let frame = match state.supplier.latest_frame(&camera_id, None).await {
        Ok(Some(frame)) => frame,
        Ok(None) => Bytes::from_static(&EMPTY_JPEG),
        Err(e) => {
            tracing::warn!(camera_id = %camera_id, error = %e, "Frame supply failed");
            Bytes::from_static(&EMPTY_JPEG)
        }
    };

    Ok(([(header::CONTENT_TYPE, "image/jpeg")], frame))
}

#[derive(Debug, Default)]
struct DetectForm {
    image: Option<Vec<u8>>,
    camera_id: Option<String>,
    camera_name: Option<String>,
    location: Option<String>,
    user_id: Option<String>,
}

/// `POST /detect` - one frame plus camera context, forwarded through the
/// detection pipeline. Accepts either the worker secret or a user token.
async fn detect(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let identity = if worker_secret_valid(&headers, &state.config.worker_secret) {
        WORKER_IDENTITY.to_string()
    } else {
        let token = bearer_token(&headers, None)
            .ok_or_else(|| Error::Unauthorized("Missing credentials".to_string()))?;
        state.verifier.verify(&token).await?
    };

    let mut form = DetectForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::Validation(format!("invalid image field: {}", e)))?;
                form.image = Some(data.to_vec());
            }
            "cameraId" => form.camera_id = Some(read_text(field).await?),
            "cameraName" => form.camera_name = Some(read_text(field).await?),
            "location" => form.location = Some(read_text(field).await?),
            "userId" => form.user_id = Some(read_text(field).await?),
            _ => {}
        }
    }

    let image = form
        .image
        .filter(|i| !i.is_empty())
        .ok_or_else(|| Error::Validation("image field is required".to_string()))?;
    let camera_id = form
        .camera_id
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::Validation("cameraId field is required".to_string()))?;

    let user_id = form.user_id.or_else(|| {
        (identity != WORKER_IDENTITY).then(|| identity.clone())
    });

    let ctx = FrameContext {
        camera_id,
        camera_name: form.camera_name,
        location: form.location,
        user_id,
    };

    let detection = state.pipeline.process(image, ctx).await?;
    Ok(Json(detection))
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field
        .text()
        .await
        .map_err(|e| Error::Validation(format!("invalid form field: {}", e)))
}

/// `GET /alerts/live` - WebSocket alert event channel. The token is
/// verified before the upgrade so an invalid one is rejected with a
/// plain HTTP error instead of an accepted-then-closed socket.
async fn alerts_live(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let token = bearer_token(&headers, query.token.as_deref())
        .ok_or_else(|| Error::Unauthorized("Missing token".to_string()))?;
    let owner_id = state.verifier.verify(&token).await?;

    Ok(ws.on_upgrade(move |socket| alert_socket(socket, state, owner_id)))
}

async fn alert_socket(socket: WebSocket, state: AppState, owner_id: String) {
    let (connection_id, mut events) = state.hub.connect(&owner_id).await;
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if sender.send(Message::Text(event)).await.is_err() {
                break;
            }
        }
    });

    // Inbound messages are ignored; the loop only notices the close
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.disconnect(&owner_id, &connection_id).await;
    tracing::info!(owner_id = %owner_id, connection_id = %connection_id, "Alert connection closed");
}
