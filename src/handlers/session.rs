//! Talk session lifecycle endpoints.

use crate::error::{AppError, AppResult};
use crate::handlers::{find_device, ready_device};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `POST /api/v1/devices/{id}/session/start`
pub async fn start_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let entry = ready_device(&state, &path)?;

    if !entry.coordinator.start().await {
        return Err(AppError::Upstream("Failed to start session".to_string()));
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "started",
        "device": entry.id(),
        "session": entry.coordinator.snapshot()
    })))
}

/// `POST /api/v1/devices/{id}/session/stop`
///
/// The local session is closed even when the middleware rejects the stop;
/// the rejection is still reported as 502.
pub async fn stop_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let entry = ready_device(&state, &path)?;

    if !entry.coordinator.stop().await {
        return Err(AppError::Upstream("Failed to stop session".to_string()));
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "stopped",
        "device": entry.id(),
        "session": entry.coordinator.snapshot()
    })))
}

/// `POST /api/v1/devices/{id}/abort`
///
/// Sent even to a device that is not ready; abort must always be attempted.
pub async fn abort(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let entry = find_device(&state, &path)?;

    if !entry.coordinator.abort().await {
        return Err(AppError::Upstream("Failed to abort operations".to_string()));
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "aborted",
        "device": entry.id(),
        "session": entry.coordinator.snapshot()
    })))
}
