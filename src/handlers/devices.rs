use crate::error::{AppError, AppResult};
use crate::handlers::find_device;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/devices`
pub async fn list_devices(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let devices: Vec<_> = state
        .devices
        .list()
        .iter()
        .map(|entry| entry.summary())
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "devices": devices
    })))
}

/// `GET /api/v1/devices/{id}`
pub async fn get_device(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let entry = find_device(&state, &path)?;
    Ok(HttpResponse::Ok().json(entry.summary()))
}

/// `POST /api/v1/devices/{id}/test`
///
/// Runs the connectivity test on demand. A success also marks a device
/// that failed setup at startup as ready.
pub async fn test_device(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let entry = find_device(&state, &path)?;

    if !entry.setup().await {
        let reason = entry.last_error().unwrap_or_else(|| {
            format!(
                "Cannot connect to server at {}",
                entry.coordinator.endpoint().base_url()
            )
        });
        return Err(AppError::Unavailable(reason));
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "device": entry.id(),
        "ready": true,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
