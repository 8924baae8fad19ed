//! # HTTP Handlers
//!
//! Thin adapters between HTTP and the session coordinators. Each handler
//! looks up the device, calls one coordinator operation and turns the
//! outcome into JSON or an [`AppError`].

pub mod audio;
pub mod config;
pub mod devices;
pub mod session;
pub mod talk;

use crate::error::{AppError, AppResult};
use crate::health;
use crate::intercom::DeviceEntry;
use crate::state::AppState;
use actix_web::web;
use std::sync::Arc;

pub use self::audio::*;
pub use self::config::*;
pub use self::devices::*;
pub use self::session::*;
pub use self::talk::*;

/// All `/api/v1` routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(get_config))
            .route("/devices", web::get().to(list_devices))
            .route("/devices/{id}", web::get().to(get_device))
            .route("/devices/{id}/test", web::post().to(test_device))
            .route("/devices/{id}/play-file", web::post().to(play_file))
            .route("/devices/{id}/play-upload", web::post().to(play_upload))
            .route("/devices/{id}/session/start", web::post().to(start_session))
            .route("/devices/{id}/session/stop", web::post().to(stop_session))
            .route("/devices/{id}/abort", web::post().to(abort))
            .route("/devices/{id}/talk", web::get().to(talk)),
    );
}

/// Look up a device by id.
pub(crate) fn find_device(state: &AppState, id: &str) -> AppResult<Arc<DeviceEntry>> {
    state
        .devices
        .get(id)
        .ok_or_else(|| AppError::NotFound(format!("Unknown device '{}'", id)))
}

/// Look up a device that finished setup. Devices whose middleware was
/// unreachable answer 503 until a retry succeeds.
pub(crate) fn ready_device(state: &AppState, id: &str) -> AppResult<Arc<DeviceEntry>> {
    let entry = find_device(state, id)?;
    if !entry.is_ready() {
        let reason = entry.last_error().unwrap_or_else(|| {
            format!(
                "Cannot connect to server at {}",
                entry.coordinator.endpoint().base_url()
            )
        });
        return Err(AppError::Unavailable(reason));
    }
    Ok(entry)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::{AppConfig, DeviceConfig};
    use crate::intercom::DeviceRegistry;
    use crate::state::AppState;

    /// State with one device `front` pointed at `url`, setup already run.
    pub async fn state_with_device(url: &str) -> AppState {
        let config = AppConfig {
            devices: vec![DeviceConfig {
                id: "front".to_string(),
                name: Some("Front Door".to_string()),
                middleware_url: url.to_string(),
            }],
            ..AppConfig::default()
        };
        let registry = DeviceRegistry::from_config(&config);
        registry.setup_all().await;
        AppState::new(config, registry)
    }
}
