use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`: the configuration the relay is running with.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": config.server,
            "timeouts": config.timeouts,
            "transcoder": {
                "program": config.transcoder.program,
                "temp_dir": config.transcoder.temp_dir()
            },
            "session": config.session,
            "routes": config.routes,
            "devices": config.devices
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::intercom::DeviceRegistry;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_get_config_shows_session_and_timeouts() {
        let state = AppState::new(AppConfig::default(), DeviceRegistry::new());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["config"]["session"]["authority"], "local");
        assert_eq!(body["config"]["timeouts"]["control_secs"], 10);
        assert_eq!(body["config"]["routes"]["abort"], "/api/abort");
        assert_eq!(body["config"]["transcoder"]["program"], "ffmpeg");
    }
}
