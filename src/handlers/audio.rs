//! File playback endpoints.

use crate::error::{AppError, AppResult};
use crate::handlers::ready_device;
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;

/// Largest upload accepted by `play-upload`.
const MAX_UPLOAD_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct PlayFileRequest {
    /// Path on the relay host
    pub audio_file: PathBuf,
}

/// Play a file that already exists on the relay host.
///
/// ## Endpoint: `POST /api/v1/devices/{id}/play-file`
///
/// ## Request:
/// ```json
/// { "audio_file": "/media/doorbell/welcome.mp3" }
/// ```
///
/// ## Errors:
/// - 400 "Audio file not found: ..." when the path is missing or unreadable
/// - 502 "Failed to send audio file" when conversion or upload fails
pub async fn play_file(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<PlayFileRequest>,
) -> AppResult<HttpResponse> {
    let entry = ready_device(&state, &path)?;
    let request = body.into_inner();

    send(&entry.coordinator, &request.audio_file).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "sent",
        "device": entry.id(),
        "audio_file": request.audio_file,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Upload an audio file and play it.
///
/// ## Endpoint: `POST /api/v1/devices/{id}/play-upload`
///
/// ## Request:
/// Multipart form data with an audio file field named "audio". The uploaded
/// file name's extension decides whether the file is transcoded.
pub async fn play_upload(
    state: web::Data<AppState>,
    path: web::Path<String>,
    mut payload: Multipart,
) -> AppResult<HttpResponse> {
    let entry = ready_device(&state, &path)?;

    let mut audio_data: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;

    while let Some(item) = payload.next().await {
        let mut field: Field =
            item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let content_disposition = field.content_disposition().ok_or_else(|| {
            AppError::ValidationError("Missing content disposition".to_string())
        })?;

        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?;

        if field_name == "audio" {
            filename = content_disposition.get_filename().map(|s| s.to_string());

            let mut bytes = Vec::new();
            while let Some(chunk) = field.next().await {
                let chunk =
                    chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
                if bytes.len() + chunk.len() > MAX_UPLOAD_SIZE {
                    return Err(AppError::ValidationError(format!(
                        "File too large (max: {} bytes)",
                        MAX_UPLOAD_SIZE
                    )));
                }
                bytes.extend_from_slice(&chunk);
            }

            audio_data = Some(bytes);
        }
    }

    let audio_bytes =
        audio_data.ok_or_else(|| AppError::ValidationError("No audio file provided".to_string()))?;
    let filename = filename.unwrap_or_else(|| "upload".to_string());

    // Keep the uploaded extension so `.wav` uploads skip conversion.
    let suffix = Path::new(&filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default();
    let upload = tempfile::Builder::new()
        .prefix("doorbell_upload_")
        .suffix(&suffix)
        .tempfile_in(state.get_config().transcoder.temp_dir())
        .map_err(|e| AppError::Internal(format!("Failed to store upload: {}", e)))?
        .into_temp_path();
    tokio::fs::write(&upload, &audio_bytes)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to store upload: {}", e)))?;

    info!(device = %entry.id(), filename = %filename, bytes = audio_bytes.len(), "Audio upload received");
    let result = send(&entry.coordinator, &upload).await;
    crate::audio::transcoder::remove_temp_file(upload);
    result?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "sent",
        "device": entry.id(),
        "file_info": {
            "filename": filename,
            "size_bytes": audio_bytes.len()
        },
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn send(
    coordinator: &crate::intercom::SessionCoordinator,
    file: &Path,
) -> AppResult<()> {
    if coordinator.send_file(file).await? {
        Ok(())
    } else {
        Err(AppError::Upstream("Failed to send audio file".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use crate::audio::format::{wav_header, WAVE_FORMAT_MULAW};
    use crate::handlers::{configure, test_support::state_with_device};
    use crate::testing::{MockMiddleware, MockState};
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App};
    use std::sync::atomic::Ordering;

    #[actix_web::test]
    async fn test_play_missing_file_is_400() {
        let mock = MockMiddleware::start();
        let state = state_with_device(&mock.url).await;
        let app = test::init_service(
            App::new().app_data(web::Data::new(state)).configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/devices/front/play-file")
            .set_json(serde_json::json!({ "audio_file": "/nonexistent/ring.mp3" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(
            body["error"]["message"],
            "Audio file not found: /nonexistent/ring.mp3"
        );
        assert_eq!(MockState::count(&mock.state.upload_calls), 0);
    }

    #[actix_web::test]
    async fn test_play_wav_file() {
        let mock = MockMiddleware::start();
        let state = state_with_device(&mock.url).await;
        let app = test::init_service(
            App::new().app_data(web::Data::new(state)).configure(configure),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("chime.wav");
        std::fs::write(&file, wav_header(WAVE_FORMAT_MULAW, 1, 8000, 8)).unwrap();

        let req = test::TestRequest::post()
            .uri("/api/v1/devices/front/play-file")
            .set_json(serde_json::json!({ "audio_file": file }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "sent");
        assert_eq!(MockState::count(&mock.state.upload_calls), 1);
    }

    #[actix_web::test]
    async fn test_rejected_upload_is_502() {
        let mock = MockMiddleware::start();
        mock.state.fail_upload.store(true, Ordering::SeqCst);
        let state = state_with_device(&mock.url).await;
        let app = test::init_service(
            App::new().app_data(web::Data::new(state)).configure(configure),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("chime.wav");
        std::fs::write(&file, wav_header(WAVE_FORMAT_MULAW, 1, 8000, 8)).unwrap();

        let req = test::TestRequest::post()
            .uri("/api/v1/devices/front/play-file")
            .set_json(serde_json::json!({ "audio_file": file }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["message"], "Failed to send audio file");
    }

    #[actix_web::test]
    async fn test_multipart_upload_is_forwarded() {
        let mock = MockMiddleware::start();
        let state = state_with_device(&mock.url).await;
        let app = test::init_service(
            App::new().app_data(web::Data::new(state)).configure(configure),
        )
        .await;

        let audio = wav_header(WAVE_FORMAT_MULAW, 1, 8000, 8);
        let boundary = "relay-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"audio\"; filename=\"greeting.wav\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: audio/wav\r\n\r\n");
        body.extend_from_slice(&audio);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        let req = test::TestRequest::post()
            .uri("/api/v1/devices/front/play-upload")
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={}", boundary),
            ))
            .set_payload(body)
            .to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(resp["status"], "sent");
        assert_eq!(resp["file_info"]["filename"], "greeting.wav");
        let uploads = mock.state.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].bytes, audio);
    }
}
