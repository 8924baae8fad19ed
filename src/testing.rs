//! In-process stand-in for the doorbell middleware, used by unit tests.
//!
//! Serves the same routes as the real middleware on `127.0.0.1:0`, counts
//! every call, records uploads and to-device audio, and can be told to fail
//! individual operations.

use actix::prelude::*;
use actix_multipart::Multipart;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use actix_web_actors::ws;
use futures_util::StreamExt;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One multipart upload as the middleware saw it.
#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub field: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub health_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub abort_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub stream_connects: AtomicUsize,

    pub fail_health: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_abort: AtomicBool,
    pub fail_upload: AtomicBool,

    /// Delay applied to `/api/session/start` after the call is counted
    pub start_delay_ms: AtomicU64,
    /// Delay applied to `/api/abort` after the call is counted
    pub abort_delay_ms: AtomicU64,

    pub uploads: Mutex<Vec<RecordedUpload>>,
    pub to_device_frames: Mutex<Vec<Vec<u8>>>,
    /// Frames pushed to every from-device client on each tick
    pub from_device_frames: Mutex<Vec<Vec<u8>>>,
}

impl MockState {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn to_device_frames(&self) -> Vec<Vec<u8>> {
        self.to_device_frames.lock().unwrap().clone()
    }
}

pub struct MockMiddleware {
    pub url: String,
    pub state: Arc<MockState>,
    handle: actix_web::dev::ServerHandle,
}

impl MockMiddleware {
    pub fn start() -> Self {
        let state = Arc::new(MockState::default());
        let data = web::Data::from(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/healthz", web::get().to(health))
                .route("/api/audio/play-file", web::post().to(play_file))
                .route("/api/session/start", web::post().to(session_start))
                .route("/api/session/stop", web::post().to(session_stop))
                .route("/api/abort", web::post().to(abort))
                .route("/api/audio/to-device", web::get().to(to_device))
                .route("/api/audio/from-device", web::get().to(from_device))
        })
        .workers(1)
        .disable_signals()
        .listen(listener)
        .unwrap()
        .run();

        let handle = server.handle();
        actix_web::rt::spawn(server);

        Self {
            url: format!("http://{}", addr),
            state,
            handle,
        }
    }
}

impl Drop for MockMiddleware {
    fn drop(&mut self) {
        // The stop command is sent eagerly; the returned future only waits
        // for completion.
        drop(self.handle.stop(false));
    }
}

/// A base URL nothing listens on.
pub fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn outcome(fail: &AtomicBool, body: &'static str) -> HttpResponse {
    if fail.load(Ordering::SeqCst) {
        HttpResponse::InternalServerError().body(body)
    } else {
        HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
    }
}

async fn health(state: web::Data<MockState>) -> HttpResponse {
    state.health_calls.fetch_add(1, Ordering::SeqCst);
    outcome(&state.fail_health, "unhealthy")
}

async fn session_start(state: web::Data<MockState>) -> HttpResponse {
    state.start_calls.fetch_add(1, Ordering::SeqCst);
    let delay = state.start_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        actix_web::rt::time::sleep(Duration::from_millis(delay)).await;
    }
    outcome(&state.fail_start, "device busy")
}

async fn session_stop(state: web::Data<MockState>) -> HttpResponse {
    state.stop_calls.fetch_add(1, Ordering::SeqCst);
    outcome(&state.fail_stop, "no session")
}

async fn abort(state: web::Data<MockState>) -> HttpResponse {
    state.abort_calls.fetch_add(1, Ordering::SeqCst);
    let delay = state.abort_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        actix_web::rt::time::sleep(Duration::from_millis(delay)).await;
    }
    outcome(&state.fail_abort, "abort failed")
}

async fn play_file(state: web::Data<MockState>, mut payload: Multipart) -> HttpResponse {
    state.upload_calls.fetch_add(1, Ordering::SeqCst);

    while let Some(item) = payload.next().await {
        let mut field = match item {
            Ok(field) => field,
            Err(err) => return HttpResponse::BadRequest().body(err.to_string()),
        };
        let (name, filename) = match field.content_disposition() {
            Some(cd) => (
                cd.get_name().unwrap_or_default().to_string(),
                cd.get_filename().map(|f| f.to_string()),
            ),
            None => (String::new(), None),
        };
        let content_type = field.content_type().map(|m| m.to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            match chunk {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(err) => return HttpResponse::BadRequest().body(err.to_string()),
            }
        }

        state.uploads.lock().unwrap().push(RecordedUpload {
            field: name,
            filename,
            content_type,
            bytes,
        });
    }

    outcome(&state.fail_upload, "playback rejected")
}

/// Records every binary frame the relay sends to the speaker.
struct SpeakerSocket {
    state: web::Data<MockState>,
}

impl Actor for SpeakerSocket {
    type Context = ws::WebsocketContext<Self>;
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SpeakerSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(bytes)) => {
                self.state.to_device_frames.lock().unwrap().push(bytes.to_vec());
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(_) => ctx.stop(),
            _ => {}
        }
    }
}

/// Pushes the configured microphone frames to the relay every 20ms.
struct MicrophoneSocket {
    state: web::Data<MockState>,
}

impl Actor for MicrophoneSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.run_interval(Duration::from_millis(20), |act, ctx| {
            let frames = act.state.from_device_frames.lock().unwrap().clone();
            for frame in frames {
                ctx.binary(frame);
            }
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MicrophoneSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(_) => ctx.stop(),
            _ => {}
        }
    }
}

async fn to_device(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<MockState>,
) -> Result<HttpResponse, actix_web::Error> {
    state.stream_connects.fetch_add(1, Ordering::SeqCst);
    ws::start(SpeakerSocket { state }, &req, stream)
}

async fn from_device(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<MockState>,
) -> Result<HttpResponse, actix_web::Error> {
    state.stream_connects.fetch_add(1, Ordering::SeqCst);
    ws::start(MicrophoneSocket { state }, &req, stream)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        actix_web::rt::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
