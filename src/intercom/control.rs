//! # Control Client
//!
//! HTTP calls against the doorbell middleware: health check, file upload,
//! session start/stop and abort. Every call carries its own timeout
//! (control or upload class) so a hung middleware can never stall a caller
//! indefinitely.
//!
//! ## Failure Policy:
//! - `test_connection` propagates transport errors as [`IntercomError::Connect`]
//! - Every other call logs the failure and answers `false`

use crate::error::{IntercomError, IntercomResult};
use crate::intercom::endpoint::Endpoint;
use reqwest::multipart::{Form, Part};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Field name the middleware expects for uploaded audio.
pub const UPLOAD_FIELD: &str = "audio";
/// File name attached to every upload; the middleware ignores it.
pub const UPLOAD_FILENAME: &str = "audio_file";
pub const UPLOAD_CONTENT_TYPE: &str = "application/octet-stream";

pub struct ControlClient {
    endpoint: Arc<Endpoint>,
    http: reqwest::Client,
    /// Local view of whether the middleware has an open talk session
    session_started: AtomicBool,
}

impl ControlClient {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self::with_client(endpoint, reqwest::Client::new())
    }

    pub fn with_client(endpoint: Arc<Endpoint>, http: reqwest::Client) -> Self {
        Self {
            endpoint,
            http,
            session_started: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_session_started(&self) -> bool {
        self.session_started.load(Ordering::SeqCst)
    }

    /// Probe the middleware's health route.
    ///
    /// ## Returns:
    /// - **Ok(true)**: The middleware answered 2xx
    /// - **Ok(false)**: It answered, but with another status
    /// - **Err(Connect)**: Unreachable or timed out
    pub async fn test_connection(&self) -> IntercomResult<bool> {
        let url = self.endpoint.url(&self.endpoint.routes().health);

        let response = self
            .http
            .get(&url)
            .timeout(self.endpoint.control_timeout())
            .send()
            .await
            .map_err(|err| IntercomError::Connect {
                url: self.endpoint.base_url().to_string(),
                reason: err.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(device = %self.endpoint.id, "Middleware health check passed");
            Ok(true)
        } else {
            warn!(
                device = %self.endpoint.id,
                status = status.as_u16(),
                "Middleware health check returned non-success status"
            );
            Ok(false)
        }
    }

    /// Upload an audio file for playback on the doorbell speaker.
    pub async fn send_file(&self, audio: Vec<u8>) -> bool {
        let size = audio.len();
        let part = match Part::bytes(audio)
            .file_name(UPLOAD_FILENAME)
            .mime_str(UPLOAD_CONTENT_TYPE)
        {
            Ok(part) => part,
            Err(err) => {
                error!(device = %self.endpoint.id, error = %err, "Failed to build upload body");
                return false;
            }
        };
        let form = Form::new().part(UPLOAD_FIELD, part);

        let sent = self
            .post(
                "send audio file",
                &self.endpoint.routes().play_file,
                self.endpoint.upload_timeout(),
                Some(form),
            )
            .await;
        if sent {
            info!(device = %self.endpoint.id, bytes = size, "Audio file sent");
        }
        sent
    }

    /// Open a talk session unless one is already open.
    pub async fn start_session(&self) -> bool {
        if self.is_session_started() {
            warn!(device = %self.endpoint.id, "Session already started");
            return true;
        }
        self.force_start_session().await
    }

    /// Open a talk session, sending the request even if one is open.
    pub async fn force_start_session(&self) -> bool {
        let started = self
            .post(
                "start session",
                &self.endpoint.routes().session_start,
                self.endpoint.control_timeout(),
                None,
            )
            .await;
        if started {
            self.session_started.store(true, Ordering::SeqCst);
            info!(device = %self.endpoint.id, "Session started");
        }
        started
    }

    /// Close the talk session if one is open.
    pub async fn stop_session(&self) -> bool {
        if !self.is_session_started() {
            warn!(device = %self.endpoint.id, "Session not started");
            return true;
        }
        self.force_stop_session().await
    }

    /// Close the talk session unconditionally.
    ///
    /// The local flag is cleared whatever the middleware answers.
    pub async fn force_stop_session(&self) -> bool {
        let stopped = self
            .post(
                "stop session",
                &self.endpoint.routes().session_stop,
                self.endpoint.control_timeout(),
                None,
            )
            .await;
        self.session_started.store(false, Ordering::SeqCst);
        if stopped {
            info!(device = %self.endpoint.id, "Session stopped");
        }
        stopped
    }

    /// Cancel whatever the middleware is doing (playback, talk session).
    ///
    /// The local flag is cleared before the request goes out, so a start
    /// issued while the abort is in flight reaches the middleware.
    pub async fn abort(&self) -> bool {
        self.forget_session();
        let aborted = self
            .post(
                "abort",
                &self.endpoint.routes().abort,
                self.endpoint.control_timeout(),
                None,
            )
            .await;
        if aborted {
            info!(device = %self.endpoint.id, "Operations aborted");
        }
        aborted
    }

    /// Drop the local session flag without talking to the middleware.
    pub fn forget_session(&self) {
        self.session_started.store(false, Ordering::SeqCst);
    }

    async fn post(
        &self,
        operation: &'static str,
        path: &str,
        timeout: Duration,
        form: Option<Form>,
    ) -> bool {
        let url = self.endpoint.url(path);
        let mut request = self.http.post(&url).timeout(timeout);
        if let Some(form) = form {
            request = request.multipart(form);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(device = %self.endpoint.id, url = %url, "{} succeeded", operation);
                true
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                let err = IntercomError::Protocol {
                    operation,
                    status,
                    body,
                };
                error!(device = %self.endpoint.id, status = status, "{}", err);
                false
            }
            Err(err) => {
                error!(
                    device = %self.endpoint.id,
                    url = %url,
                    error = %err,
                    "Failed to {}",
                    operation
                );
                false
            }
        }
    }
}
