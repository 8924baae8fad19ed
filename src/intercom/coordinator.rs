//! # Session Coordinator
//!
//! The state machine for one doorbell. It sequences the control client, the
//! stream channels and the transcoder so that callers only deal with four
//! intents: test connectivity, send a file, start/stop talking, abort.
//!
//! ## Session States:
//! ```text
//! Idle --start--> Starting --ok--> Active --stop--> Stopping --> Idle
//!                    |  fail -> Idle
//! Starting | Active | file transfer --abort--> Aborting --> Idle
//! ```
//!
//! ## Locking:
//! - `lifecycle` (async mutex): held for the whole of `start` and `stop`, so
//!   only one lifecycle transition per device is ever in flight
//! - `session` (sync mutex): guards the state record, never held across an
//!   `.await`
//! - `abort` takes neither lock for longer than a field update. It bumps the
//!   abort epoch, which a pending `start` checks when its request returns and
//!   which a running file transfer watches to cancel itself.

use crate::audio::format::{needs_transcoding, probe_wav};
use crate::audio::AudioTranscoder;
use crate::config::SessionAuthority;
use crate::error::{IntercomError, IntercomResult};
use crate::intercom::control::ControlClient;
use crate::intercom::endpoint::{Endpoint, StreamDirection};
use crate::intercom::stream::StreamChannelManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
    Aborting,
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    created_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a coordinator, returned by the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub created_at: Option<DateTime<Utc>>,
    pub transferring: bool,
    pub to_device_open: bool,
    pub from_device_open: bool,
    pub abort_epoch: u64,
}

/// Counts a running file transfer for as long as it is alive.
struct TransferGuard<'a>(&'a AtomicUsize);

impl<'a> TransferGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SessionCoordinator {
    endpoint: Arc<Endpoint>,
    control: ControlClient,
    streams: StreamChannelManager,
    transcoder: Arc<dyn AudioTranscoder>,
    authority: SessionAuthority,
    lifecycle: tokio::sync::Mutex<()>,
    session: Mutex<Session>,
    abort_epoch: watch::Sender<u64>,
    transfers: AtomicUsize,
}

impl SessionCoordinator {
    pub fn new(
        endpoint: Endpoint,
        transcoder: Arc<dyn AudioTranscoder>,
        authority: SessionAuthority,
    ) -> Self {
        let endpoint = Arc::new(endpoint);
        let (abort_epoch, _) = watch::channel(0);

        Self {
            control: ControlClient::new(endpoint.clone()),
            streams: StreamChannelManager::new(endpoint.clone()),
            endpoint,
            transcoder,
            authority,
            lifecycle: tokio::sync::Mutex::new(()),
            session: Mutex::new(Session {
                state: SessionState::Idle,
                created_at: None,
            }),
            abort_epoch,
            transfers: AtomicUsize::new(0),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn authority(&self) -> SessionAuthority {
        self.authority
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.session().state
    }

    pub fn is_transferring(&self) -> bool {
        self.transfers.load(Ordering::SeqCst) > 0
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (state, created_at) = {
            let session = self.session();
            (session.state, session.created_at)
        };

        SessionSnapshot {
            state,
            created_at,
            transferring: self.is_transferring(),
            to_device_open: self.streams.is_connected(StreamDirection::ToDevice),
            from_device_open: self.streams.is_connected(StreamDirection::FromDevice),
            abort_epoch: *self.abort_epoch.borrow(),
        }
    }

    /// Check that the middleware answers its health route.
    pub async fn test_connection(&self) -> IntercomResult<bool> {
        self.control.test_connection().await
    }

    /// Open a talk session.
    ///
    /// With local authority, starting an active session returns true without
    /// a network call. Returns false if the middleware refuses or if an abort
    /// arrives while the request is in flight.
    pub async fn start(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;

        let epoch = {
            let mut session = self.session();
            if session.state == SessionState::Active && self.authority == SessionAuthority::Local {
                debug!(device = %self.endpoint.id, "Session already active");
                return true;
            }
            session.state = SessionState::Starting;
            *self.abort_epoch.borrow()
        };

        let started = match self.authority {
            SessionAuthority::Local => self.control.start_session().await,
            SessionAuthority::Server => self.control.force_start_session().await,
        };

        {
            let mut session = self.session();
            if *self.abort_epoch.borrow() != epoch {
                drop(session);
                self.control.forget_session();
                warn!(device = %self.endpoint.id, "Session start overtaken by abort");
                return false;
            }

            if started {
                session.state = SessionState::Active;
                session.created_at = Some(Utc::now());
                info!(device = %self.endpoint.id, "Talk session active");
                return true;
            }

            session.state = SessionState::Idle;
            session.created_at = None;
        }

        error!(device = %self.endpoint.id, "Failed to start session");
        self.streams.close_all().await;
        false
    }

    /// Close the talk session.
    ///
    /// Channels are closed first, then the stop request is sent whatever the
    /// channel teardown did. The session always ends `Idle`; the return
    /// value only reports whether the middleware accepted the stop.
    pub async fn stop(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut session = self.session();
            if session.state == SessionState::Idle && self.authority == SessionAuthority::Local {
                debug!(device = %self.endpoint.id, "Session already idle");
                return true;
            }
            session.state = SessionState::Stopping;
        }

        self.streams.close_all().await;

        let stopped = match self.authority {
            SessionAuthority::Local => self.control.stop_session().await,
            SessionAuthority::Server => self.control.force_stop_session().await,
        };

        {
            let mut session = self.session();
            session.state = SessionState::Idle;
            session.created_at = None;
        }

        if stopped {
            info!(device = %self.endpoint.id, "Talk session stopped");
        } else {
            warn!(device = %self.endpoint.id, "Middleware rejected session stop; local session closed anyway");
        }
        stopped
    }

    /// Cancel everything in flight for this device.
    ///
    /// Sends one abort request whatever the state, closes both channels and
    /// leaves the session `Idle` even if the request fails. Running file
    /// transfers observe the abort and give up.
    pub async fn abort(&self) -> bool {
        {
            let mut session = self.session();
            session.state = SessionState::Aborting;
        }
        self.abort_epoch.send_modify(|epoch| *epoch += 1);
        info!(device = %self.endpoint.id, "Aborting all operations");

        let aborted = self.control.abort().await;
        self.streams.close_all().await;

        {
            let mut session = self.session();
            if session.state == SessionState::Aborting {
                session.state = SessionState::Idle;
                session.created_at = None;
            }
        }

        if !aborted {
            warn!(device = %self.endpoint.id, "Middleware abort failed; local state reset");
        }
        aborted
    }

    /// Play an audio file on the doorbell speaker.
    ///
    /// ## Flow:
    /// 1. Reject missing or unreadable input with `InputNotFound`
    /// 2. Transcode unless the file already has a `.wav` extension
    /// 3. Upload the bytes
    /// 4. Delete the transcoder's temporary file on every path
    ///
    /// Conversion and upload failures are logged and reported as `Ok(false)`.
    pub async fn send_file(&self, path: &Path) -> IntercomResult<bool> {
        ensure_readable(path).await?;

        let _transfer = TransferGuard::new(&self.transfers);
        let mut aborted = self.abort_epoch.subscribe();

        tokio::select! {
            sent = self.transfer(path) => Ok(sent),
            _ = aborted.changed() => {
                warn!(device = %self.endpoint.id, path = %path.display(), "File transfer aborted");
                Ok(false)
            }
        }
    }

    async fn transfer(&self, path: &Path) -> bool {
        let job = if needs_transcoding(path) {
            match self.transcoder.convert(path).await {
                Ok(job) => Some(job),
                Err(err) => {
                    error!(device = %self.endpoint.id, path = %path.display(), error = %err, "Failed to convert audio file");
                    return false;
                }
            }
        } else {
            None
        };

        let upload_path = job.as_ref().map_or(path, |job| job.output_path());
        let audio = match tokio::fs::read(upload_path).await {
            Ok(audio) => audio,
            Err(err) => {
                error!(device = %self.endpoint.id, path = %upload_path.display(), error = %err, "Failed to read audio file");
                if let Some(job) = job {
                    job.discard();
                }
                return false;
            }
        };

        if job.is_none() {
            match probe_wav(&audio) {
                Some(format) if !format.is_device_native() => warn!(
                    device = %self.endpoint.id,
                    path = %path.display(),
                    audio_format = format.audio_format,
                    sample_rate = format.sample_rate,
                    channels = format.channels,
                    "WAV file is not 8kHz mono mu-law; sending unchanged"
                ),
                None => warn!(
                    device = %self.endpoint.id,
                    path = %path.display(),
                    "File has a .wav extension but no RIFF/WAVE header; sending unchanged"
                ),
                _ => {}
            }
        }

        let sent = self.control.send_file(audio).await;
        if let Some(job) = job {
            job.discard();
        }

        if !sent {
            error!(device = %self.endpoint.id, path = %path.display(), "Failed to send audio file");
        }
        sent
    }

    /// Relay raw audio to the doorbell speaker over the to-device channel.
    pub async fn send_audio(&self, bytes: Vec<u8>) -> IntercomResult<bool> {
        if self.state() != SessionState::Active {
            return Err(IntercomError::SessionInactive);
        }

        let channel = self.streams.connect_to().await?;

        // Stopped or aborted while connecting.
        if self.state() != SessionState::Active {
            self.streams.close(&channel).await;
            return Err(IntercomError::SessionInactive);
        }

        Ok(self.streams.send_bytes(&channel, bytes).await)
    }

    /// Follow audio coming from the doorbell microphone.
    pub async fn listen(&self) -> IntercomResult<broadcast::Receiver<Vec<u8>>> {
        if self.state() != SessionState::Active {
            return Err(IntercomError::SessionInactive);
        }

        let channel = self.streams.connect_from().await?;
        if self.state() != SessionState::Active {
            self.streams.close(&channel).await;
            return Err(IntercomError::SessionInactive);
        }

        Ok(channel.subscribe())
    }
}

async fn ensure_readable(path: &Path) -> IntercomResult<()> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| IntercomError::InputNotFound(path.to_path_buf()))?;
    match file.metadata().await {
        Ok(metadata) if metadata.is_file() => Ok(()),
        _ => Err(IntercomError::InputNotFound(path.to_path_buf())),
    }
}
