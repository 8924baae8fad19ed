//! # Device Registry
//!
//! Owns one [`SessionCoordinator`] per configured doorbell, keyed by device
//! id. The registry lives in `AppState` and is handed to every request
//! handler through `web::Data`.
//!
//! ## Setup:
//! Each device is probed with a connectivity test at startup. A device whose
//! middleware does not answer is kept in the registry as *not ready*, and a
//! background task keeps retrying until the middleware comes up.

use crate::audio::{AudioTranscoder, FfmpegTranscoder};
use crate::config::{AppConfig, DeviceConfig};
use crate::intercom::coordinator::{SessionCoordinator, SessionSnapshot};
use crate::intercom::endpoint::Endpoint;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct DeviceEntry {
    pub config: DeviceConfig,
    pub coordinator: Arc<SessionCoordinator>,
    ready: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// What `GET /devices` reports per device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub id: String,
    pub name: String,
    pub middleware_url: String,
    pub ready: bool,
    pub last_error: Option<String>,
    pub session: SessionSnapshot,
}

impl DeviceEntry {
    pub fn new(config: DeviceConfig, coordinator: SessionCoordinator) -> Self {
        Self {
            config,
            coordinator: Arc::new(coordinator),
            ready: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_outcome(&self, error: Option<String>) {
        self.ready.store(error.is_none(), Ordering::SeqCst);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Test connectivity and record the outcome.
    ///
    /// ## Returns:
    /// - **true**: The middleware answered its health route; device is ready
    /// - **false**: Unreachable or unhealthy; device stays not ready
    pub async fn setup(&self) -> bool {
        let base_url = self.coordinator.endpoint().base_url().to_string();

        match self.coordinator.test_connection().await {
            Ok(true) => {
                info!(device = %self.config.id, url = %base_url, "Device ready");
                self.set_outcome(None);
                true
            }
            Ok(false) => {
                let reason = format!("Cannot connect to server at {}", base_url);
                warn!(device = %self.config.id, "{}: health check failed", reason);
                self.set_outcome(Some(reason));
                false
            }
            Err(err) => {
                error!(device = %self.config.id, "{}", err);
                self.set_outcome(Some(err.to_string()));
                false
            }
        }
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.config.id.clone(),
            name: self.config.display_name().to_string(),
            middleware_url: self.coordinator.endpoint().base_url().to_string(),
            ready: self.is_ready(),
            last_error: self.last_error(),
            session: self.coordinator.snapshot(),
        }
    }
}

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, Arc<DeviceEntry>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one coordinator per configured device. All devices share a
    /// single transcoder.
    pub fn from_config(config: &AppConfig) -> Self {
        let transcoder: Arc<dyn AudioTranscoder> =
            Arc::new(FfmpegTranscoder::from_config(&config.transcoder));
        let registry = Self::new();

        for device in &config.devices {
            let endpoint = Endpoint::from_device(device, &config.timeouts, &config.routes);
            let coordinator =
                SessionCoordinator::new(endpoint, transcoder.clone(), config.session.authority);
            registry.insert(DeviceEntry::new(device.clone(), coordinator));
        }

        registry
    }

    pub fn insert(&self, entry: DeviceEntry) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.config.id.clone(), Arc::new(entry));
    }

    pub fn get(&self, id: &str) -> Option<Arc<DeviceEntry>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All devices, ordered by id.
    pub fn list(&self) -> Vec<Arc<DeviceEntry>> {
        let mut entries: Vec<_> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        entries
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run setup for every device. Returns how many are ready.
    pub async fn setup_all(&self) -> usize {
        let mut ready = 0;
        for entry in self.list() {
            if entry.setup().await {
                ready += 1;
            }
        }
        ready
    }

    /// Keep retrying setup for each device that is not ready yet.
    pub fn spawn_setup_retries(&self, interval: Duration) -> Vec<JoinHandle<()>> {
        self.list()
            .into_iter()
            .filter(|entry| !entry.is_ready())
            .map(|entry| {
                warn!(
                    device = %entry.config.id,
                    retry_secs = interval.as_secs(),
                    "Device not ready, will retry setup"
                );
                tokio::spawn(retry_until_ready(entry, interval))
            })
            .collect()
    }
}

async fn retry_until_ready(entry: Arc<DeviceEntry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; setup was just attempted.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if entry.setup().await {
            info!(device = %entry.config.id, "Device setup succeeded after retry");
            return;
        }
    }
}
