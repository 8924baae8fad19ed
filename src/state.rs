//! # Application State Management
//!
//! Shared state handed to every HTTP request handler through `web::Data`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets every actix worker hold the same state
//! - **Memory safety**: Data is freed when the last reference is dropped
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **Used for**: Configuration and request metrics
//!
//! ## What lives here:
//! - The loaded configuration
//! - The device registry (one session coordinator per doorbell)
//! - Request metrics collected by the metrics middleware
//! - Server start time for uptime reporting

use crate::config::AppConfig;
use crate::intercom::DeviceRegistry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state shared across all HTTP request handlers.
///
/// ## Thread Safety Pattern:
/// Mutable data sits behind `Arc<RwLock<T>>`; the registry manages its own
/// locking internally. Cloning an `AppState` is cheap and every clone sees
/// the same data.
#[derive(Clone)]
pub struct AppState {
    /// Configuration loaded at startup
    pub config: Arc<RwLock<AppConfig>>,

    /// Doorbells this relay talks to
    pub devices: DeviceRegistry,

    /// Request metrics (updated by the metrics middleware on every request)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
///
/// ## Why these metrics matter:
/// - **request_count**: Total requests processed
/// - **error_count**: Requests that ended in a 4xx/5xx
/// - **active_talk_sockets**: Browser talk relays currently connected
/// - **endpoint_metrics**: Per-route statistics, keyed by route pattern
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_talk_sockets: u32,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for one route.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create the state from loaded configuration and a device registry.
    pub fn new(config: AppConfig, devices: DeviceRegistry) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            devices,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other requests aren't
    /// blocked while the caller works with the copy.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_metrics<T>(&self, update: impl FnOnce(&mut AppMetrics) -> T) -> T {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics)
    }

    pub fn increment_request_count(&self) {
        self.with_metrics(|m| m.request_count += 1);
    }

    pub fn increment_error_count(&self) {
        self.with_metrics(|m| m.error_count += 1);
    }

    /// Record detailed metrics for one route.
    ///
    /// ## Parameters:
    /// - **endpoint**: Method plus route pattern (e.g., "POST /api/v1/devices/{id}/abort")
    /// - **duration_ms**: How long the request took
    /// - **is_error**: Whether it ended in a 4xx/5xx
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|m| {
            let metric = m.endpoint_metrics.entry(endpoint.to_string()).or_default();
            metric.request_count += 1;
            metric.total_duration_ms += duration_ms;
            if is_error {
                metric.error_count += 1;
            }
        });
    }

    pub fn increment_talk_sockets(&self) {
        self.with_metrics(|m| m.active_talk_sockets += 1);
    }

    /// Decrement the talk socket counter, never below zero.
    pub fn decrement_talk_sockets(&self) {
        self.with_metrics(|m| m.active_talk_sockets = m.active_talk_sockets.saturating_sub(1));
    }

    /// Copy of the current metrics, taken under a read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate from 0.0 (no errors) to 1.0 (every request failed).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
