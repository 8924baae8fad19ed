//! # Configuration Management
//!
//! This module loads the relay's configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__PORT, APP_TIMEOUTS__CONTROL_SECS, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Devices:
//! Each `[[devices]]` table describes one doorbell reachable through its own
//! middleware server. Devices are usually declared in config.toml:
//!
//! ```toml
//! [[devices]]
//! id = "front-door"
//! name = "Front Door"
//! middleware_url = "http://192.168.1.20:8080"
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one concern of the relay (HTTP surface, middleware
/// timeouts, the external transcoder, session strategy, middleware routes,
/// and the device list), which keeps the TOML file readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub routes: RoutesConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Settings for the relay's own HTTP server.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from the local network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Per-call timeouts applied to every middleware request.
///
/// ## Timeout classes:
/// - `control_secs`: health checks, session start/stop, abort, and the
///   WebSocket handshake
/// - `upload_secs`: audio file uploads (larger bodies, slower device side)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub control_secs: u64,
    pub upload_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            control_secs: 10,
            upload_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn control(&self) -> Duration {
        Duration::from_secs(self.control_secs)
    }

    pub fn upload(&self) -> Duration {
        Duration::from_secs(self.upload_secs)
    }
}

/// External audio conversion tool.
///
/// ## Fields:
/// - `program`: executable name or path (looked up on PATH when bare)
/// - `temp_dir`: where converted files are written; the system temp
///   directory when unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    pub program: String,
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            temp_dir: None,
        }
    }
}

impl TranscoderConfig {
    /// Directory used for temporary audio files.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(env::temp_dir)
    }
}

/// Who owns the truth about whether a talk session is open.
///
/// - `Local`: the relay tracks the session and skips redundant start/stop
///   calls (idempotent short-circuit)
/// - `Server`: the middleware is authoritative; every start/stop request is
///   forwarded even when the local view already agrees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionAuthority {
    #[default]
    Local,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub authority: SessionAuthority,
    /// Seconds between setup attempts for a device whose middleware was
    /// unreachable at startup.
    pub setup_retry_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            authority: SessionAuthority::Local,
            setup_retry_secs: 30,
        }
    }
}

/// Middleware paths, appended to each device's base URL.
///
/// The defaults match the doorbell middleware's published API. The health
/// probe can be pointed at `/api/channels` for older middleware builds that
/// have no `/healthz`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutesConfig {
    pub health: String,
    pub play_file: String,
    pub session_start: String,
    pub session_stop: String,
    pub abort: String,
    pub stream_to_device: String,
    pub stream_from_device: String,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            health: "/healthz".to_string(),
            play_file: "/api/audio/play-file".to_string(),
            session_start: "/api/session/start".to_string(),
            session_stop: "/api/session/stop".to_string(),
            abort: "/api/abort".to_string(),
            stream_to_device: "/api/audio/to-device".to_string(),
            stream_from_device: "/api/audio/from-device".to_string(),
        }
    }
}

/// One configured doorbell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Identifier used in API paths (`/api/v1/devices/{id}`)
    pub id: String,
    /// Human-friendly name, defaults to the id
    #[serde(default)]
    pub name: Option<String>,
    /// Base address of the device's middleware server
    pub middleware_url: String,
}

impl DeviceConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            timeouts: TimeoutConfig::default(),
            transcoder: TranscoderConfig::default(),
            session: SessionConfig::default(),
            routes: RoutesConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_TIMEOUTS__UPLOAD_SECS=60`: Allow slower uploads
    /// - `APP_SESSION__AUTHORITY=server`: Let the middleware own session state
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Both timeout classes are non-zero
    /// - The transcoder program is set
    /// - Device ids are non-empty and unique
    /// - Every middleware URL uses http:// or https://
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.timeouts.control_secs == 0 || self.timeouts.upload_secs == 0 {
            return Err(anyhow::anyhow!("Timeouts must be greater than 0 seconds"));
        }

        if self.session.setup_retry_secs == 0 {
            return Err(anyhow::anyhow!("Setup retry interval must be greater than 0"));
        }

        if self.transcoder.program.trim().is_empty() {
            return Err(anyhow::anyhow!("Transcoder program cannot be empty"));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(anyhow::anyhow!("Device id cannot be empty"));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(anyhow::anyhow!("Duplicate device id '{}'", device.id));
            }
            let url = device.middleware_url.trim();
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(anyhow::anyhow!(
                    "Device '{}' middleware_url must start with http:// or https://, got: {}",
                    device.id,
                    device.middleware_url
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, url: &str) -> DeviceConfig {
        DeviceConfig {
            id: id.to_string(),
            name: None,
            middleware_url: url.to_string(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.timeouts.control(), Duration::from_secs(10));
        assert_eq!(config.timeouts.upload(), Duration::from_secs(30));
        assert_eq!(config.session.authority, SessionAuthority::Local);
        assert_eq!(config.routes.health, "/healthz");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.timeouts.upload_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_validation() {
        let mut config = AppConfig::default();
        config.devices = vec![device("front", "http://10.0.0.2:8080")];
        assert!(config.validate().is_ok());

        config.devices.push(device("front", "http://10.0.0.3:8080"));
        assert!(config.validate().is_err());

        config.devices = vec![device("side", "ftp://10.0.0.3")];
        assert!(config.validate().is_err());

        config.devices = vec![device("  ", "http://10.0.0.3")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml_file() {
        let raw = r#"
            [server]
            host = "0.0.0.0"
            port = 9000

            [session]
            authority = "server"
            setup_retry_secs = 5

            [[devices]]
            id = "front-door"
            name = "Front Door"
            middleware_url = "http://192.168.1.20:8080/"
        "#;
        let config: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.session.authority, SessionAuthority::Server);
        assert_eq!(config.timeouts.control_secs, 10);
        assert_eq!(config.routes.play_file, "/api/audio/play-file");
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].display_name(), "Front Door");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_temp_dir_fallback() {
        let config = TranscoderConfig::default();
        assert_eq!(config.temp_dir(), env::temp_dir());
    }
}
