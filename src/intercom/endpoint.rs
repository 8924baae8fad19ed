//! Addressing for one device's middleware server.

use crate::config::{DeviceConfig, RoutesConfig, TimeoutConfig};
use std::fmt;
use std::time::Duration;

/// Which way audio flows over a stream channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    /// Relay → doorbell speaker
    ToDevice,
    /// Doorbell microphone → relay
    FromDevice,
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamDirection::ToDevice => write!(f, "to-device"),
            StreamDirection::FromDevice => write!(f, "from-device"),
        }
    }
}

/// One physical device's middleware base address.
///
/// Built once at setup and never mutated. The base URL is stored without a
/// trailing slash so route paths (which start with `/`) can be appended
/// directly.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    base_url: String,
    control_timeout: Duration,
    upload_timeout: Duration,
    routes: RoutesConfig,
}

impl Endpoint {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        base_url: &str,
        timeouts: &TimeoutConfig,
        routes: RoutesConfig,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            base_url: normalize_base_url(base_url),
            control_timeout: timeouts.control(),
            upload_timeout: timeouts.upload(),
            routes,
        }
    }

    pub fn from_device(device: &DeviceConfig, timeouts: &TimeoutConfig, routes: &RoutesConfig) -> Self {
        Self::new(
            device.id.clone(),
            device.display_name(),
            &device.middleware_url,
            timeouts,
            routes.clone(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn control_timeout(&self) -> Duration {
        self.control_timeout
    }

    pub fn upload_timeout(&self) -> Duration {
        self.upload_timeout
    }

    pub fn routes(&self) -> &RoutesConfig {
        &self.routes
    }

    /// Absolute HTTP URL for a middleware route.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// WebSocket URL for a stream channel.
    ///
    /// `http` becomes `ws` and `https` becomes `wss`; the rest of the base
    /// URL (host, port, path prefix) is kept.
    pub fn stream_url(&self, direction: StreamDirection) -> String {
        let path = match direction {
            StreamDirection::ToDevice => &self.routes.stream_to_device,
            StreamDirection::FromDevice => &self.routes.stream_from_device,
        };
        let http_url = self.url(path);

        if let Some(rest) = http_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = http_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            http_url
        }
    }
}

fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str) -> Endpoint {
        Endpoint::new(
            "front",
            "Front Door",
            url,
            &TimeoutConfig::default(),
            RoutesConfig::default(),
        )
    }

    #[test]
    fn test_trailing_slash_is_stripped() {
        let endpoint = endpoint(" http://10.0.0.5:8080/// ");
        assert_eq!(endpoint.base_url(), "http://10.0.0.5:8080");
        assert_eq!(endpoint.url("/healthz"), "http://10.0.0.5:8080/healthz");
        assert_eq!(endpoint.url("api/abort"), "http://10.0.0.5:8080/api/abort");
    }

    #[test]
    fn test_stream_urls_switch_scheme() {
        let plain = endpoint("http://10.0.0.5:8080/");
        assert_eq!(
            plain.stream_url(StreamDirection::ToDevice),
            "ws://10.0.0.5:8080/api/audio/to-device"
        );
        assert_eq!(
            plain.stream_url(StreamDirection::FromDevice),
            "ws://10.0.0.5:8080/api/audio/from-device"
        );

        let secure = endpoint("https://doorbell.local/middleware");
        assert_eq!(
            secure.stream_url(StreamDirection::ToDevice),
            "wss://doorbell.local/middleware/api/audio/to-device"
        );
    }

    #[test]
    fn test_from_device_uses_display_name_and_timeouts() {
        let device = DeviceConfig {
            id: "side".to_string(),
            name: None,
            middleware_url: "http://10.0.0.7".to_string(),
        };
        let timeouts = TimeoutConfig {
            control_secs: 3,
            upload_secs: 45,
        };
        let endpoint = Endpoint::from_device(&device, &timeouts, &RoutesConfig::default());
        assert_eq!(endpoint.name, "side");
        assert_eq!(endpoint.control_timeout(), Duration::from_secs(3));
        assert_eq!(endpoint.upload_timeout(), Duration::from_secs(45));
    }
}
