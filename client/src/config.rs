//! Compile-time defaults and the runtime configuration struct
//!
//! The board crate resolves build-time overrides once at startup and hands
//! the finished [`Config`] to the client.

use alloc::string::String;

/// Firmware version reported to the content service
pub const FIRMWARE_VERSION: &str = "1.0.0-paperdink";
/// Device type tag sent during registration
pub const DEVICE_TYPE: &str = "paperdink";
/// Product name used in the User-Agent header
pub const PRODUCT_NAME: &str = "paperdink-trmnl";

/// Default content service base URL
pub const DEFAULT_BASE_URL: &str = "https://usetrmnl.com";
pub const SETUP_ENDPOINT: &str = "/api/setup";
pub const DISPLAY_ENDPOINT: &str = "/api/display";
pub const LOGS_ENDPOINT: &str = "/api/logs";

/// Panel size in pixels
pub const DISPLAY_WIDTH: u32 = 400;
pub const DISPLAY_HEIGHT: u32 = 300;

/// Refresh interval used until the server sends one (30 minutes)
pub const DEFAULT_REFRESH_RATE_SECS: u32 = 1800;
/// Shortest deep sleep between cycles (5 minutes)
pub const MIN_SLEEP_SECS: u32 = 300;

/// Timeout for setup/display API calls
pub const API_TIMEOUT_MS: u32 = 45_000;
/// Timeout for image downloads and HEAD requests
pub const IMAGE_TIMEOUT_MS: u32 = 30_000;
/// Attempts per API call (transport failure or 5xx)
pub const MAX_ATTEMPTS: u32 = 3;
/// Backoff step between attempts, multiplied by the attempt index
pub const RETRY_STEP_MS: u32 = 1000;

/// Largest content-length that is allocated exactly
pub const MAX_IMAGE_SIZE: usize = 50_000;
/// Buffer size when content-length is unknown or too large (64 KiB)
pub const FALLBACK_BUFFER_SIZE: usize = 64 * 1024;
/// Free heap kept back for the TLS session and the decoder (32 KiB)
pub const HEAP_SAFETY_MARGIN: usize = 32 * 1024;
/// Widest PNG the scanline buffers accept
pub const SCANLINE_CAPACITY: usize = 1024;
/// Largest JSON body read from the setup/display endpoints
pub const MAX_API_BODY: usize = 4096;

/// Consecutive errors tolerated before the caller escalates
pub const ERROR_THRESHOLD: u32 = 5;
/// How long the error screen stays up before sleeping
pub const ERROR_HOLD_MS: u64 = 10_000;
/// Interval between connectivity checks while offline
pub const OFFLINE_RETRY_MS: u64 = 300_000;

pub const CACHE_ENABLED: bool = true;
pub const MAX_CACHED_IMAGES: usize = 10;

/// Battery thresholds in millivolts
pub const LOW_BATTERY_MV: u32 = 3200;
pub const CRITICAL_BATTERY_MV: u32 = 3000;

/// WiFi network credentials
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    pub fn new(ssid: &str, password: &str) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.ssid.is_empty()
    }
}

/// Runtime configuration resolved once at boot
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    /// Build-time WiFi credentials; always win over persisted ones
    pub wifi_override: Option<WifiCredentials>,
    /// Build-time access key; wins over the persisted one
    pub api_key_override: Option<String>,
    /// Build-time friendly id; wins over the persisted one
    pub friendly_id_override: Option<String>,
    pub display_width: u32,
    pub display_height: u32,
    pub api_timeout_ms: u32,
    pub image_timeout_ms: u32,
    pub max_image_size: usize,
    pub cache_enabled: bool,
    pub max_cached_images: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            wifi_override: None,
            api_key_override: None,
            friendly_id_override: None,
            display_width: DISPLAY_WIDTH,
            display_height: DISPLAY_HEIGHT,
            api_timeout_ms: API_TIMEOUT_MS,
            image_timeout_ms: IMAGE_TIMEOUT_MS,
            max_image_size: MAX_IMAGE_SIZE,
            cache_enabled: CACHE_ENABLED,
            max_cached_images: MAX_CACHED_IMAGES,
        }
    }
}

impl Config {
    /// Apply optional build-time values. Empty strings count as absent.
    pub fn with_overrides(
        mut self,
        base_url: Option<&str>,
        wifi: Option<(&str, &str)>,
        api_key: Option<&str>,
        friendly_id: Option<&str>,
    ) -> Self {
        if let Some(url) = base_url.filter(|u| !u.is_empty()) {
            self.base_url = url.trim_end_matches('/').into();
        }
        if let Some((ssid, password)) = wifi.filter(|(s, _)| !s.is_empty()) {
            self.wifi_override = Some(WifiCredentials::new(ssid, password));
        }
        self.api_key_override = api_key.filter(|k| !k.is_empty()).map(Into::into);
        self.friendly_id_override = friendly_id.filter(|f| !f.is_empty()).map(Into::into);
        self
    }

    /// Number of bytes in a raw 1bpp full-frame bitmap
    pub fn raw_frame_len(&self) -> usize {
        (self.display_width as usize * self.display_height as usize) / 8
    }

    pub fn endpoint(&self, path: &str) -> String {
        let mut url = String::with_capacity(self.base_url.len() + path.len());
        url.push_str(&self.base_url);
        url.push_str(path);
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_ignore_empty_values() {
        let config = Config::default().with_overrides(Some(""), Some(("", "pw")), Some(""), None);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert!(config.wifi_override.is_none());
        assert!(config.api_key_override.is_none());
    }

    #[test]
    fn test_overrides_applied() {
        let config = Config::default().with_overrides(
            Some("http://10.0.0.2:4567/"),
            Some(("home", "secret")),
            Some("key"),
            Some("ABC123"),
        );
        assert_eq!(config.endpoint(SETUP_ENDPOINT), "http://10.0.0.2:4567/api/setup");
        assert_eq!(config.wifi_override, Some(WifiCredentials::new("home", "secret")));
        assert_eq!(config.api_key_override.as_deref(), Some("key"));
        assert_eq!(config.friendly_id_override.as_deref(), Some("ABC123"));
    }

    #[test]
    fn test_raw_frame_len() {
        assert_eq!(Config::default().raw_frame_len(), 15_000);
    }
}
