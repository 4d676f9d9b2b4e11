//! TRMNL API payloads
//!
//! Setup responses come from several server generations, so key lookup falls
//! back from top-level snake_case to camelCase, then to a nested `device`
//! object, then to a nested `data` object. The first non-empty value wins.
//!
//! Each field is read on its own: a value of the wrong JSON type counts as
//! absent instead of rejecting the whole response. Numbers may arrive as
//! integers, floats or numeric strings.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Write as FmtWrite;

use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::{Config, DEVICE_TYPE, FIRMWARE_VERSION, PRODUCT_NAME, SETUP_ENDPOINT};
use crate::identity::DeviceId;

/// Payload decoding failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    /// Body is JSON but does not match the expected shape
    Json,
    /// Body was cut at the read limit
    Truncated,
    /// Serializing a request body failed
    Encode,
}

/// Identity fields as they appear in any one object
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IdentityFields {
    #[serde(deserialize_with = "lenient_string")]
    api_key: Option<String>,
    #[serde(rename = "apiKey", deserialize_with = "lenient_string")]
    api_key_camel: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    friendly_id: Option<String>,
    #[serde(rename = "friendlyId", deserialize_with = "lenient_string")]
    friendly_id_camel: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SetupPayload {
    #[serde(deserialize_with = "lenient_int")]
    status: Option<i64>,
    #[serde(deserialize_with = "lenient_bool")]
    success: Option<bool>,
    #[serde(deserialize_with = "lenient_bool")]
    ok: Option<bool>,
    #[serde(deserialize_with = "lenient_string")]
    api_key: Option<String>,
    #[serde(rename = "apiKey", deserialize_with = "lenient_string")]
    api_key_camel: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    friendly_id: Option<String>,
    #[serde(rename = "friendlyId", deserialize_with = "lenient_string")]
    friendly_id_camel: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    image_url: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    filename: Option<String>,
    #[serde(deserialize_with = "lenient_object")]
    device: Option<IdentityFields>,
    #[serde(deserialize_with = "lenient_object")]
    data: Option<IdentityFields>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DisplayPayload {
    #[serde(deserialize_with = "lenient_int")]
    status: Option<i64>,
    #[serde(deserialize_with = "lenient_string")]
    image_url: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    url: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    image: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    filename: Option<String>,
    #[serde(deserialize_with = "lenient_bool")]
    update_firmware: Option<bool>,
    #[serde(deserialize_with = "lenient_string")]
    firmware_url: Option<String>,
    #[serde(deserialize_with = "lenient_int")]
    refresh_rate: Option<i64>,
    #[serde(deserialize_with = "lenient_bool")]
    reset_firmware: Option<bool>,
    #[serde(deserialize_with = "lenient_string")]
    error: Option<String>,
}

fn int_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
        }
        _ => None,
    }
}

fn bool_from_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(int_from_value(&Value::deserialize(deserializer)?))
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    Ok(bool_from_value(&Value::deserialize(deserializer)?))
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn lenient_object<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<IdentityFields>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => IdentityFields::deserialize(value).ok(),
        _ => None,
    })
}

#[derive(Serialize)]
struct LogsPayload<'a> {
    mac: &'a str,
    logs: &'a str,
    timestamp: u64,
}

/// Parsed setup (registration) response
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SetupResponse {
    pub status: i32,
    pub api_key: String,
    pub friendly_id: String,
    pub image_url: String,
    pub filename: String,
    pub success: bool,
}

impl SetupResponse {
    /// Both credentials present
    pub fn has_identity(&self) -> bool {
        !self.api_key.is_empty() && !self.friendly_id.is_empty()
    }
}

/// What the display endpoint asked the device to do next
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ContentDescriptor {
    pub status: i32,
    pub image_url: String,
    pub filename: String,
    /// Server override of the refresh interval
    pub refresh_rate_secs: Option<u32>,
    pub update_firmware: bool,
    pub firmware_url: String,
    pub reset_firmware: bool,
    pub error: String,
}

impl ContentDescriptor {
    /// Descriptor for a display endpoint that answered with the image itself
    pub fn direct(url: &str) -> Self {
        Self {
            status: 200,
            image_url: url.into(),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.status == 200 || (!self.image_url.is_empty() && self.error.is_empty())
    }
}

fn first_non_empty<const N: usize>(candidates: [Option<String>; N]) -> String {
    candidates
        .into_iter()
        .flatten()
        .find(|value| !value.is_empty())
        .unwrap_or_default()
}

fn decode<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, ApiError> {
    serde_json::from_slice::<T>(body).map_err(|_| ApiError::Json)
}

/// True when the body starts like a JSON document
pub fn looks_like_json(body: &[u8]) -> bool {
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{' || *b == b'[')
}

/// Parse a setup response body
pub fn parse_setup(body: &[u8]) -> Result<SetupResponse, ApiError> {
    let payload: SetupPayload = decode(body)?;
    let device = payload.device.unwrap_or_default();
    let data = payload.data.unwrap_or_default();

    let api_key = first_non_empty([
        payload.api_key,
        payload.api_key_camel,
        device.api_key,
        device.api_key_camel,
        data.api_key,
        data.api_key_camel,
    ]);
    let friendly_id = first_non_empty([
        payload.friendly_id,
        payload.friendly_id_camel,
        device.friendly_id,
        device.friendly_id_camel,
        data.friendly_id,
        data.friendly_id_camel,
    ]);

    let ok_flag = payload.success.unwrap_or(false) || payload.ok.unwrap_or(false);
    let status = payload
        .status
        .map(clamp_status)
        .unwrap_or(if ok_flag { 200 } else { 0 });
    let success = status == 200 || (!api_key.is_empty() && !friendly_id.is_empty());

    Ok(SetupResponse {
        status,
        api_key,
        friendly_id,
        image_url: payload.image_url.unwrap_or_default(),
        filename: payload.filename.unwrap_or_default(),
        success,
    })
}

fn clamp_status(status: i64) -> i32 {
    status.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Parse a display response body.
///
/// A body that does not decode as JSON means the endpoint served the image
/// directly, so the endpoint URL becomes the image URL.
pub fn parse_display(body: &[u8], endpoint_url: &str) -> Result<ContentDescriptor, ApiError> {
    if !looks_like_json(body) {
        return Ok(ContentDescriptor::direct(endpoint_url));
    }

    let payload: DisplayPayload = match decode(body) {
        Ok(payload) => payload,
        Err(_) => {
            warn!("api: display body is not valid JSON, using endpoint as image");
            return Ok(ContentDescriptor::direct(endpoint_url));
        }
    };
    let image_url = first_non_empty([payload.image_url, payload.url, payload.image]);

    Ok(ContentDescriptor {
        status: payload.status.map(clamp_status).unwrap_or(200),
        image_url,
        filename: payload.filename.unwrap_or_default(),
        refresh_rate_secs: payload
            .refresh_rate
            .filter(|rate| *rate > 0)
            .map(|rate| rate.min(u32::MAX as i64) as u32),
        update_firmware: payload.update_firmware.unwrap_or(false),
        firmware_url: payload.firmware_url.unwrap_or_default(),
        reset_firmware: payload.reset_firmware.unwrap_or(false),
        error: payload.error.unwrap_or_default(),
    })
}

/// `User-Agent` value
pub fn user_agent() -> heapless::String<48> {
    let mut ua = heapless::String::new();
    let _ = write!(ua, "{}/{}", PRODUCT_NAME, FIRMWARE_VERSION);
    ua
}

/// Setup endpoint with identity query parameters
pub fn setup_url(config: &Config, device: &DeviceId) -> String {
    let mut url = config.endpoint(SETUP_ENDPOINT);
    let _ = write!(
        url,
        "?mac={}&firmware_version={}&device_type={}",
        device.as_str(),
        FIRMWARE_VERSION,
        DEVICE_TYPE
    );
    url
}

/// JSON body of a logs upload
pub fn logs_body(device: &DeviceId, logs: &str, timestamp: u64) -> Result<Vec<u8>, ApiError> {
    let payload = LogsPayload {
        mac: device.as_str(),
        logs,
        timestamp,
    };
    // Worst case every byte becomes a \u00XX escape.
    let mut buf = vec![0u8; logs.len() * 6 + 96];
    let len = serde_json_core::to_slice(&payload, &mut buf).map_err(|_| ApiError::Encode)?;
    buf.truncate(len);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_top_level_snake_case() {
        let body = br#"{"status":200,"api_key":"k1","friendly_id":"F1","image_url":"https://x/i.png"}"#;
        let setup = parse_setup(body).unwrap();
        assert_eq!(setup.api_key, "k1");
        assert_eq!(setup.friendly_id, "F1");
        assert_eq!(setup.image_url, "https://x/i.png");
        assert!(setup.success);
    }

    #[test]
    fn test_setup_nested_data_camel_case() {
        let body = br#"{"success":true,"data":{"apiKey":"nested","friendlyId":"NEST"}}"#;
        let setup = parse_setup(body).unwrap();
        assert_eq!(setup.api_key, "nested");
        assert_eq!(setup.friendly_id, "NEST");
        assert_eq!(setup.status, 200);
    }

    #[test]
    fn test_setup_device_object_before_data() {
        let body = br#"{"device":{"api_key":"dev"},"data":{"api_key":"dat","friendly_id":"D"}}"#;
        let setup = parse_setup(body).unwrap();
        assert_eq!(setup.api_key, "dev");
        assert_eq!(setup.friendly_id, "D");
        assert!(setup.success);
    }

    #[test]
    fn test_setup_missing_key_everywhere() {
        let body = br#"{"status":404,"message":"unknown device"}"#;
        let setup = parse_setup(body).unwrap();
        assert_eq!(setup.api_key, "");
        assert!(!setup.success);
        assert!(!setup.has_identity());
    }

    #[test]
    fn test_setup_status_without_identity_still_success() {
        let setup = parse_setup(br#"{"status":200}"#).unwrap();
        assert!(setup.success);
        assert!(!setup.has_identity());
    }

    #[test]
    fn test_display_url_fallbacks() {
        let body = br#"{"url":"https://cdn/a.png","filename":"a.png","refresh_rate":900}"#;
        let content = parse_display(body, "https://usetrmnl.com/api/display").unwrap();
        assert_eq!(content.image_url, "https://cdn/a.png");
        assert_eq!(content.status, 200);
        assert_eq!(content.refresh_rate_secs, Some(900));
        assert!(content.success());
    }

    #[test]
    fn test_display_flags() {
        let body = br#"{"status":0,"image":"https://cdn/b.bmp","reset_firmware":true,"update_firmware":true,"firmware_url":"https://fw/bin","error":null}"#;
        let content = parse_display(body, "").unwrap();
        assert!(content.reset_firmware);
        assert!(content.update_firmware);
        assert_eq!(content.firmware_url, "https://fw/bin");
        assert!(content.success());
    }

    #[test]
    fn test_display_error_text_fails() {
        let body = br#"{"status":500,"image_url":"https://cdn/c.png","error":"render failed"}"#;
        let content = parse_display(body, "").unwrap();
        assert!(!content.success());
    }

    #[test]
    fn test_display_non_json_is_direct_image() {
        let body = b"\x89PNG\r\n\x1a\n....";
        let content = parse_display(body, "https://usetrmnl.com/api/display").unwrap();
        assert_eq!(content.image_url, "https://usetrmnl.com/api/display");
        assert!(content.filename.is_empty());
        assert!(content.success());
    }

    #[test]
    fn test_display_malformed_json_is_direct_image() {
        let content = parse_display(br#"{"image_url": "#, "https://usetrmnl.com/api/display").unwrap();
        assert_eq!(content, ContentDescriptor::direct("https://usetrmnl.com/api/display"));
        assert!(content.success());
    }

    #[test]
    fn test_display_refresh_rate_as_string_or_float() {
        for body in [
            &br#"{"image_url":"https://cdn/a.png","refresh_rate":"900"}"#[..],
            &br#"{"image_url":"https://cdn/a.png","refresh_rate":900.0}"#[..],
        ] {
            let content = parse_display(body, "").unwrap();
            assert_eq!(content.refresh_rate_secs, Some(900));
            assert_eq!(content.image_url, "https://cdn/a.png");
        }
    }

    #[test]
    fn test_display_mistyped_fields_fall_back_individually() {
        let body = br#"{"status":"200","image_url":"https://cdn/d.png","filename":7,"refresh_rate":"soon","reset_firmware":"true","update_firmware":1,"error":false}"#;
        let content = parse_display(body, "").unwrap();
        assert_eq!(content.status, 200);
        assert_eq!(content.image_url, "https://cdn/d.png");
        assert!(content.filename.is_empty());
        assert_eq!(content.refresh_rate_secs, None);
        assert!(content.reset_firmware);
        assert!(content.update_firmware);
        assert!(content.error.is_empty());
        assert!(content.success());
    }

    #[test]
    fn test_setup_string_status_still_registers() {
        let setup = parse_setup(br#"{"status":"ok","api_key":"k","friendly_id":"F"}"#).unwrap();
        assert_eq!(setup.api_key, "k");
        assert_eq!(setup.friendly_id, "F");
        assert!(setup.success);
        assert!(setup.has_identity());
    }

    #[test]
    fn test_setup_non_object_device_is_skipped() {
        let body = br#"{"success":"true","device":"paperdink","data":{"api_key":"k2","friendly_id":"F2"}}"#;
        let setup = parse_setup(body).unwrap();
        assert_eq!(setup.status, 200);
        assert_eq!(setup.api_key, "k2");
    }

    #[test]
    fn test_setup_malformed_json_is_error() {
        assert_eq!(parse_setup(br#"{"api_key": "#), Err(ApiError::Json));
    }

    #[test]
    fn test_setup_url_query() {
        let device = DeviceId::from_mac([1, 2, 3, 4, 5, 6]);
        let url = setup_url(&Config::default(), &device);
        assert_eq!(
            url,
            "https://usetrmnl.com/api/setup?mac=01:02:03:04:05:06&firmware_version=1.0.0-paperdink&device_type=paperdink"
        );
    }

    #[test]
    fn test_logs_body() {
        let device = DeviceId::from_mac([1, 2, 3, 4, 5, 6]);
        let body = logs_body(&device, "boot \"ok\"", 42).unwrap();
        assert_eq!(
            core::str::from_utf8(&body).unwrap(),
            r#"{"mac":"01:02:03:04:05:06","logs":"boot \"ok\"","timestamp":42}"#
        );
    }
}
