//! Error surface of the client state machine

use core::fmt;

use crate::api::ApiError;
use crate::cache::CacheError;
use crate::http::TransportError;
use crate::image::AcquireError;

/// Why a client operation failed
#[derive(Debug)]
pub enum ClientError {
    /// No network link when one was required
    NotConnected,
    /// No WiFi credentials are stored or configured
    NoCredentials,
    /// Joining the WiFi network failed
    WifiConnect(TransportError),
    /// All attempts failed at the transport level
    Transport(TransportError),
    /// Server answered with a non-success status
    Status(u16),
    /// Response body could not be understood
    Api(ApiError),
    /// Operation needs an access key
    NotRegistered,
    /// Setup exchange completed but did not yield an access key and friendly id
    RegistrationRejected,
    /// Display response reported failure with this status
    ContentRejected(i32),
    /// Display response named no image
    NoImageUrl,
    /// Image buffer sizing or transfer failed
    Acquire(AcquireError),
    /// Cache store failure
    Cache(CacheError),
    /// Nothing cached to fall back to
    NoCachedContent,
    /// Render sink reported a hardware failure
    Render,
    /// Capability exists but is intentionally not implemented
    Unsupported,
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        ClientError::Transport(e)
    }
}

impl From<ApiError> for ClientError {
    fn from(e: ApiError) -> Self {
        ClientError::Api(e)
    }
}

impl From<AcquireError> for ClientError {
    fn from(e: AcquireError) -> Self {
        ClientError::Acquire(e)
    }
}

impl From<CacheError> for ClientError {
    fn from(e: CacheError) -> Self {
        ClientError::Cache(e)
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NotConnected => f.write_str("WiFi not connected"),
            ClientError::NoCredentials => f.write_str("No WiFi credentials"),
            ClientError::WifiConnect(_) => f.write_str("WiFi connection failed"),
            ClientError::Transport(e) => write!(f, "Network error ({:?})", e),
            ClientError::Status(code) => write!(f, "HTTP {}", code),
            ClientError::Api(_) => f.write_str("Bad server response"),
            ClientError::NotRegistered => f.write_str("Device not registered"),
            ClientError::RegistrationRejected => f.write_str("Device registration failed"),
            ClientError::ContentRejected(status) => write!(f, "Server error {}", status),
            ClientError::NoImageUrl => f.write_str("No image URL"),
            ClientError::Acquire(e) => write!(f, "Image download failed ({:?})", e),
            ClientError::Cache(_) => f.write_str("Cache error"),
            ClientError::NoCachedContent => f.write_str("No cached content"),
            ClientError::Render => f.write_str("Display error"),
            ClientError::Unsupported => f.write_str("Not supported"),
        }
    }
}
