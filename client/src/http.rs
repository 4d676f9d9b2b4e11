//! HTTP collaborator interface and retry policy
//!
//! The board crate provides an [`HttpTransport`] that speaks HTTP/1.1 over
//! TCP or TLS. Response bodies are pushed into a [`BodySink`] as they arrive,
//! so the receiver decides how much memory a response may take.

use alloc::vec::Vec;

use embedded_hal_async::delay::DelayNs;
use log::{info, warn};

use crate::config::{MAX_ATTEMPTS, RETRY_STEP_MS, WifiCredentials};
use crate::error::ClientError;

/// Transport-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No network link
    NotConnected,
    /// URL could not be parsed
    InvalidUrl,
    /// Hostname lookup failed
    Dns,
    /// TCP connect failed
    Connect,
    /// TLS handshake or record failure
    Tls,
    /// Failed to write request
    Write,
    /// Failed to read response
    Read,
    /// Malformed response head
    Parse,
    /// Request exceeded its timeout
    Timeout,
    /// Request or response head did not fit the buffers
    TooLarge,
}

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
        }
    }
}

/// Header name/value pair
pub type Header<'a> = (&'a str, &'a str);

/// A single outgoing request. Connections are never reused.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub method: Method,
    pub url: &'a str,
    pub headers: &'a [Header<'a>],
    pub body: Option<&'a [u8]>,
    pub timeout_ms: u32,
}

impl<'a> Request<'a> {
    pub fn get(url: &'a str, headers: &'a [Header<'a>], timeout_ms: u32) -> Self {
        Self {
            method: Method::Get,
            url,
            headers,
            body: None,
            timeout_ms,
        }
    }
}

/// Status line and framing information of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<usize>,
}

/// Receives a response body while it streams in
pub trait BodySink {
    /// Called once per attempt after the head is parsed. Returning `false`
    /// skips the body. Implementations reset any state from earlier attempts.
    fn begin(&mut self, head: &ResponseHead) -> bool;

    /// Consume a chunk. Returning `false` stops reading.
    fn write(&mut self, chunk: &[u8]) -> bool;
}

/// Network stack used by the client
#[allow(async_fn_in_trait)]
pub trait HttpTransport {
    /// True when a link with an address is up
    fn is_connected(&self) -> bool;

    /// Join the given network and wait for an address
    async fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), TransportError>;

    /// Perform one request, streaming the body into `sink`
    async fn send(
        &mut self,
        request: &Request<'_>,
        sink: &mut dyn BodySink,
    ) -> Result<ResponseHead, TransportError>;
}

/// Ignores the body
pub struct Discard;

impl BodySink for Discard {
    fn begin(&mut self, _head: &ResponseHead) -> bool {
        false
    }

    fn write(&mut self, _chunk: &[u8]) -> bool {
        false
    }
}

/// Collects a bounded body of a 200 response
pub struct BodyBuffer {
    data: Vec<u8>,
    limit: usize,
    overflow: bool,
}

impl BodyBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            overflow: false,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// True when the body was longer than the limit and got cut
    pub fn overflowed(&self) -> bool {
        self.overflow
    }
}

impl BodySink for BodyBuffer {
    fn begin(&mut self, head: &ResponseHead) -> bool {
        self.data.clear();
        self.overflow = false;
        head.status == 200
    }

    fn write(&mut self, chunk: &[u8]) -> bool {
        let room = self.limit - self.data.len();
        let take = chunk.len().min(room);
        if self.data.try_reserve(take).is_err() {
            self.overflow = true;
            return false;
        }
        self.data.extend_from_slice(&chunk[..take]);
        if take < chunk.len() {
            self.overflow = true;
            return false;
        }
        true
    }
}

/// Send `request` with up to [`MAX_ATTEMPTS`] attempts.
///
/// Transport failures and 5xx responses are retried after `attempt * 1s`.
/// Any other non-200 status ends the call at once.
pub async fn send_with_retry<T, D>(
    transport: &mut T,
    delay: &mut D,
    request: &Request<'_>,
    sink: &mut dyn BodySink,
) -> Result<ResponseHead, ClientError>
where
    T: HttpTransport,
    D: DelayNs,
{
    let mut last = ClientError::Transport(TransportError::NotConnected);

    for attempt in 1..=MAX_ATTEMPTS {
        info!(
            "{} {} (attempt {}/{})",
            request.method.as_str(),
            request.url,
            attempt,
            MAX_ATTEMPTS
        );

        match transport.send(request, sink).await {
            Ok(head) if head.status == 200 => return Ok(head),
            Ok(head) if head.status >= 500 => {
                warn!("server error {}", head.status);
                last = ClientError::Status(head.status);
            }
            Ok(head) => {
                warn!("request rejected with {}", head.status);
                return Err(ClientError::Status(head.status));
            }
            Err(e) => {
                warn!("transport error: {:?}", e);
                last = ClientError::Transport(e);
            }
        }

        if attempt < MAX_ATTEMPTS {
            let backoff = attempt * RETRY_STEP_MS;
            info!("retrying in {} ms", backoff);
            delay.delay_ms(backoff).await;
        }
    }

    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, RecordingDelay, Reply};
    use embassy_futures::block_on;

    const URL: &str = "https://usetrmnl.com/api/display";

    #[test]
    fn test_retries_exhausted_on_503() {
        let mut transport = FakeTransport::connected();
        for _ in 0..3 {
            transport.push(Reply::status(503));
        }
        let mut delay = RecordingDelay::default();
        let mut body = BodyBuffer::new(64);

        let result = block_on(send_with_retry(
            &mut transport,
            &mut delay,
            &Request::get(URL, &[], 1000),
            &mut body,
        ));

        assert!(matches!(result, Err(ClientError::Status(503))));
        assert_eq!(transport.requests.len(), 3);
        assert_eq!(delay.delays_ms, [1000, 2000]);
    }

    #[test]
    fn test_no_retry_after_404() {
        let mut transport = FakeTransport::connected();
        transport.push(Reply::status(503));
        transport.push(Reply::status(404));
        transport.push(Reply::json(r#"{}"#));
        let mut delay = RecordingDelay::default();

        let result = block_on(send_with_retry(
            &mut transport,
            &mut delay,
            &Request::get(URL, &[], 1000),
            &mut Discard,
        ));

        assert!(matches!(result, Err(ClientError::Status(404))));
        assert_eq!(transport.requests.len(), 2);
        assert_eq!(delay.delays_ms, [1000]);
    }

    #[test]
    fn test_transport_error_then_success() {
        let mut transport = FakeTransport::connected();
        transport.push(Reply::error(TransportError::Timeout));
        transport.push(Reply::json(r#"{"status":200}"#));
        let mut delay = RecordingDelay::default();
        let mut body = BodyBuffer::new(64);

        let head = block_on(send_with_retry(
            &mut transport,
            &mut delay,
            &Request::get(URL, &[], 1000),
            &mut body,
        ))
        .unwrap();

        assert_eq!(head.status, 200);
        assert_eq!(body.as_slice(), br#"{"status":200}"#);
    }

    #[test]
    fn test_body_buffer_limit() {
        let mut body = BodyBuffer::new(4);
        assert!(body.begin(&ResponseHead {
            status: 200,
            content_length: None
        }));
        assert!(body.write(b"ab"));
        assert!(!body.write(b"cdef"));
        assert_eq!(body.as_slice(), b"abcd");
        assert!(body.overflowed());
    }
}
