//! Minimal HTTP/1.1 exchange for no_std environments
//!
//! One request per connection. The request head and optional body are
//! written, the response head is parsed, and the body is streamed into a
//! [`BodySink`] as it arrives. Works over anything that implements the async
//! `Read + Write` traits, so plain TCP and TLS share the same code.

use core::fmt::Write as FmtWrite;
use core::str;

use embedded_io_async::{Read, Write};
use heapless::String;
use log::{debug, info, warn};
use paperdink_client::http::{BodySink, Method, Request, ResponseHead, TransportError};

/// Largest request head we build
const REQUEST_HEAD_MAX: usize = 1024;

/// URL scheme
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scheme {
    Http,
    Https,
}

/// Parsed URL components
#[derive(Debug)]
pub struct Url<'a> {
    pub scheme: Scheme,
    pub host: &'a str,
    pub port: u16,
    pub path: &'a str,
}

impl<'a> Url<'a> {
    /// Parse `http://host[:port][/path]` or `https://...`
    pub fn parse(url: &'a str) -> Result<Self, TransportError> {
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            return Err(TransportError::InvalidUrl);
        };

        let default_port = match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        };

        let (host_port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = match host_port.find(':') {
            Some(idx) => {
                let port = host_port[idx + 1..]
                    .parse()
                    .map_err(|_| TransportError::InvalidUrl)?;
                (&host_port[..idx], port)
            }
            None => (host_port, default_port),
        };

        if host.is_empty() {
            return Err(TransportError::InvalidUrl);
        }

        Ok(Url {
            scheme,
            host,
            port,
            path,
        })
    }
}

/// Build the request head: request line, `Host`, caller headers and the
/// body length when there is a body.
pub fn write_head(
    request: &Request<'_>,
    url: &Url<'_>,
) -> Result<String<REQUEST_HEAD_MAX>, TransportError> {
    let mut head: String<REQUEST_HEAD_MAX> = String::new();
    let overflow = |_| TransportError::TooLarge;

    write!(head, "{} {} HTTP/1.1\r\n", request.method.as_str(), url.path).map_err(overflow)?;
    match (url.scheme, url.port) {
        (Scheme::Http, 80) | (Scheme::Https, 443) => {
            write!(head, "Host: {}\r\n", url.host).map_err(overflow)?
        }
        _ => write!(head, "Host: {}:{}\r\n", url.host, url.port).map_err(overflow)?,
    }
    for (name, value) in request.headers {
        write!(head, "{}: {}\r\n", name, value).map_err(overflow)?;
    }
    if !request
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("connection"))
    {
        head.push_str("Connection: close\r\n").map_err(|_| TransportError::TooLarge)?;
    }
    if let Some(body) = request.body {
        write!(head, "Content-Length: {}\r\n", body.len()).map_err(overflow)?;
    }
    head.push_str("\r\n").map_err(|_| TransportError::TooLarge)?;
    Ok(head)
}

/// Send `request` over `conn` and stream the response body into `sink`.
///
/// `rx_buf` must hold the whole response head.
pub async fn exchange<C>(
    conn: &mut C,
    url: &Url<'_>,
    request: &Request<'_>,
    rx_buf: &mut [u8],
    sink: &mut dyn BodySink,
) -> Result<ResponseHead, TransportError>
where
    C: Read + Write,
{
    let head = write_head(request, url)?;
    debug!("http: {} {}{}", request.method.as_str(), url.host, url.path);

    conn.write_all(head.as_bytes())
        .await
        .map_err(|_| TransportError::Write)?;
    if let Some(body) = request.body {
        conn.write_all(body).await.map_err(|_| TransportError::Write)?;
    }
    conn.flush().await.map_err(|_| TransportError::Write)?;

    let mut total_read = 0;
    let headers_end = loop {
        if total_read >= rx_buf.len() {
            return Err(TransportError::TooLarge);
        }

        let n = conn
            .read(&mut rx_buf[total_read..])
            .await
            .map_err(|_| TransportError::Read)?;
        if n == 0 {
            return Err(TransportError::Read);
        }
        total_read += n;

        if let Some(pos) = find_header_end(&rx_buf[..total_read]) {
            break pos;
        }
    };

    let header_str = str::from_utf8(&rx_buf[..headers_end]).map_err(|_| TransportError::Parse)?;
    let status = parse_status(header_str)?;
    let chunked = parse_header(header_str, "transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    let content_length = if chunked {
        None
    } else {
        parse_header(header_str, "content-length").and_then(|v| v.parse().ok())
    };
    let response = ResponseHead {
        status,
        content_length,
    };
    info!(
        "http: {} ({:?} bytes{})",
        status,
        content_length,
        if chunked { ", chunked" } else { "" }
    );

    if request.method == Method::Head || !sink.begin(&response) {
        return Ok(response);
    }

    let body_start = headers_end + 4;
    let mut body = BodyReader::new(content_length, chunked);

    if total_read > body_start {
        // Copy the leftover out so rx_buf can be reused for reads.
        let leftover = total_read - body_start;
        rx_buf.copy_within(body_start..total_read, 0);
        if !body.feed(&rx_buf[..leftover], sink)? {
            return Ok(response);
        }
    }

    while !body.is_complete() {
        let n = match conn.read(rx_buf).await {
            Ok(n) => n,
            Err(_) if content_length.is_none() && !chunked => {
                // Read-to-close body; some peers reset instead of closing.
                warn!("http: read error after {} body bytes", body.received);
                break;
            }
            Err(_) => return Err(TransportError::Read),
        };
        if n == 0 {
            break;
        }
        if !body.feed(&rx_buf[..n], sink)? {
            break;
        }
    }

    debug!("http: {} body bytes", body.received);
    Ok(response)
}

/// Tracks framing of a response body
struct BodyReader {
    content_length: Option<usize>,
    chunked: Option<Chunked>,
    received: usize,
}

impl BodyReader {
    fn new(content_length: Option<usize>, chunked: bool) -> Self {
        Self {
            content_length,
            chunked: chunked.then(Chunked::new),
            received: 0,
        }
    }

    fn is_complete(&self) -> bool {
        match (&self.chunked, self.content_length) {
            (Some(chunked), _) => chunked.is_done(),
            (None, Some(len)) => self.received >= len,
            (None, None) => false,
        }
    }

    /// Returns false once no more body is wanted
    fn feed(&mut self, data: &[u8], sink: &mut dyn BodySink) -> Result<bool, TransportError> {
        if let Some(chunked) = self.chunked.as_mut() {
            let received = &mut self.received;
            return chunked.feed(data, |chunk| {
                *received += chunk.len();
                sink.write(chunk)
            });
        }

        let data = match self.content_length {
            Some(len) => &data[..data.len().min(len.saturating_sub(self.received))],
            None => data,
        };
        self.received += data.len();
        Ok(sink.write(data) && !self.is_complete())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    Done,
}

/// Incremental `Transfer-Encoding: chunked` decoder
#[derive(Debug)]
pub struct Chunked {
    state: ChunkState,
    remaining: usize,
}

impl Chunked {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            remaining: 0,
        }
    }

    /// The terminating zero-size chunk has been seen
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Decode `input`, passing payload bytes to `emit`.
    ///
    /// Returns false when the body is finished or `emit` asked to stop.
    pub fn feed<F>(&mut self, mut input: &[u8], mut emit: F) -> Result<bool, TransportError>
    where
        F: FnMut(&[u8]) -> bool,
    {
        while let Some(&byte) = input.first() {
            match self.state {
                ChunkState::Size => {
                    input = &input[1..];
                    match (byte as char).to_digit(16) {
                        Some(digit) => {
                            self.remaining = self
                                .remaining
                                .checked_mul(16)
                                .and_then(|r| r.checked_add(digit as usize))
                                .ok_or(TransportError::Parse)?;
                        }
                        None => match byte {
                            b';' | b' ' => self.state = ChunkState::Extension,
                            b'\r' => self.state = ChunkState::SizeLf,
                            b'\n' => self.end_size(),
                            _ => return Err(TransportError::Parse),
                        },
                    }
                }
                ChunkState::Extension => {
                    input = &input[1..];
                    if byte == b'\n' {
                        self.end_size();
                    }
                }
                ChunkState::SizeLf => {
                    input = &input[1..];
                    if byte != b'\n' {
                        return Err(TransportError::Parse);
                    }
                    self.end_size();
                }
                ChunkState::Data => {
                    let take = self.remaining.min(input.len());
                    let keep_going = emit(&input[..take]);
                    input = &input[take..];
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.state = ChunkState::DataCr;
                    }
                    if !keep_going {
                        return Ok(false);
                    }
                }
                ChunkState::DataCr => {
                    input = &input[1..];
                    self.state = match byte {
                        b'\r' => ChunkState::DataLf,
                        b'\n' => ChunkState::Size,
                        _ => return Err(TransportError::Parse),
                    };
                }
                ChunkState::DataLf => {
                    input = &input[1..];
                    if byte != b'\n' {
                        return Err(TransportError::Parse);
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Done => return Ok(false),
            }
        }
        Ok(!self.is_done())
    }

    fn end_size(&mut self) {
        // Trailers after the last chunk are ignored.
        self.state = if self.remaining == 0 {
            ChunkState::Done
        } else {
            ChunkState::Data
        };
    }
}

impl Default for Chunked {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the position of \r\n\r\n in the buffer
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse HTTP status code from status line
pub fn parse_status(headers: &str) -> Result<u16, TransportError> {
    // HTTP/1.1 200 OK
    let line = headers.lines().next().ok_or(TransportError::Parse)?;
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().ok_or(TransportError::Parse)?;
    if !version.starts_with("HTTP/") {
        return Err(TransportError::Parse);
    }
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or(TransportError::Parse)
}

/// Parse a header value (case-insensitive)
pub fn parse_header<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    headers
        .lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

/// Parse a dotted-quad host without DNS
pub fn parse_ipv4(host: &str) -> Option<core::net::Ipv4Addr> {
    host.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_default_ports() {
        let url = Url::parse("https://usetrmnl.com/api/display").unwrap();
        assert_eq!(url.scheme, Scheme::Https);
        assert_eq!(url.host, "usetrmnl.com");
        assert_eq!(url.port, 443);
        assert_eq!(url.path, "/api/display");

        let url = Url::parse("http://10.0.0.2:4567").unwrap();
        assert_eq!(url.port, 4567);
        assert_eq!(url.path, "/");
        assert!(Url::parse("ftp://host/").is_err());
        assert!(Url::parse("http://:80/").is_err());
    }

    #[test]
    fn test_head_includes_length_and_close() {
        let url = Url::parse("http://10.0.0.2:4567/api/logs").unwrap();
        let request = Request {
            method: Method::Post,
            url: "http://10.0.0.2:4567/api/logs",
            headers: &[("Content-Type", "application/json")],
            body: Some(b"{}"),
            timeout_ms: 1000,
        };
        let head = write_head(&request, &url).unwrap();
        assert_eq!(
            head.as_str(),
            "POST /api/logs HTTP/1.1\r\nHost: 10.0.0.2:4567\r\n\
             Content-Type: application/json\r\nConnection: close\r\n\
             Content-Length: 2\r\n\r\n"
        );
    }

    #[test]
    fn test_status_and_headers() {
        let head = "HTTP/1.1 404 Not Found\r\nContent-Length: 12\r\nX-A: b";
        assert_eq!(parse_status(head), Ok(404));
        assert_eq!(parse_header(head, "content-length"), Some("12"));
        assert_eq!(parse_header(head, "missing"), None);
        assert!(parse_status("garbage").is_err());
        assert_eq!(find_header_end(b"a\r\n\r\nbody"), Some(1));
    }

    #[test]
    fn test_chunked_split_across_reads() {
        let mut decoder = Chunked::new();
        let mut out = heapless::Vec::<u8, 32>::new();
        let mut push = |c: &[u8]| out.extend_from_slice(c).is_ok();
        assert_eq!(decoder.feed(b"4\r\nWi", &mut push), Ok(true));
        assert_eq!(decoder.feed(b"ki\r\n5;ext\r\npedia\r\n", &mut push), Ok(true));
        assert_eq!(decoder.feed(b"0\r\n\r\n", &mut push), Ok(false));
        assert!(decoder.is_done());
        assert_eq!(out.as_slice(), b"Wikipedia");
    }

    #[test]
    fn test_chunked_rejects_bad_size() {
        let mut decoder = Chunked::new();
        assert_eq!(decoder.feed(b"zz\r\n", |_| true), Err(TransportError::Parse));
    }
}
