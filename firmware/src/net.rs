//! WiFi station and the HTTP transport built on it
//!
//! [`WifiTransport`] joins the configured network, resolves hosts through the
//! embassy-net DNS socket and performs one request per TCP connection, with
//! TLS for `https` URLs.

use alloc::boxed::Box;

use embassy_net::Stack;
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_time::{Duration, Timer, with_timeout};
use esp_hal::rng::Rng;
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController};
use log::{debug, info, warn};
use paperdink_client::config::WifiCredentials;
use paperdink_client::http::{BodySink, HttpTransport, Request, ResponseHead, TransportError};

use crate::http::{self, Scheme, Url};
use crate::https::{self, TLS_READ_BUF_SIZE, TLS_WRITE_BUF_SIZE, TlsBuffers};

/// Time allowed to associate and obtain an address
const WIFI_CONNECT_TIMEOUT_MS: u64 = 30_000;
/// Association attempts within one connect call
const WIFI_MAX_RETRIES: u32 = 5;

const TCP_RX_SIZE: usize = 4096;
const TCP_TX_SIZE: usize = 4096;
/// Holds the full response head
const HTTP_RX_SIZE: usize = 2048;

/// Heap-allocated socket and TLS buffers, reused by every request
struct Buffers {
    tcp_rx: Box<[u8; TCP_RX_SIZE]>,
    tcp_tx: Box<[u8; TCP_TX_SIZE]>,
    http_rx: Box<[u8; HTTP_RX_SIZE]>,
    tls_read: Box<[u8; TLS_READ_BUF_SIZE]>,
    tls_write: Box<[u8; TLS_WRITE_BUF_SIZE]>,
}

impl Buffers {
    fn new() -> Self {
        Self {
            tcp_rx: Box::new([0; TCP_RX_SIZE]),
            tcp_tx: Box::new([0; TCP_TX_SIZE]),
            http_rx: Box::new([0; HTTP_RX_SIZE]),
            tls_read: Box::new([0; TLS_READ_BUF_SIZE]),
            tls_write: Box::new([0; TLS_WRITE_BUF_SIZE]),
        }
    }
}

/// [`HttpTransport`] over the esp-radio station interface
pub struct WifiTransport {
    stack: Stack<'static>,
    controller: WifiController<'static>,
    rng: Rng,
    buffers: Buffers,
}

impl WifiTransport {
    pub fn new(stack: Stack<'static>, controller: WifiController<'static>, rng: Rng) -> Self {
        Self {
            stack,
            controller,
            rng,
            buffers: Buffers::new(),
        }
    }

    /// Disconnect and stop the radio before deep sleep
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.controller.disconnect_async().await {
            debug!("wifi: disconnect: {:?}", e);
        }
        if let Err(e) = self.controller.stop_async().await {
            warn!("wifi: stop failed: {:?}", e);
        }
        info!("wifi: stopped");
    }

    async fn associate(&mut self, credentials: &WifiCredentials) -> Result<(), TransportError> {
        let client_config = ModeConfig::Client(
            ClientConfig::default()
                .with_ssid(credentials.ssid.clone())
                .with_password(credentials.password.clone()),
        );
        self.controller.set_config(&client_config).map_err(|e| {
            warn!("wifi: config rejected: {:?}", e);
            TransportError::Connect
        })?;

        if !matches!(self.controller.is_started(), Ok(true)) {
            info!("wifi: starting");
            self.controller.start_async().await.map_err(|e| {
                warn!("wifi: start failed: {:?}", e);
                TransportError::Connect
            })?;
        }

        for attempt in 1..=WIFI_MAX_RETRIES {
            info!(
                "wifi: connecting to {} (attempt {}/{})",
                credentials.ssid, attempt, WIFI_MAX_RETRIES
            );
            match self.controller.connect_async().await {
                Ok(()) => {
                    wait_for_ip(self.stack).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!("wifi: connect failed: {:?}", e);
                    Timer::after(Duration::from_secs(2)).await;
                }
            }
        }
        Err(TransportError::Connect)
    }

    async fn perform(
        &mut self,
        request: &Request<'_>,
        sink: &mut dyn BodySink,
    ) -> Result<ResponseHead, TransportError> {
        let url = Url::parse(request.url)?;
        let ip = resolve_host(self.stack, url.host).await?;

        let Buffers {
            tcp_rx,
            tcp_tx,
            http_rx,
            tls_read,
            tls_write,
        } = &mut self.buffers;

        let mut socket = TcpSocket::new(self.stack, &mut tcp_rx[..], &mut tcp_tx[..]);
        socket.set_timeout(Some(Duration::from_millis(request.timeout_ms as u64)));
        socket.connect((ip, url.port)).await.map_err(|e| {
            warn!("net: connect to {}:{} failed: {:?}", url.host, url.port, e);
            TransportError::Connect
        })?;

        match url.scheme {
            Scheme::Http => {
                let result = http::exchange(&mut socket, &url, request, &mut http_rx[..], sink).await;
                socket.close();
                result
            }
            Scheme::Https => {
                let seed = (self.rng.random() as u64) << 32 | self.rng.random() as u64;
                let tls = TlsBuffers {
                    read: &mut tls_read[..],
                    write: &mut tls_write[..],
                };
                https::exchange(socket, &url, request, &mut http_rx[..], tls, seed, sink).await
            }
        }
    }
}

impl HttpTransport for WifiTransport {
    fn is_connected(&self) -> bool {
        self.stack.is_link_up() && self.stack.config_v4().is_some()
    }

    async fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), TransportError> {
        if !credentials.is_valid() {
            return Err(TransportError::NotConnected);
        }
        let timeout = Duration::from_millis(WIFI_CONNECT_TIMEOUT_MS);
        match with_timeout(timeout, self.associate(credentials)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("wifi: no address after {} ms", WIFI_CONNECT_TIMEOUT_MS);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn send(
        &mut self,
        request: &Request<'_>,
        sink: &mut dyn BodySink,
    ) -> Result<ResponseHead, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let timeout = Duration::from_millis(request.timeout_ms as u64);
        with_timeout(timeout, self.perform(request, sink))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

/// Resolve a hostname to an IPv4 address, accepting dotted quads directly
async fn resolve_host(stack: Stack<'_>, host: &str) -> Result<core::net::Ipv4Addr, TransportError> {
    if let Some(ip) = http::parse_ipv4(host) {
        return Ok(ip);
    }

    debug!("net: resolving {}", host);
    let addrs = stack
        .dns_query(host, DnsQueryType::A)
        .await
        .map_err(|e| {
            warn!("net: dns lookup for {} failed: {:?}", host, e);
            TransportError::Dns
        })?;

    match addrs.first() {
        Some(embassy_net::IpAddress::Ipv4(v4)) => {
            let octets = v4.octets();
            Ok(core::net::Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
        }
        _ => Err(TransportError::Dns),
    }
}

/// Wait for link and a DHCP lease
async fn wait_for_ip(stack: Stack<'static>) {
    while !stack.is_link_up() {
        Timer::after(Duration::from_millis(500)).await;
    }
    debug!("wifi: link up");

    loop {
        if let Some(config) = stack.config_v4() {
            info!("wifi: got address {}", config.address);
            break;
        }
        Timer::after(Duration::from_millis(500)).await;
    }
}
