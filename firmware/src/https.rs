//! HTTPS exchange using embedded-tls
//!
//! Wraps the TCP socket with TLS 1.3 and runs the shared HTTP exchange over
//! it. Certificates are not verified.

use embassy_net::tcp::TcpSocket;
use embedded_tls::{Aes128GcmSha256, TlsConfig, TlsConnection, TlsContext, UnsecureProvider};
use log::{info, warn};
use paperdink_client::http::{BodySink, Request, ResponseHead, TransportError};
use rand_core::{CryptoRng, RngCore};

use crate::http::{self, Url};

/// TLS record buffer sizes
pub const TLS_READ_BUF_SIZE: usize = 16640;
pub const TLS_WRITE_BUF_SIZE: usize = 4096;

/// xorshift64 generator seeded from the hardware RNG
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x853c49e6748fea9b } else { seed },
        }
    }
}

impl RngCore for SimpleRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let val = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&val[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for SimpleRng {}

/// Buffers for one TLS session
pub struct TlsBuffers<'b> {
    pub read: &'b mut [u8],
    pub write: &'b mut [u8],
}

/// Perform `request` over a connected socket wrapped in TLS
pub async fn exchange<'a>(
    socket: TcpSocket<'a>,
    url: &Url<'_>,
    request: &Request<'_>,
    rx_buf: &mut [u8],
    tls: TlsBuffers<'_>,
    seed: u64,
    sink: &mut dyn BodySink,
) -> Result<ResponseHead, TransportError> {
    info!("tls: handshake with {}", url.host);

    let mut rng = SimpleRng::new(seed);
    let config = TlsConfig::new().with_server_name(url.host);
    let mut conn: TlsConnection<'_, TcpSocket<'a>, Aes128GcmSha256> =
        TlsConnection::new(socket, tls.read, tls.write);

    conn.open(TlsContext::new(&config, UnsecureProvider::new(&mut rng)))
        .await
        .map_err(|e| {
            warn!("tls: handshake failed: {:?}", e);
            TransportError::Tls
        })?;

    let result = http::exchange(&mut conn, url, request, rx_buf, sink).await;

    if conn.close().await.is_err() {
        warn!("tls: close failed");
    }
    result
}
