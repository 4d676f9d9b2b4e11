//! In-memory collaborators shared by the unit tests

use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::convert::Infallible;

use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use embedded_hal_async::delay::DelayNs;

use crate::cache::CacheStore;
use crate::config::WifiCredentials;
use crate::http::{BodySink, HttpTransport, Method, Request, ResponseHead, TransportError};
use crate::image::HeapStats;
use crate::kv::{Key, KvStore};
use crate::render::{Abort, FrameOutcome, RenderSink};

/// Canned response for [`FakeTransport`]
#[derive(Debug, Clone)]
pub struct Reply {
    result: Result<(ResponseHead, Vec<u8>), TransportError>,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self::with_status(status, b"")
    }

    pub fn with_status(status: u16, body: &[u8]) -> Self {
        Self {
            result: Ok((
                ResponseHead {
                    status,
                    content_length: Some(body.len()),
                },
                body.to_vec(),
            )),
        }
    }

    pub fn json(body: &str) -> Self {
        Self::with_status(200, body.as_bytes())
    }

    pub fn bytes(body: &[u8]) -> Self {
        Self::with_status(200, body)
    }

    /// Declares `declared` bytes but sends only `body`
    pub fn truncated(body: &[u8], declared: usize) -> Self {
        Self {
            result: Ok((
                ResponseHead {
                    status: 200,
                    content_length: Some(declared),
                },
                body.to_vec(),
            )),
        }
    }

    pub fn error(error: TransportError) -> Self {
        Self { result: Err(error) }
    }
}

/// Request as seen by [`FakeTransport`]
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl SentRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Scripted transport; replies are consumed in order
#[derive(Debug, Default)]
pub struct FakeTransport {
    pub requests: Vec<SentRequest>,
    pub replies: VecDeque<Reply>,
    pub connected: bool,
    pub connect_results: VecDeque<Result<(), TransportError>>,
    pub connect_calls: Vec<WifiCredentials>,
}

impl FakeTransport {
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reply: Reply) {
        self.replies.push_back(reply);
    }

    pub fn urls(&self) -> Vec<&str> {
        self.requests.iter().map(|r| r.url.as_str()).collect()
    }
}

impl HttpTransport for FakeTransport {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), TransportError> {
        self.connect_calls.push(credentials.clone());
        let result = self.connect_results.pop_front().unwrap_or(Ok(()));
        self.connected = result.is_ok();
        result
    }

    async fn send(
        &mut self,
        request: &Request<'_>,
        sink: &mut dyn BodySink,
    ) -> Result<ResponseHead, TransportError> {
        self.requests.push(SentRequest {
            method: request.method,
            url: request.url.to_string(),
            headers: request
                .headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body: request.body.map(|b| b.to_vec()),
        });
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let reply = self
            .replies
            .pop_front()
            .unwrap_or(Reply::error(TransportError::Connect));
        let (head, body) = reply.result?;
        if request.method != Method::Head && sink.begin(&head) {
            for chunk in body.chunks(512) {
                if !sink.write(chunk) {
                    break;
                }
            }
        }
        Ok(head)
    }
}

/// Delay that returns immediately and remembers what was asked
#[derive(Debug, Default)]
pub struct RecordingDelay {
    pub delays_ms: Vec<u32>,
}

impl DelayNs for RecordingDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.delays_ms.push(ns / 1_000_000);
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.delays_ms.push(ms);
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Number(u32),
    Flag(bool),
}

#[derive(Debug)]
pub struct StoreFailure;

/// Shared in-memory [`KvStore`]; clones see the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    values: Rc<RefCell<BTreeMap<Key, Value>>>,
    failing: bool,
}

impl MemoryKv {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.borrow().is_empty()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.values.borrow().contains_key(&key)
    }

    pub fn with_str(self, key: Key, value: &str) -> Self {
        self.values
            .borrow_mut()
            .insert(key, Value::Str(value.to_string()));
        self
    }

    pub fn with_number(self, key: Key, value: u32) -> Self {
        self.values.borrow_mut().insert(key, Value::Number(value));
        self
    }

    fn check(&self) -> Result<(), StoreFailure> {
        if self.failing { Err(StoreFailure) } else { Ok(()) }
    }

    fn put(&mut self, key: Key, value: Value) -> Result<(), StoreFailure> {
        self.check()?;
        self.values.borrow_mut().insert(key, value);
        Ok(())
    }
}

impl KvStore for MemoryKv {
    type Error = StoreFailure;

    fn get_str(&mut self, key: Key) -> Result<Option<String>, StoreFailure> {
        self.check()?;
        Ok(match self.values.borrow().get(&key) {
            Some(Value::Str(s)) => Some(s.clone()),
            _ => None,
        })
    }

    fn set_str(&mut self, key: Key, value: &str) -> Result<(), StoreFailure> {
        self.put(key, Value::Str(value.to_string()))
    }

    fn get_u32(&mut self, key: Key) -> Result<Option<u32>, StoreFailure> {
        self.check()?;
        Ok(match self.values.borrow().get(&key) {
            Some(Value::Number(n)) => Some(*n),
            _ => None,
        })
    }

    fn set_u32(&mut self, key: Key, value: u32) -> Result<(), StoreFailure> {
        self.put(key, Value::Number(value))
    }

    fn get_bool(&mut self, key: Key) -> Result<Option<bool>, StoreFailure> {
        self.check()?;
        Ok(match self.values.borrow().get(&key) {
            Some(Value::Flag(b)) => Some(*b),
            _ => None,
        })
    }

    fn set_bool(&mut self, key: Key, value: bool) -> Result<(), StoreFailure> {
        self.put(key, Value::Flag(value))
    }

    fn remove(&mut self, key: Key) -> Result<(), StoreFailure> {
        self.check()?;
        self.values.borrow_mut().remove(&key);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreFailure> {
        self.check()?;
        self.values.borrow_mut().clear();
        Ok(())
    }
}

/// Shared in-memory [`CacheStore`]; clones see the same files
#[derive(Debug, Clone)]
pub struct MemoryCache {
    files: Rc<RefCell<BTreeMap<String, Vec<u8>>>>,
    available: bool,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            files: Rc::default(),
            available: true,
        }
    }
}

impl MemoryCache {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::default()
        }
    }

    pub fn has(&self, path: &str) -> bool {
        self.files.borrow().contains_key(path)
    }

    pub fn file_count(&self) -> usize {
        self.files.borrow().len()
    }
}

impl CacheStore for MemoryCache {
    type Error = StoreFailure;

    fn is_available(&self) -> bool {
        self.available
    }

    fn exists(&mut self, path: &str) -> bool {
        self.available && self.has(path)
    }

    fn size(&mut self, path: &str) -> Result<usize, StoreFailure> {
        self.files.borrow().get(path).map(Vec::len).ok_or(StoreFailure)
    }

    fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, StoreFailure> {
        let files = self.files.borrow();
        let data = files.get(path).ok_or(StoreFailure)?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StoreFailure> {
        if !self.available {
            return Err(StoreFailure);
        }
        self.files
            .borrow_mut()
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), StoreFailure> {
        self.files
            .borrow_mut()
            .remove(path)
            .map(|_| ())
            .ok_or(StoreFailure)
    }

    fn clear_dir(&mut self, dir: &str) -> Result<usize, StoreFailure> {
        let mut prefix = dir.to_string();
        prefix.push('/');
        let mut files = self.files.borrow_mut();
        let before = files.len();
        files.retain(|path, _| !path.starts_with(&prefix));
        Ok(before - files.len())
    }
}

/// Constant free-heap reading
#[derive(Debug, Clone, Copy)]
pub struct FixedHeap(pub usize);

impl HeapStats for FixedHeap {
    fn free_bytes(&self) -> usize {
        self.0
    }
}

/// Target handed to the draw closure for one page
pub struct PageTarget {
    size: Size,
    rows: core::ops::Range<i32>,
    pixels: Vec<bool>,
    log: Vec<(Point, BinaryColor)>,
}

impl OriginDimensions for PageTarget {
    fn size(&self) -> Size {
        self.size
    }
}

impl DrawTarget for PageTarget {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Infallible>
    where
        I: IntoIterator<Item = Pixel<BinaryColor>>,
    {
        let width = self.size.width as i32;
        for Pixel(point, color) in pixels {
            self.log.push((point, color));
            if (0..width).contains(&point.x) && self.rows.contains(&point.y) {
                self.pixels[(point.y * width + point.x) as usize] = color.is_on();
            }
        }
        Ok(())
    }
}

/// A frame that reached the panel
#[derive(Debug, Clone)]
pub struct RecordedFrame {
    width: u32,
    pixels: Vec<bool>,
}

impl RecordedFrame {
    pub fn black(&self, x: u32, y: u32) -> bool {
        self.pixels[(y * self.width + x) as usize]
    }

    pub fn any_black(&self) -> bool {
        self.pixels.iter().any(|&p| p)
    }
}

/// Paged [`RenderSink`] that keeps every shown frame
pub struct FrameRecorder {
    size: Size,
    pages: u32,
    frames: Vec<RecordedFrame>,
    aborted: usize,
    consistent: bool,
}

impl FrameRecorder {
    pub fn new(width: u32, height: u32, pages: u32) -> Self {
        Self {
            size: Size::new(width, height),
            pages: pages.max(1),
            frames: Vec::new(),
            aborted: 0,
            consistent: true,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames.len()
    }

    pub fn aborted(&self) -> usize {
        self.aborted
    }

    pub fn last(&self) -> &RecordedFrame {
        self.frames.last().expect("no frame shown")
    }

    /// Every page of every frame saw the same draw commands
    pub fn pages_consistent(&self) -> bool {
        self.consistent
    }
}

impl RenderSink for FrameRecorder {
    type Target = PageTarget;
    type Error = Infallible;

    fn frame<F>(&mut self, mut draw: F) -> Result<FrameOutcome, Infallible>
    where
        F: FnMut(&mut PageTarget) -> Result<(), Abort>,
    {
        let band = self.size.height.div_ceil(self.pages) as i32;
        let mut pixels = vec![false; (self.size.width * self.size.height) as usize];
        let mut logs: Vec<Vec<(Point, BinaryColor)>> = Vec::new();

        for page in 0..self.pages as i32 {
            let start = page * band;
            let mut target = PageTarget {
                size: self.size,
                rows: start..start + band,
                pixels: core::mem::take(&mut pixels),
                log: Vec::new(),
            };
            let result = draw(&mut target);
            pixels = target.pixels;
            logs.push(target.log);
            if result.is_err() {
                self.aborted += 1;
                return Ok(FrameOutcome::Aborted);
            }
        }

        self.consistent &= logs.windows(2).all(|pair| pair[0] == pair[1]);
        self.frames.push(RecordedFrame {
            width: self.size.width,
            pixels,
        });
        Ok(FrameOutcome::Shown)
    }
}

fn crc32(parts: &[&[u8]]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for part in parts {
        for &byte in *part {
            crc ^= byte as u32;
            for _ in 0..8 {
                let mask = (crc & 1).wrapping_neg();
                crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
            }
        }
    }
    !crc
}

fn push_chunk(out: &mut Vec<u8>, kind: &[u8; 4], body: &[u8]) {
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out.extend_from_slice(&crc32(&[kind, body]).to_be_bytes());
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let (pa, pb, pc) = (
        (p - a as i16).abs(),
        (p - b as i16).abs(),
        (p - c as i16).abs(),
    );
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

/// Build a PNG from packed rows, cycling through all five filter types
pub fn encode_png(width: u32, height: u32, color_type: u8, bit_depth: u8, rows: &[u8]) -> Vec<u8> {
    encode_png_with(width, height, color_type, bit_depth, rows, None, None)
}

pub fn encode_png_with(
    width: u32,
    height: u32,
    color_type: u8,
    bit_depth: u8,
    rows: &[u8],
    palette: Option<&[u8]>,
    transparency: Option<&[u8]>,
) -> Vec<u8> {
    let channels = match color_type {
        2 => 3,
        4 => 2,
        6 => 4,
        _ => 1,
    };
    let bits = channels * bit_depth as usize;
    let row_len = (width as usize * bits).div_ceil(8);
    let stride = (bits / 8).max(1);
    assert_eq!(rows.len(), row_len * height as usize);

    let mut filtered = Vec::with_capacity((row_len + 1) * height as usize);
    let zero = vec![0u8; row_len];
    for y in 0..height as usize {
        let cur = &rows[y * row_len..(y + 1) * row_len];
        let prev = if y == 0 { &zero[..] } else { &rows[(y - 1) * row_len..y * row_len] };
        let filter = (y % 5) as u8;
        filtered.push(filter);
        for i in 0..row_len {
            let left = if i >= stride { cur[i - stride] } else { 0 };
            let up_left = if i >= stride { prev[i - stride] } else { 0 };
            let predicted = match filter {
                0 => 0,
                1 => left,
                2 => prev[i],
                3 => ((left as u16 + prev[i] as u16) / 2) as u8,
                _ => paeth(left, prev[i], up_left),
            };
            filtered.push(cur[i].wrapping_sub(predicted));
        }
    }

    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[bit_depth, color_type, 0, 0, 0]);

    let mut out = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    push_chunk(&mut out, b"IHDR", &ihdr);
    if let Some(palette) = palette {
        push_chunk(&mut out, b"PLTE", palette);
    }
    if let Some(alpha) = transparency {
        push_chunk(&mut out, b"tRNS", alpha);
    }
    let compressed = miniz_oxide::deflate::compress_to_vec_zlib(&filtered, 6);
    // Split image data over two chunks to exercise chunk boundaries.
    let mid = compressed.len() / 2;
    push_chunk(&mut out, b"IDAT", &compressed[..mid]);
    push_chunk(&mut out, b"IDAT", &compressed[mid..]);
    push_chunk(&mut out, b"IEND", &[]);
    out
}
