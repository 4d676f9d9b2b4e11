//! Image download with adaptive buffer sizing
//!
//! The buffer is sized once the response head is known, against the free heap
//! at that moment, so a TLS session that is still open is never starved.

use alloc::vec::Vec;

use log::{info, warn};

use crate::config::{FALLBACK_BUFFER_SIZE, HEAP_SAFETY_MARGIN};
use crate::http::{BodySink, ResponseHead};

/// Free-heap probe
pub trait HeapStats {
    fn free_bytes(&self) -> usize;
}

/// Why an image transfer produced no usable bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// Server did not answer 200
    Status(u16),
    /// Free heap is below the safety margin
    NoMemory { free: usize },
    /// Allocator refused the planned size
    Allocation { size: usize },
    /// Connection closed before any byte arrived
    Empty,
    /// Fewer bytes than the declared content-length
    Truncated { expected: usize, received: usize },
}

/// Decide how many bytes to allocate for a body.
///
/// A content-length under `max_image_size` is used exactly; otherwise the
/// fixed fallback size. Either is shrunk to `free_heap - margin` if needed.
pub fn plan_buffer_size(
    content_length: Option<usize>,
    max_image_size: usize,
    free_heap: usize,
) -> Result<usize, AcquireError> {
    let wanted = match content_length {
        Some(len) if len > 0 && len < max_image_size => len,
        _ => FALLBACK_BUFFER_SIZE,
    };

    let budget = free_heap.saturating_sub(HEAP_SAFETY_MARGIN);
    if budget == 0 {
        return Err(AcquireError::NoMemory { free: free_heap });
    }
    if wanted > budget {
        warn!(
            "image: shrinking buffer {} -> {} (free heap {})",
            wanted, budget, free_heap
        );
        return Ok(budget);
    }
    Ok(wanted)
}

/// [`BodySink`] that collects an image into a buffer sized from the head
pub struct ImageDownload<'a, H: HeapStats> {
    heap: &'a H,
    max_image_size: usize,
    buffer: Vec<u8>,
    capacity: usize,
    failure: Option<AcquireError>,
}

impl<'a, H: HeapStats> ImageDownload<'a, H> {
    pub fn new(heap: &'a H, max_image_size: usize) -> Self {
        Self {
            heap,
            max_image_size,
            buffer: Vec::new(),
            capacity: 0,
            failure: None,
        }
    }

    /// Bytes allocated for the current attempt
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hand over the bytes, or discard them if the transfer was incomplete
    pub fn finish(self, head: &ResponseHead) -> Result<Vec<u8>, AcquireError> {
        if let Some(failure) = self.failure {
            return Err(failure);
        }
        if head.status != 200 {
            return Err(AcquireError::Status(head.status));
        }
        if self.buffer.is_empty() {
            return Err(AcquireError::Empty);
        }
        if let Some(expected) = head.content_length
            && self.buffer.len() < expected
        {
            warn!(
                "image: truncated, {} of {} bytes",
                self.buffer.len(),
                expected
            );
            return Err(AcquireError::Truncated {
                expected,
                received: self.buffer.len(),
            });
        }
        info!("image: received {} bytes", self.buffer.len());
        Ok(self.buffer)
    }
}

impl<H: HeapStats> BodySink for ImageDownload<'_, H> {
    fn begin(&mut self, head: &ResponseHead) -> bool {
        self.buffer = Vec::new();
        self.capacity = 0;
        self.failure = None;
        if head.status != 200 {
            return false;
        }

        let free = self.heap.free_bytes();
        let size = match plan_buffer_size(head.content_length, self.max_image_size, free) {
            Ok(size) => size,
            Err(e) => {
                self.failure = Some(e);
                return false;
            }
        };
        if self.buffer.try_reserve_exact(size).is_err() {
            warn!("image: allocation of {} bytes failed", size);
            self.failure = Some(AcquireError::Allocation { size });
            return false;
        }
        info!(
            "image: buffer {} bytes (content-length {:?}, free {})",
            size, head.content_length, free
        );
        self.capacity = size;
        true
    }

    fn write(&mut self, chunk: &[u8]) -> bool {
        let room = self.capacity - self.buffer.len();
        let take = chunk.len().min(room);
        self.buffer.extend_from_slice(&chunk[..take]);
        self.buffer.len() < self.capacity
    }
}
