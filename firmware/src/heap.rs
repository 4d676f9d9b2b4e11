//! Heap statistics from the global allocator

use paperdink_client::image::HeapStats;

/// [`HeapStats`] backed by `esp_alloc::HEAP`
#[derive(Debug, Default, Clone, Copy)]
pub struct EspHeap;

impl HeapStats for EspHeap {
    fn free_bytes(&self) -> usize {
        esp_alloc::HEAP.free()
    }
}
