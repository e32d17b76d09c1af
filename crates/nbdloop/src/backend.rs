//! Backend and buffer-allocator seams.

use std::sync::Arc;

use crate::server::IoRequest;

/// Synchronous data-buffer allocator pair.
///
/// Payload buffers for reads and writes come from here, so a host that
/// needs special memory (pinned, pooled, DMA-capable) can supply its own
/// pair. Buffers are released through [`BufAlloc::free`] exactly once.
pub trait BufAlloc: Send + Sync {
    /// Allocate a zeroed buffer of exactly `len` bytes. `None` signals
    /// exhaustion and shuts the connection down.
    fn alloc(&self, len: usize) -> Option<Box<[u8]>>;

    /// Release a buffer previously returned by `alloc`.
    fn free(&self, buf: Box<[u8]>);
}

/// Plain heap allocator; the default choice.
pub struct HeapAlloc;

impl BufAlloc for HeapAlloc {
    fn alloc(&self, len: usize) -> Option<Box<[u8]>> {
        Some(vec![0u8; len].into_boxed_slice())
    }

    fn free(&self, buf: Box<[u8]>) {
        drop(buf);
    }
}

/// A block-device backend.
///
/// The four I/O methods are asynchronous: the engine hands over an
/// [`IoRequest`] and expects [`IoRequest::complete`] to be called later,
/// from any thread. Completing on the caller's stack is legal — the engine
/// registers the command as pending before invoking the backend. A backend
/// that accepts a request must eventually complete it; dropping the
/// request uncompleted counts as completing it with `EIO`.
pub trait Backend: Send + Sync {
    fn read(&self, io: IoRequest);
    fn write(&self, io: IoRequest);
    fn flush(&self, io: IoRequest);
    fn trim(&self, io: IoRequest);

    /// Invoked once, synchronously, when the kernel sends a disconnect.
    fn disconnect(&self) {}
}

/// Per-device parameter bundle handed to the engine constructor.
#[derive(Clone)]
pub struct DeviceParams {
    /// Device block size in bytes (power of two, 512..=65536).
    pub block_size: u32,
    /// Device capacity in blocks.
    pub num_blocks: u64,
    pub backend: Arc<dyn Backend>,
    pub buf_alloc: Arc<dyn BufAlloc>,
}

impl DeviceParams {
    /// Device capacity in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.num_blocks * self.block_size as u64
    }
}
