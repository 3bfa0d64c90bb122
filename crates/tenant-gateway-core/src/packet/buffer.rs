//! Owned payload buffers with release accounting.
//!
//! Every device payload entering the gateway is wrapped in a [`PayloadBuffer`]
//! allocated from a [`BufferLedger`]. A buffer is released exactly once: either
//! explicitly through [`PayloadBuffer::release`], which consumes the handle, or
//! when the handle is dropped on any other exit path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

#[derive(Debug, Default)]
struct LedgerCounts {
    allocated: AtomicU64,
    released: AtomicU64,
}

/// Shared allocation/release counters for payload buffers.
#[derive(Debug, Clone, Default)]
pub struct BufferLedger {
    counts: Arc<LedgerCounts>,
}

impl BufferLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `bytes` as a tracked payload.
    #[must_use]
    pub fn allocate(&self, bytes: impl Into<Bytes>) -> PayloadBuffer {
        self.counts.allocated.fetch_add(1, Ordering::Relaxed);
        PayloadBuffer {
            bytes: bytes.into(),
            ledger: self.clone(),
            released: false,
        }
    }

    /// Buffers handed out so far.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.counts.allocated.load(Ordering::Relaxed)
    }

    /// Buffers released so far.
    #[must_use]
    pub fn released(&self) -> u64 {
        self.counts.released.load(Ordering::Relaxed)
    }

    /// Buffers still held somewhere in the pipeline.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.allocated().saturating_sub(self.released())
    }

    fn record_release(&self) {
        self.counts.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Device payload owned by exactly one pipeline stage at a time.
pub struct PayloadBuffer {
    bytes: Bytes,
    ledger: BufferLedger,
    released: bool,
}

impl PayloadBuffer {
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Release the buffer back to its ledger.
    pub fn release(mut self) {
        self.mark_released();
    }

    fn mark_released(&mut self) {
        if !self.released {
            self.released = true;
            self.bytes = Bytes::new();
            self.ledger.record_release();
        }
    }
}

impl Drop for PayloadBuffer {
    fn drop(&mut self) {
        self.mark_released();
    }
}

impl fmt::Debug for PayloadBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadBuffer")
            .field("len", &self.bytes.len())
            .field("released", &self.released)
            .finish()
    }
}
