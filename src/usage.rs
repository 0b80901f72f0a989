//! Atomic usage counters.
//!
//! These back the lock-free allocator, which has no lock to update a peak
//! under. The peak is raised with a compare-and-swap loop, so it always holds
//! the true historical maximum even when several threads allocate at once.

use portable_atomic::{AtomicUsize, Ordering};

/// Current bytes, peak bytes and live block count.
#[derive(Debug, Default)]
pub struct Usage {
    bytes: AtomicUsize,
    peak: AtomicUsize,
    blocks: AtomicUsize,
}
impl Usage {
    /// Counters with everything at zero.
    pub const fn new() -> Self {
        Self {
            bytes: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            blocks: AtomicUsize::new(0),
        }
    }

    /// Records a new block of `len` bytes.
    pub fn block_allocated(&self, len: usize) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        let bytes = self.bytes.fetch_add(len, Ordering::Relaxed) + len;
        self.raise_peak(bytes);
    }

    /// Records that a block of `len` bytes went away.
    pub fn block_freed(&self, len: usize) {
        self.blocks.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(len, Ordering::Relaxed);
    }

    fn raise_peak(&self, bytes: usize) {
        let mut peak = self.peak.load(Ordering::Relaxed);
        while bytes > peak {
            match self.peak.compare_exchange_weak(
                peak,
                bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }
    }

    /// Bytes currently allocated.
    pub fn current_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// The largest value [`current_bytes`](Usage::current_bytes) has had since
    /// creation or the last [`reset_peak`](Usage::reset_peak).
    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Live blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Sets the peak to the current usage, so that later peaks measure usage
    /// since this call.
    pub fn reset_peak(&self) {
        self.peak.store(self.current_bytes(), Ordering::Relaxed);
        // an allocation racing with the store may have been missed
        self.raise_peak(self.current_bytes());
    }
}
