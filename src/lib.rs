#![doc = include_str!("../README.md")]
#![cfg_attr(feature = "nightly", feature(allocator_api))]
#![deny(missing_docs)]

use std::borrow::Cow;

use log::error;

#[doc(inline)]
pub use block::*;
#[doc(inline)]
pub use config::*;
#[doc(inline)]
pub use error::*;
#[doc(inline)]
pub use guarded::Guarded;
#[doc(inline)]
pub use leak::LeakDetector;
#[doc(inline)]
pub use lockfree::LockFree;
#[doc(inline)]
pub use lock::*;
#[doc(inline)]
pub use platform::*;
#[doc(inline)]
pub use report::*;
#[doc(inline)]
pub use sink::*;

pub mod block;
pub mod config;
pub mod error;
pub mod global;
pub mod guarded;
pub mod layout;
pub mod leak;
pub mod lock;
pub mod lockfree;
pub mod platform;
pub mod report;
pub mod sink;
pub mod usage;

/// The contract shared by [`Guarded`] and [`LockFree`].
///
/// Every operation takes and returns [`Block`]s typed by the allocator, so
/// blocks can never be handed to an allocator other than the kind that made
/// them.
///
/// # Failures
/// Recoverable failures are reported twice: as a line of text on the
/// allocator's [`Sink`], and as an [`Error`]. Block lengths that overflow in
/// [`allocate_array`](MemAllocator::allocate_array) and
/// [`allocate_zeroed_array`](MemAllocator::allocate_zeroed_array) abort the
/// process instead, since the caller's size arithmetic cannot be trusted
/// anymore.
pub trait MemAllocator: Sync + Sized {
    /// Allocates `len` bytes (rounded up to a multiple of 4), tagged with
    /// `name` for diagnostics.
    ///
    /// # Returns
    /// [`Error::OutOfMemory`] if the platform allocator fails.
    fn allocate(&self, len: usize, name: &'static str) -> Result<Block<Self>>;

    /// Like [`allocate`](MemAllocator::allocate), but the payload is zeroed.
    fn allocate_zeroed(&self, len: usize, name: &'static str) -> Result<Block<Self>>;

    /// Allocates `len` bytes whose address is a multiple of `alignment`.
    ///
    /// Alignments below the allocator's minimum are raised to it.
    ///
    /// # Returns
    /// - [`Error::InvalidAlignment`] - `alignment` is not a power of two, or
    ///   is 1024 or more.
    /// - [`Error::OutOfMemory`] - the platform allocator failed.
    fn allocate_aligned(
        &self,
        len: usize,
        alignment: usize,
        name: &'static str,
    ) -> Result<Block<Self>>;

    /// Allocates `count` elements of `size` bytes.
    ///
    /// # Panics
    /// Aborts the process if `count * size` overflows.
    fn allocate_array(&self, count: usize, size: usize, name: &'static str) -> Result<Block<Self>> {
        let len = array_len_or_abort(self, count, size, name);
        self.allocate(len, name)
    }

    /// Allocates `count` zeroed elements of `size` bytes.
    ///
    /// # Panics
    /// Aborts the process if `count * size` overflows.
    fn allocate_zeroed_array(
        &self,
        count: usize,
        size: usize,
        name: &'static str,
    ) -> Result<Block<Self>> {
        let len = array_len_or_abort(self, count, size, name);
        self.allocate_zeroed(len, name)
    }

    /// Moves a block into a new allocation of `len` bytes.
    ///
    /// With `None`, this is [`allocate`](MemAllocator::allocate). Otherwise a
    /// new block with the old block's alignment is allocated, the first
    /// `min(old, new)` bytes are copied over and the old block is freed. Blocks
    /// never grow in place. `name` is only used when `block` is `None`; an
    /// existing block keeps its name.
    ///
    /// If the new allocation fails, the old block is left untouched and the
    /// error is returned. If freeing the old block reports corruption, the
    /// copy is still returned.
    ///
    /// # Safety
    /// `block` must be live and allocated by this allocator.
    unsafe fn reallocate(
        &self,
        block: Option<Block<Self>>,
        len: usize,
        name: &'static str,
    ) -> Result<Block<Self>>;

    /// Like [`reallocate`](MemAllocator::reallocate), but when the block grows
    /// the added bytes are zeroed.
    ///
    /// # Safety
    /// See [`reallocate`](MemAllocator::reallocate).
    unsafe fn reallocate_zeroed(
        &self,
        block: Option<Block<Self>>,
        len: usize,
        name: &'static str,
    ) -> Result<Block<Self>>;

    /// Allocates a copy of a block, with the same length and alignment.
    ///
    /// # Safety
    /// `block` must be live and allocated by this allocator.
    unsafe fn duplicate(&self, block: Block<Self>) -> Result<Block<Self>>;

    /// Frees a block.
    ///
    /// # Returns
    /// [`Error::NullFree`] for `None`. The guarded allocator also detects
    /// double frees, corrupt blocks and foreign pointers; see
    /// [the guarded module](crate::guarded#freeing).
    ///
    /// # Safety
    /// For the lock-free allocator, `block` must be live and allocated by this
    /// allocator. The guarded allocator additionally tolerates blocks that
    /// were already freed or corrupted, as long as their headers are still
    /// readable.
    unsafe fn free(&self, block: Option<Block<Self>>) -> Result<()>;

    /// The (rounded) length of a block, or 0 for `None`.
    ///
    /// # Safety
    /// `block` must be live and allocated by this allocator.
    unsafe fn allocation_len(&self, block: Option<Block<Self>>) -> usize;

    /// The name of a block. The lock-free allocator does not store names and
    /// always returns a placeholder.
    ///
    /// # Safety
    /// `block` must be live and allocated by this allocator.
    unsafe fn name(&self, block: Option<Block<Self>>) -> Cow<'static, str>;

    /// Renames a block. Does nothing on the lock-free allocator.
    ///
    /// # Safety
    /// `block` must be live and allocated by this allocator.
    unsafe fn set_name(&self, block: Block<Self>, name: &'static str);

    /// Bytes in live blocks, headers excluded.
    fn current_bytes(&self) -> usize;

    /// The largest value of [`current_bytes`](MemAllocator::current_bytes)
    /// since creation or the last
    /// [`reset_peak_bytes`](MemAllocator::reset_peak_bytes).
    fn peak_bytes(&self) -> usize;

    /// The number of live blocks.
    fn block_count(&self) -> usize;

    /// Sets the peak to the current usage.
    fn reset_peak_bytes(&self);

    /// Checks every live block for corruption. Always `true` on the lock-free
    /// allocator, which has nothing to check.
    fn consistency_check(&self) -> bool;

    /// Calls `f` on every live block. Does nothing on the lock-free allocator.
    ///
    /// The guarded allocator holds its lock during the walk: `f` must not call
    /// back into the allocator. Blocks whose headers are corrupt are skipped.
    fn for_each_block(&self, f: &mut dyn FnMut(Block<Self>));

    /// Writes a usage [`Report`] to the sink.
    fn print_report(&self);

    /// Writes a [`StructuredReport`] to the sink.
    fn print_report_structured(&self);

    /// Writes a [`BlockList`] to the sink.
    fn print_blocks(&self);

    /// The sink receiving this allocator's diagnostics.
    fn sink(&self) -> &Sink;

    /// Redirects this allocator's diagnostics to `callback`, or back to
    /// standard error if it is `None`.
    fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        self.sink().set_callback(callback)
    }

    /// Turns poison filling of new and freed blocks on or off.
    fn set_memory_debug(&self, enabled: bool);

    /// Writes a summary of every live block to the sink, if there are any.
    ///
    /// # Returns
    /// The number of live blocks.
    fn report_leaks(&self) -> usize;

    /// Records that leak detection has run. Blocks freed afterwards get a
    /// warning, since they were not counted as leaks.
    fn set_leak_detection_done(&self);
}

/// The length of a `count` by `size` array, aborting the process if it
/// overflows.
fn array_len_or_abort<A: MemAllocator>(
    allocator: &A,
    count: usize,
    size: usize,
    name: &'static str,
) -> usize {
    match layout::array_len(count, size) {
        Some(len) => len,
        None => {
            allocator.sink().emit(format_args!(
                "Malloc array aborted due to integer overflow: len={count}x{size} in {name}, total {}\n",
                allocator.current_bytes()
            ));
            error!("array allocation {name} of {count}x{size} overflows, aborting");
            std::process::abort()
        }
    }
}

const NULL_NAME: &str = "<null block>";


#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn guarded() -> Guarded<System, Mutex<()>> {
        Guarded::new(System)
    }

    fn lockfree() -> LockFree<System> {
        LockFree::new(System)
    }

    fn bytes<'a, A: MemAllocator>(allocator: &A, block: Block<A>) -> &'a mut [u8] {
        unsafe {
            let len = allocator.allocation_len(Some(block));
            core::slice::from_raw_parts_mut(block.as_ptr(), len)
        }
    }

    fn lengths_round_to_four<A: MemAllocator>(allocator: A) {
        for len in [0, 1, 3, 4, 5, 100, 1023] {
            let block = allocator.allocate(len, "x").unwrap();
            assert_eq!(unsafe { allocator.allocation_len(Some(block)) }, (len + 3) & !3);
            unsafe { allocator.free(Some(block)).unwrap() };
        }
        assert_eq!(unsafe { allocator.allocation_len(None) }, 0);
    }

    #[test]
    fn guarded_lengths_round_to_four() {
        lengths_round_to_four(guarded());
    }

    #[test]
    fn lockfree_lengths_round_to_four() {
        lengths_round_to_four(lockfree());
    }

    fn zeroed_blocks_read_zero<A: MemAllocator>(allocator: A) {
        allocator.set_memory_debug(true);
        for len in [1, 64, 4096] {
            let block = allocator.allocate_zeroed(len, "zeroed").unwrap();
            assert!(bytes(&allocator, block).iter().all(|&b| b == 0));
            unsafe { allocator.free(Some(block)).unwrap() };
        }
        let block = allocator.allocate_zeroed_array(16, 8, "zeroed").unwrap();
        assert_eq!(bytes(&allocator, block).len(), 128);
        assert!(bytes(&allocator, block).iter().all(|&b| b == 0));
        unsafe { allocator.free(Some(block)).unwrap() };
    }

    #[test]
    fn guarded_zeroed_blocks_read_zero() {
        zeroed_blocks_read_zero(guarded());
    }

    #[test]
    fn lockfree_zeroed_blocks_read_zero() {
        zeroed_blocks_read_zero(lockfree());
    }

    fn debug_fill_poisons_new_blocks<A: MemAllocator>(allocator: A) {
        allocator.set_memory_debug(true);
        let block = allocator.allocate(32, "poisoned").unwrap();
        assert!(bytes(&allocator, block).iter().all(|&b| b == ALLOC_POISON));
        unsafe { allocator.free(Some(block)).unwrap() };
    }

    #[test]
    fn guarded_debug_fill_poisons_new_blocks() {
        debug_fill_poisons_new_blocks(guarded());
    }

    #[test]
    fn lockfree_debug_fill_poisons_new_blocks() {
        debug_fill_poisons_new_blocks(lockfree());
    }

    fn counters_follow_live_blocks<A: MemAllocator>(allocator: A) {
        let mut live = Vec::new();
        for i in 0..32usize {
            live.push(allocator.allocate(i * 3, "counted").unwrap());
            if i % 3 == 0 {
                let block = live.swap_remove(i % live.len());
                unsafe { allocator.free(Some(block)).unwrap() };
            }
            let sum: usize = live
                .iter()
                .map(|&block| unsafe { allocator.allocation_len(Some(block)) })
                .sum();
            assert_eq!(allocator.current_bytes(), sum);
            assert_eq!(allocator.block_count(), live.len());
            assert!(allocator.peak_bytes() >= allocator.current_bytes());
        }
        for block in live {
            unsafe { allocator.free(Some(block)).unwrap() };
        }
        assert_eq!(allocator.current_bytes(), 0);
        assert_eq!(allocator.block_count(), 0);
    }

    #[test]
    fn guarded_counters_follow_live_blocks() {
        counters_follow_live_blocks(guarded());
    }

    #[test]
    fn lockfree_counters_follow_live_blocks() {
        counters_follow_live_blocks(lockfree());
    }

    fn peak_is_monotonic_until_reset<A: MemAllocator>(allocator: A) {
        let mut last_peak = 0;
        let mut live = Vec::new();
        for i in 1..20usize {
            if i % 4 == 0 {
                if let Some(block) = live.pop() {
                    unsafe { allocator.free(Some(block)).unwrap() };
                }
            } else {
                live.push(allocator.allocate(i * 16, "peak").unwrap());
            }
            assert!(allocator.peak_bytes() >= last_peak);
            assert!(allocator.peak_bytes() >= allocator.current_bytes());
            last_peak = allocator.peak_bytes();
        }
        let block = live.pop().unwrap();
        unsafe { allocator.free(Some(block)).unwrap() };
        allocator.reset_peak_bytes();
        assert_eq!(allocator.peak_bytes(), allocator.current_bytes());
        for block in live {
            unsafe { allocator.free(Some(block)).unwrap() };
        }
    }

    #[test]
    fn guarded_peak_is_monotonic_until_reset() {
        peak_is_monotonic_until_reset(guarded());
    }

    #[test]
    fn lockfree_peak_is_monotonic_until_reset() {
        peak_is_monotonic_until_reset(lockfree());
    }

    fn aligned_blocks_are_aligned<A: MemAllocator>(allocator: A) {
        let mut alignment = 1;
        while alignment < layout::ALIGNMENT_LIMIT {
            let block = allocator.allocate_aligned(40, alignment, "aligned").unwrap();
            assert_eq!(block.addr() % alignment, 0, "alignment {alignment}");
            assert_eq!(unsafe { allocator.allocation_len(Some(block)) }, 40);
            bytes(&allocator, block).fill(0x5a);
            let copy = unsafe { allocator.duplicate(block) }.unwrap();
            assert_eq!(copy.addr() % alignment, 0);
            assert!(bytes(&allocator, copy).iter().all(|&b| b == 0x5a));
            unsafe {
                allocator.free(Some(copy)).unwrap();
                allocator.free(Some(block)).unwrap();
            }
            alignment *= 2;
        }
        assert_eq!(
            allocator.allocate_aligned(8, 24, "bad").unwrap_err(),
            Error::InvalidAlignment
        );
        assert_eq!(
            allocator
                .allocate_aligned(8, layout::ALIGNMENT_LIMIT, "bad")
                .unwrap_err(),
            Error::InvalidAlignment
        );
        assert_eq!(allocator.block_count(), 0);
    }

    #[test]
    fn guarded_aligned_blocks_are_aligned() {
        aligned_blocks_are_aligned(guarded());
    }

    #[test]
    fn lockfree_aligned_blocks_are_aligned() {
        aligned_blocks_are_aligned(lockfree());
    }

    fn reallocate_preserves_contents<A: MemAllocator>(allocator: A) {
        let block = allocator.allocate(16, "grow").unwrap();
        for (i, byte) in bytes(&allocator, block).iter_mut().enumerate() {
            *byte = i as u8 + 1;
        }

        let shrunk = unsafe { allocator.reallocate(Some(block), 8, "grow") }.unwrap();
        assert_eq!(bytes(&allocator, shrunk), &[1, 2, 3, 4, 5, 6, 7, 8]);

        allocator.set_memory_debug(true);
        let grown = unsafe { allocator.reallocate_zeroed(Some(shrunk), 24, "grow") }.unwrap();
        let grown_bytes = bytes(&allocator, grown);
        assert_eq!(&grown_bytes[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(grown_bytes[8..].iter().all(|&b| b == 0));

        let grown = unsafe { allocator.reallocate(Some(grown), 32, "grow") }.unwrap();
        let grown_bytes = bytes(&allocator, grown);
        assert_eq!(&grown_bytes[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(grown_bytes[24..].iter().all(|&b| b == ALLOC_POISON));

        let aligned = allocator.allocate_aligned(8, 64, "aligned").unwrap();
        let moved = unsafe { allocator.reallocate(Some(aligned), 100, "aligned") }.unwrap();
        assert_eq!(moved.addr() % 64, 0);

        let fresh = unsafe { allocator.reallocate(None, 12, "fresh") }.unwrap();
        assert_eq!(unsafe { allocator.allocation_len(Some(fresh)) }, 12);

        assert_eq!(allocator.current_bytes(), 32 + 100 + 12);
        unsafe {
            allocator.free(Some(grown)).unwrap();
            allocator.free(Some(moved)).unwrap();
            allocator.free(Some(fresh)).unwrap();
        }
        assert_eq!(allocator.block_count(), 0);
    }

    #[test]
    fn guarded_reallocate_preserves_contents() {
        reallocate_preserves_contents(guarded());
    }

    #[test]
    fn lockfree_reallocate_preserves_contents() {
        reallocate_preserves_contents(lockfree());
    }

    fn null_free_is_reported<A: MemAllocator>(allocator: A) {
        let text = testing::capture(&allocator);
        assert_eq!(unsafe { allocator.free(None) }, Err(Error::NullFree));
        assert!(text.lock().unwrap().contains("free NULL pointer"));
    }

    #[test]
    fn guarded_null_free_is_reported() {
        null_free_is_reported(guarded());
    }

    #[test]
    fn lockfree_null_free_is_reported() {
        null_free_is_reported(lockfree());
    }

    fn example_scenario<A: MemAllocator>(allocator: A) {
        let a = allocator.allocate(100, "buf1").unwrap();
        let b = allocator.allocate(4, "buf2").unwrap();
        assert_eq!(allocator.current_bytes(), 104);
        unsafe { allocator.free(Some(a)).unwrap() };
        assert_eq!(allocator.current_bytes(), 4);
        let c = unsafe { allocator.reallocate(Some(b), 40, "buf2") }.unwrap();
        assert_eq!(allocator.current_bytes(), 40);
        unsafe { allocator.free(Some(c)).unwrap() };
        assert_eq!(allocator.current_bytes(), 0);
        assert_eq!(allocator.block_count(), 0);
    }

    #[test]
    fn guarded_example_scenario() {
        example_scenario(guarded());
    }

    #[test]
    fn lockfree_example_scenario() {
        example_scenario(lockfree());
    }
}
