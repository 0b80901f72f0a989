//! The lock-free allocator.
//!
//! Each payload is preceded by a single length word, so blocks cost 8 bytes
//! (16 or more when aligned) and allocation never takes a lock. The price is
//! that nothing is checked: a block freed twice, or a pointer that never came
//! from this allocator, is handed straight to the platform.
//!
//! # Header
//! The length word sits immediately before the payload. Lengths are multiples
//! of 4, so the low bit is free and marks aligned blocks. Aligned blocks store
//! their alignment in front of the length word, and the envelope's padding in
//! front of that.

use core::{fmt::Debug, mem::size_of, ptr::NonNull};
use std::borrow::Cow;

use log::{error, trace, warn};
use portable_atomic::{AtomicBool, Ordering};

use crate::{
    layout::{align_len, Envelope, ALIGNED_MALLOC_MIN_ALIGNMENT},
    usage::Usage,
    Block, Config, Error, MemAllocator, Platform, Report, Result, Sink, StructuredReport, System,
    ALLOC_POISON, FREE_POISON,
};

/// Placeholder returned for every block name.
const UNNAMED_BLOCK: &str = "<unnamed block>";

/// Marks the length word of an aligned block.
const ALIGNED_FLAG: usize = 1;

#[repr(C)]
struct Head {
    len: usize,
}

#[repr(C)]
struct HeadAligned {
    alignment: u16,
    len: usize,
}

const HEAD_SIZE: usize = size_of::<Head>();
const HEAD_ALIGNED_SIZE: usize = size_of::<HeadAligned>();

const _: () = assert!(HEAD_ALIGNED_SIZE - HEAD_SIZE == core::mem::offset_of!(HeadAligned, len));

/// What the header of a live block says.
#[derive(Clone, Copy, Debug)]
struct Header {
    len: usize,
    envelope: Option<Envelope>,
}
impl Header {
    /// # Safety
    /// `payload` must be a live payload of a lock-free allocator.
    unsafe fn read(payload: NonNull<u8>) -> Self {
        let word = unsafe { payload.as_ptr().sub(HEAD_SIZE).cast::<Head>().read() }.len;
        if word & ALIGNED_FLAG == 0 {
            return Self {
                len: word,
                envelope: None,
            };
        }
        let head = unsafe {
            payload
                .as_ptr()
                .sub(HEAD_ALIGNED_SIZE)
                .cast::<HeadAligned>()
                .read()
        };
        Self {
            len: head.len & !ALIGNED_FLAG,
            envelope: Envelope::new(
                head.alignment as usize,
                ALIGNED_MALLOC_MIN_ALIGNMENT,
                HEAD_ALIGNED_SIZE,
            ),
        }
    }

    /// The base pointer and size the platform handed out.
    ///
    /// # Safety
    /// See [`read`](Header::read).
    unsafe fn base(&self, payload: NonNull<u8>) -> (NonNull<u8>, usize) {
        match self.envelope {
            Some(envelope) => unsafe {
                let header = NonNull::new_unchecked(payload.as_ptr().sub(HEAD_ALIGNED_SIZE));
                (
                    envelope.real_base(header),
                    envelope.padding() + HEAD_ALIGNED_SIZE + self.len,
                )
            },
            None => unsafe {
                (
                    NonNull::new_unchecked(payload.as_ptr().sub(HEAD_SIZE)),
                    HEAD_SIZE + self.len,
                )
            },
        }
    }
}

/// A lock-free allocator.
///
/// Tracks usage with atomic counters and nothing else. Names are accepted
/// for compatibility with [`Guarded`](crate::Guarded) and dropped.
///
/// ```rust
/// # use guardalloc::{LockFree, MemAllocator, System};
/// let allocator = LockFree::new(System);
/// let block = allocator.allocate_aligned(64, 64, "cache line").unwrap();
/// assert_eq!(block.addr() % 64, 0);
/// unsafe { allocator.free(Some(block)).unwrap() };
/// ```
pub struct LockFree<P: Platform = System> {
    platform: P,
    usage: Usage,
    debug_fill: AtomicBool,
    config: Config,
    sink: Sink,
}

impl<P: Platform> LockFree<P> {
    /// Creates an allocator with the default [`Config`].
    pub fn new(platform: P) -> Self {
        Self::with_config(platform, Config::new())
    }

    /// Creates an allocator.
    pub fn with_config(platform: P, config: Config) -> Self {
        Self {
            platform,
            usage: Usage::new(),
            debug_fill: AtomicBool::new(config.debug_fill),
            config,
            sink: Sink::new(),
        }
    }

    /// The platform this allocator draws from.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// The configuration this allocator was created with.
    pub fn config(&self) -> Config {
        self.config
    }

    /// Current and peak usage. Per-name entries are never available.
    pub fn report(&self) -> Report {
        Report::summary(self.usage.current_bytes(), self.usage.peak_bytes())
    }

    fn out_of_memory(&self, len: usize, name: &str) -> Error {
        self.sink.emit(format_args!(
            "Malloc returns null: len={len} in {name}, total {}\n",
            self.usage.current_bytes()
        ));
        warn!("platform allocation of {len} bytes failed");
        Error::OutOfMemory
    }

    fn finish(&self, payload: NonNull<u8>, len: usize, zeroed: bool) -> Block<Self> {
        if !zeroed && self.debug_fill.load(Ordering::Relaxed) {
            unsafe { payload.as_ptr().write_bytes(ALLOC_POISON, len) };
        }
        self.usage.block_allocated(len);
        trace!("allocated {len} bytes at {payload:p}");
        unsafe { Block::from_raw(payload) }
    }

    fn allocate_plain(&self, len: usize, name: &str, zeroed: bool) -> Result<Block<Self>> {
        let Some((len, size)) =
            align_len(len).and_then(|len| Some((len, len.checked_add(HEAD_SIZE)?)))
        else {
            return Err(self.out_of_memory(len, name));
        };
        let memory = match zeroed {
            true => self.platform.allocate_zeroed(size),
            false => self.platform.allocate(size),
        };
        let Some(base) = memory else {
            return Err(self.out_of_memory(len, name));
        };
        let head = base.cast::<Head>();
        unsafe { head.as_ptr().write(Head { len }) };
        let payload = unsafe { NonNull::new_unchecked(base.as_ptr().add(HEAD_SIZE)) };
        Ok(self.finish(payload, len, zeroed))
    }

    fn allocate_in(&self, len: usize, envelope: Envelope, name: &str) -> Result<Block<Self>> {
        let Some((len, size)) =
            align_len(len).and_then(|len| Some((len, envelope.total(len, 0)?)))
        else {
            return Err(self.out_of_memory(len, name));
        };
        let Some(base) = self.platform.allocate_aligned(size, envelope.alignment()) else {
            return Err(self.out_of_memory(len, name));
        };
        let payload = unsafe {
            let header = envelope.header_of(base);
            header.cast::<HeadAligned>().as_ptr().write(HeadAligned {
                alignment: envelope.alignment() as u16,
                len: len | ALIGNED_FLAG,
            });
            NonNull::new_unchecked(header.as_ptr().add(HEAD_ALIGNED_SIZE))
        };
        Ok(self.finish(payload, len, false))
    }

    fn allocate_like(&self, header: Header, len: usize, name: &str) -> Result<Block<Self>> {
        match header.envelope {
            Some(envelope) => self.allocate_in(len, envelope, name),
            None => self.allocate_plain(len, name, false),
        }
    }

    /// # Safety
    /// `block` must be live and allocated by this allocator.
    unsafe fn move_block(
        &self,
        block: Block<Self>,
        len: usize,
        zeroed: bool,
    ) -> Result<Block<Self>> {
        let header = unsafe { Header::read(block.as_non_null()) };
        let new = self.allocate_like(header, len, UNNAMED_BLOCK)?;
        let new_len = unsafe { Header::read(new.as_non_null()) }.len;
        unsafe {
            core::ptr::copy_nonoverlapping(block.as_ptr(), new.as_ptr(), header.len.min(new_len));
            if zeroed && new_len > header.len {
                new.as_ptr()
                    .add(header.len)
                    .write_bytes(0, new_len - header.len);
            }
            self.free(Some(block))?;
        }
        Ok(new)
    }
}

impl<P: Platform> MemAllocator for LockFree<P> {
    fn allocate(&self, len: usize, name: &'static str) -> Result<Block<Self>> {
        self.allocate_plain(len, name, false)
    }

    fn allocate_zeroed(&self, len: usize, name: &'static str) -> Result<Block<Self>> {
        self.allocate_plain(len, name, true)
    }

    fn allocate_aligned(
        &self,
        len: usize,
        alignment: usize,
        name: &'static str,
    ) -> Result<Block<Self>> {
        match Envelope::new(alignment, ALIGNED_MALLOC_MIN_ALIGNMENT, HEAD_ALIGNED_SIZE) {
            Some(envelope) => self.allocate_in(len, envelope, name),
            None => {
                self.sink.emit(format_args!(
                    "Memoryblock {name}: {} (got {alignment})\n",
                    Error::InvalidAlignment
                ));
                warn!("rejected alignment {alignment} for {name}");
                Err(Error::InvalidAlignment)
            }
        }
    }

    unsafe fn reallocate(
        &self,
        block: Option<Block<Self>>,
        len: usize,
        name: &'static str,
    ) -> Result<Block<Self>> {
        match block {
            Some(block) => unsafe { self.move_block(block, len, false) },
            None => self.allocate(len, name),
        }
    }

    unsafe fn reallocate_zeroed(
        &self,
        block: Option<Block<Self>>,
        len: usize,
        name: &'static str,
    ) -> Result<Block<Self>> {
        match block {
            Some(block) => unsafe { self.move_block(block, len, true) },
            None => self.allocate_zeroed(len, name),
        }
    }

    unsafe fn duplicate(&self, block: Block<Self>) -> Result<Block<Self>> {
        let header = unsafe { Header::read(block.as_non_null()) };
        let copy = self.allocate_like(header, header.len, UNNAMED_BLOCK)?;
        unsafe { core::ptr::copy_nonoverlapping(block.as_ptr(), copy.as_ptr(), header.len) };
        Ok(copy)
    }

    unsafe fn free(&self, block: Option<Block<Self>>) -> Result<()> {
        let Some(block) = block else {
            self.sink.emit(format_args!("Attempt to free NULL pointer\n"));
            warn!("memory error: {}", Error::NullFree);
            if self.config.abort_on_error {
                error!("memory error with abort-on-error set, aborting");
                std::process::abort();
            }
            return Err(Error::NullFree);
        };
        let payload = block.as_non_null();
        let header = unsafe { Header::read(payload) };
        self.usage.block_freed(header.len);
        if self.debug_fill.load(Ordering::Relaxed) {
            unsafe { payload.as_ptr().write_bytes(FREE_POISON, header.len) };
        }
        let (base, size) = unsafe { header.base(payload) };
        match header.envelope {
            Some(envelope) => unsafe {
                self.platform
                    .deallocate_aligned(base, size, envelope.alignment())
            },
            None => unsafe { self.platform.deallocate(base, size) },
        }
        trace!("freed {} bytes at {payload:p}", header.len);
        Ok(())
    }

    unsafe fn allocation_len(&self, block: Option<Block<Self>>) -> usize {
        block.map_or(0, |block| unsafe { Header::read(block.as_non_null()) }.len)
    }

    unsafe fn name(&self, block: Option<Block<Self>>) -> Cow<'static, str> {
        match block {
            Some(_) => Cow::Borrowed(UNNAMED_BLOCK),
            None => Cow::Borrowed(crate::NULL_NAME),
        }
    }

    unsafe fn set_name(&self, _block: Block<Self>, _name: &'static str) {}

    fn current_bytes(&self) -> usize {
        self.usage.current_bytes()
    }

    fn peak_bytes(&self) -> usize {
        self.usage.peak_bytes()
    }

    fn block_count(&self) -> usize {
        self.usage.block_count()
    }

    fn reset_peak_bytes(&self) {
        self.usage.reset_peak()
    }

    fn consistency_check(&self) -> bool {
        true
    }

    fn for_each_block(&self, _f: &mut dyn FnMut(Block<Self>)) {}

    fn print_report(&self) {
        self.sink.emit(format_args!("{}", self.report()));
    }

    fn print_report_structured(&self) {
        self.sink
            .emit(format_args!("{}", StructuredReport::default()));
    }

    fn print_blocks(&self) {}

    fn sink(&self) -> &Sink {
        &self.sink
    }

    fn set_memory_debug(&self, enabled: bool) {
        self.debug_fill.store(enabled, Ordering::Relaxed);
    }

    fn report_leaks(&self) -> usize {
        let blocks = self.usage.block_count();
        if blocks > 0 {
            self.sink.emit(format_args!(
                "Error: Not freed memory blocks: {blocks}, total unfreed memory {:.6} MB\n",
                self.usage.current_bytes() as f64 / (1024.0 * 1024.0)
            ));
        }
        blocks
    }

    /// Does nothing: without a registry, late frees cannot be told apart.
    fn set_leak_detection_done(&self) {}
}

impl<P: Platform> Drop for LockFree<P> {
    fn drop(&mut self) {
        if self.usage.block_count() > 0 {
            self.report_leaks();
        }
    }
}

impl<P: Platform> Debug for LockFree<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockFree")
            .field("usage", &self.usage)
            .field("config", &self.config)
            .field("sink", &self.sink)
            .finish()
    }
}

unsafe impl<P: Platform + Send> Send for LockFree<P> {}
unsafe impl<P: Platform> Sync for LockFree<P> {}
