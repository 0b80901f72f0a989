//! The guarded allocator.
//!
//! Every payload is wrapped in a [`MemHead`] and a trailer tag, and every live
//! block sits in a registry linked through those headers. This costs a lock
//! and about 80 bytes per block, and buys detection of double frees, buffer
//! overruns, header corruption and frees of pointers that never came from the
//! allocator, plus per-name usage reports and leak listings.
//!
//! # Freeing
//! [`free`](crate::MemAllocator::free) checks a block before releasing it:
//! 1. `None` is reported as [`Error::NullFree`].
//! 2. A pointer that is not 8-byte aligned cannot be a payload, and is
//!    reported as [`Error::IllegalPointer`] without being read.
//! 3. A block whose tags read `FREE` is reported as [`Error::DoubleFree`].
//! 4. A block with intact header tags and a corrupt trailer is reported as
//!    [`Error::CorruptTrailer`].
//! 5. Anything else with bad header tags is looked up in the registry: if it
//!    is not found the error is [`Error::NotInRegistry`], otherwise
//!    [`Error::CorruptHeader`].
//!
//! In cases 4 and 5 the corrupt block is unlinked from the registry if it can
//! be found, so the remaining blocks stay walkable. Its memory is never
//! released, since nothing in it can be trusted. Once it is unlinked the block
//! and byte counts are taken again from the registry, so they describe the
//! blocks that are still listed.
//!
//! Only the tags of a header are read before it has been checked. The name of
//! a block with a corrupt header comes from its predecessor's cached copy.

use core::{cell::UnsafeCell, fmt::Debug, ptr::NonNull};
use std::borrow::Cow;

use log::{error, trace, warn};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{
    layout::{align_len, Envelope, GUARDED_MIN_ALIGNMENT, MALLOC_ALIGNMENT},
    Block, BlockList, BlockRecord, Config, Error, Lock, MemAllocator, Platform, Report, Result,
    Sink, StructuredReport, System, ALLOC_POISON, FREE_POISON,
};

use self::{
    head::{MemHead, Name, HEAD_SIZE, MEMFREE, MEMTAG3, TAIL_SIZE},
    registry::{Recovery, Registry},
};

mod head;
mod registry;

/// Placeholder for names that cannot be read.
const UNKNOWN_NAME: &str = "free";

/// State only touched with the lock held.
struct Inner {
    registry: Registry,
    peak: usize,
}

/// How the platform is asked for memory.
#[derive(Clone, Copy)]
enum Path {
    Plain,
    Zeroed,
    Aligned(Envelope),
}
impl Path {
    fn envelope(self) -> Option<Envelope> {
        match self {
            Self::Aligned(envelope) => Some(envelope),
            _ => None,
        }
    }
}

/// The platform size of a block with a payload of `len` bytes.
fn block_size(len: usize, envelope: Option<Envelope>) -> Option<usize> {
    match envelope {
        Some(envelope) => envelope.total(len, TAIL_SIZE),
        None => (HEAD_SIZE + TAIL_SIZE).checked_add(len),
    }
}

/// A guarded allocator.
///
/// # Usage
/// ```rust
/// # use guardalloc::{Guarded, MemAllocator, System};
/// # use std::sync::Mutex;
/// let allocator = Guarded::<_, Mutex<()>>::new(System);
/// let block = allocator.allocate(100, "vertex buffer").unwrap();
/// assert_eq!(allocator.current_bytes(), 100);
/// unsafe { allocator.free(Some(block)).unwrap() };
/// assert_eq!(allocator.block_count(), 0);
/// ```
///
/// # Type parameters
/// - `P`: the [`Platform`] that provides the memory.
/// - `L`: the [`Lock`] that guards the registry.
///
/// # Dropping
/// Dropping the allocator writes a leak report for any blocks that are still
/// live, then releases them.
pub struct Guarded<P: Platform = System, L: Lock = std::sync::Mutex<()>> {
    platform: P,
    lock: L,
    inner: UnsafeCell<Inner>,
    blocks: AtomicUsize,
    bytes: AtomicUsize,
    debug_fill: AtomicBool,
    leak_detection_done: AtomicBool,
    config: Config,
    sink: Sink,
}

impl<P: Platform, L: Lock> Guarded<P, L> {
    /// Creates an allocator with the default [`Config`].
    pub fn new(platform: P) -> Self {
        Self::with_config(platform, Config::new())
    }

    /// Creates an allocator.
    pub fn with_config(platform: P, config: Config) -> Self {
        Self {
            platform,
            lock: L::default(),
            inner: UnsafeCell::new(Inner {
                registry: Registry::EMPTY,
                peak: 0,
            }),
            blocks: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            debug_fill: AtomicBool::new(config.debug_fill),
            leak_detection_done: AtomicBool::new(false),
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

    fn make_name(&self, name: &'static str) -> (Name, bool) {
        if self.config.duplicate_names {
            (Name::owned(name), true)
        } else {
            (Name::borrowed(name), false)
        }
    }

    /// Allocates a block and links it into the registry. An owned `name` is
    /// released if the allocation fails.
    fn allocate_block(
        &self,
        len: usize,
        name: Name,
        name_owned: bool,
        path: Path,
    ) -> Result<Block<Self>> {
        let size = align_len(len).and_then(|len| Some((len, block_size(len, path.envelope())?)));
        let memory = size.and_then(|(_, size)| match path {
            Path::Plain => self.platform.allocate(size),
            Path::Zeroed => self.platform.allocate_zeroed(size),
            Path::Aligned(envelope) => self.platform.allocate_aligned(size, envelope.alignment()),
        });
        let (Some((len, _)), Some(base)) = (size, memory) else {
            self.sink.emit(format_args!(
                "Malloc returns null: len={len} in {}, total {}\n",
                unsafe { name.as_str() },
                self.bytes.load(Ordering::Relaxed)
            ));
            warn!("platform allocation of {len} bytes failed");
            if name_owned {
                unsafe { name.release() };
            }
            return Err(Error::OutOfMemory);
        };

        let (head, alignment) = match path {
            Path::Aligned(envelope) => (
                unsafe { envelope.header_of(base) }.cast::<MemHead>(),
                envelope.alignment() as u16,
            ),
            _ => (base.cast::<MemHead>(), 0),
        };
        let payload = unsafe {
            head.as_ptr()
                .write(MemHead::new(len, name, name_owned, alignment));
            MemHead::write_tail(head, MEMTAG3);
            MemHead::payload(head)
        };
        if !matches!(path, Path::Zeroed) && self.debug_fill.load(Ordering::Relaxed) {
            unsafe { payload.as_ptr().write_bytes(ALLOC_POISON, len) };
        }

        let guard = self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        unsafe { inner.registry.push_back(head) };
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len, Ordering::Relaxed);
        inner.peak = inner.peak.max(self.bytes.load(Ordering::Relaxed));
        drop(guard);

        trace!("allocated {len} bytes at {payload:p}");
        Ok(unsafe { Block::from_raw(payload) })
    }

    /// Hands a block that was unlinked from the registry back to the platform.
    ///
    /// # Safety
    /// `head` must be a valid, unlinked header that nothing else references.
    unsafe fn release(&self, head: NonNull<MemHead>) {
        let head_ref = unsafe { head.as_ref() };
        let len = head_ref.len;
        let envelope = head_ref.envelope();
        if head_ref.has_owned_name() {
            unsafe { head_ref.name.release() };
        }
        if self.debug_fill.load(Ordering::Relaxed) {
            unsafe { MemHead::payload(head).as_ptr().write_bytes(FREE_POISON, len) };
        }
        let Some(size) = block_size(len, envelope) else {
            return;
        };
        match envelope {
            Some(envelope) => unsafe {
                let base = envelope.real_base(head.cast());
                self.platform
                    .deallocate_aligned(base, size, envelope.alignment())
            },
            None => unsafe { self.platform.deallocate(head.cast(), size) },
        }
    }

    /// Writes diagnostic lines, then aborts if configured to.
    fn fail(&self, error: Error, lines: &[String]) -> Error {
        for line in lines {
            self.sink.emit(format_args!("{line}"));
        }
        warn!("memory error: {error}");
        if self.config.abort_on_error {
            error!("memory error with abort-on-error set, aborting");
            std::process::abort();
        }
        error
    }

    fn allocation_path(alignment: usize) -> Option<Path> {
        Envelope::new(alignment, GUARDED_MIN_ALIGNMENT, HEAD_SIZE).map(Path::Aligned)
    }

    /// Runs recovery on a block that failed its checks, and collects the
    /// diagnostics for it.
    ///
    /// # Safety
    /// The lock must be held.
    unsafe fn recover(
        &self,
        head: NonNull<MemHead>,
        own_name: Option<&str>,
        lines: &mut Vec<String>,
    ) -> Recovery {
        let inner = unsafe { &mut *self.inner.get() };
        let recovery = unsafe { inner.registry.recover(head) };
        match &recovery {
            Recovery::Spliced(name) => {
                // exactly one block was corrupt, and it is gone
                let (blocks, bytes) = unsafe { inner.registry.iter() }
                    .fold((0, 0), |(blocks, bytes), head| {
                        (blocks + 1, bytes + unsafe { head.as_ref() }.len)
                    });
                self.blocks.store(blocks, Ordering::Relaxed);
                self.bytes.store(bytes, Ordering::Relaxed);
                let name = name.map(|name| unsafe { name.as_str() });
                if let (Some(name), Some(own_name)) = (name, own_name) {
                    if name != own_name {
                        lines.push(format!("Memoryblock {name}: is also corrupt\n"));
                    }
                }
            }
            Recovery::OtherCorrupt(name) => {
                let name = name.map_or(UNKNOWN_NAME, |name| unsafe { name.as_str() });
                lines.push(format!("Memoryblock {name}: additional error in header\n"));
            }
            Recovery::MultipleCorrupt => {
                lines.push(format!(
                    "Memoryblock {UNKNOWN_NAME}: MORE THAN 1 MEMORYBLOCK CORRUPT\n"
                ));
            }
            Recovery::Missing => {}
        }
        recovery
    }

    /// Snapshots every live block whose header is intact.
    fn records(&self) -> Vec<BlockRecord> {
        let guard = self.lock.lock();
        let inner = unsafe { &*self.inner.get() };
        let records = unsafe { inner.registry.intact_blocks() }
            .into_iter()
            .map(|head| {
                let head_ref = unsafe { head.as_ref() };
                BlockRecord {
                    name: unsafe { head_ref.name.as_str() }.to_owned(),
                    len: head_ref.len,
                    addr: unsafe { MemHead::payload(head) }.as_ptr() as usize,
                }
            })
            .collect();
        drop(guard);
        records
    }
}

impl<P: Platform, L: Lock + Sync> Guarded<P, L> {
    /// Usage per block name.
    pub fn report(&self) -> Report {
        let records = self.records();
        Report::aggregate(self.current_bytes(), self.peak_bytes(), &records)
    }

    /// A script-parseable dump of every live block.
    pub fn structured_report(&self) -> StructuredReport {
        StructuredReport::new(self.records())
    }

    /// One line per live block.
    pub fn block_list(&self) -> BlockList {
        BlockList::new(self.records())
    }

    /// Copies a block into a new one that takes over its name and alignment.
    ///
    /// Once the copy exists it is returned, even if freeing the old block
    /// reports corruption. A block whose header is corrupt cannot be copied,
    /// and is handed to [`free`](MemAllocator::free) to be reported.
    ///
    /// # Safety
    /// `block` must be live and allocated by this allocator.
    unsafe fn move_block(
        &self,
        block: Block<Self>,
        len: usize,
        zeroed: bool,
    ) -> Result<Block<Self>> {
        let head = unsafe { MemHead::from_payload(block.as_non_null()) };

        let guard = self.lock.lock();
        let head_ref = unsafe { head.as_ref() };
        if !head_ref.is_valid() {
            drop(guard);
            return match unsafe { self.free(Some(block)) } {
                Err(error) => Err(error),
                Ok(()) => Err(Error::CorruptHeader),
            };
        }
        let old_len = head_ref.len;
        let path = head_ref.envelope().map_or(Path::Plain, Path::Aligned);
        let (name, owned) = if head_ref.has_owned_name() {
            (Name::owned(unsafe { head_ref.name.as_str() }), true)
        } else {
            (head_ref.name, false)
        };
        drop(guard);

        let new = self.allocate_block(len, name, owned, path)?;
        let new_len = unsafe { MemHead::from_payload(new.as_non_null()).as_ref() }.len;
        unsafe {
            core::ptr::copy_nonoverlapping(block.as_ptr(), new.as_ptr(), old_len.min(new_len));
            if zeroed && new_len > old_len {
                new.as_ptr().add(old_len).write_bytes(0, new_len - old_len);
            }
        }
        if let Err(error) = unsafe { self.free(Some(block)) } {
            warn!("kept the copy of a block that failed to free: {error}");
        }
        Ok(new)
    }
}

impl<P: Platform, L: Lock + Sync> MemAllocator for Guarded<P, L> {
    fn allocate(&self, len: usize, name: &'static str) -> Result<Block<Self>> {
        let (name, owned) = self.make_name(name);
        self.allocate_block(len, name, owned, Path::Plain)
    }

    fn allocate_zeroed(&self, len: usize, name: &'static str) -> Result<Block<Self>> {
        let (name, owned) = self.make_name(name);
        self.allocate_block(len, name, owned, Path::Zeroed)
    }

    fn allocate_aligned(
        &self,
        len: usize,
        alignment: usize,
        name: &'static str,
    ) -> Result<Block<Self>> {
        let Some(path) = Self::allocation_path(alignment) else {
            self.sink.emit(format_args!(
                "Memoryblock {name}: {} (got {alignment})\n",
                Error::InvalidAlignment
            ));
            warn!("rejected alignment {alignment} for {name}");
            return Err(Error::InvalidAlignment);
        };
        let (name, owned) = self.make_name(name);
        self.allocate_block(len, name, owned, path)
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
        let head = unsafe { MemHead::from_payload(block.as_non_null()) };

        let guard = self.lock.lock();
        let head_ref = unsafe { head.as_ref() };
        if !head_ref.is_valid() {
            drop(guard);
            let line = format!("Memoryblock {UNKNOWN_NAME}: {}\n", Error::CorruptHeader);
            return Err(self.fail(Error::CorruptHeader, &[line]));
        }
        let len = head_ref.len;
        let path = head_ref.envelope().map_or(Path::Plain, Path::Aligned);
        let name = Name::owned(&format!("dupli_alloc {}", unsafe { head_ref.name.as_str() }));
        drop(guard);

        let copy = self.allocate_block(len, name, true, path)?;
        unsafe { core::ptr::copy_nonoverlapping(block.as_ptr(), copy.as_ptr(), len) };
        Ok(copy)
    }

    unsafe fn free(&self, block: Option<Block<Self>>) -> Result<()> {
        let Some(block) = block else {
            let line = format!("Memoryblock {UNKNOWN_NAME}: {}\n", Error::NullFree);
            return Err(self.fail(Error::NullFree, &[line]));
        };
        if block.addr() % MALLOC_ALIGNMENT != 0 {
            let line = format!("Memoryblock {UNKNOWN_NAME}: {}\n", Error::IllegalPointer);
            return Err(self.fail(Error::IllegalPointer, &[line]));
        }
        let head = unsafe { MemHead::from_payload(block.as_non_null()) };
        let mut lines = Vec::new();

        let guard = self.lock.lock();
        let (freed, intact) = {
            let head_ref = unsafe { head.as_ref() };
            (head_ref.is_freed(), head_ref.is_valid())
        };
        let name = unsafe { head.as_ref() }.name;
        let label = if (freed || intact) && !name.is_none() {
            unsafe { name.as_str() }
        } else {
            UNKNOWN_NAME
        };

        if freed {
            lines.push(format!("Memoryblock {label}: {}\n", Error::DoubleFree));
            drop(guard);
            return Err(self.fail(Error::DoubleFree, &lines));
        }

        if intact && unsafe { MemHead::tail_intact(head) } {
            if self.leak_detection_done.load(Ordering::Relaxed) {
                lines.push(format!(
                    "Freeing memory after the leak detector has run: {label}\n"
                ));
            }
            let len = unsafe { head.as_ref() }.len;
            let inner = unsafe { &mut *self.inner.get() };
            unsafe { inner.registry.remove(head) };
            self.blocks.fetch_sub(1, Ordering::Relaxed);
            self.bytes.fetch_sub(len, Ordering::Relaxed);
            let owned_name = unsafe {
                let head_mut = &mut *head.as_ptr();
                head_mut.tag1 = MEMFREE;
                head_mut.tag2 = MEMFREE;
                let owned_name = head_mut.has_owned_name().then_some(head_mut.name);
                if owned_name.is_some() {
                    head_mut.name = Name::NONE;
                    head_mut.name_owned = 0;
                }
                MemHead::write_tail(head, MEMFREE);
                owned_name
            };
            drop(guard);

            for line in &lines {
                self.sink.emit(format_args!("{line}"));
                warn!("block freed after leak detection");
            }
            if let Some(name) = owned_name {
                unsafe { name.release() };
            }
            unsafe { self.release(head) };
            trace!("freed {len} bytes at {block:p}");
            return Ok(());
        }

        if intact {
            lines.push(format!("Memoryblock {label}: {}\n", Error::CorruptTrailer));
            let label = label.to_owned();
            unsafe { self.recover(head, Some(&label), &mut lines) };
            drop(guard);
            return Err(self.fail(Error::CorruptTrailer, &lines));
        }

        let mut recovered = Vec::new();
        let (error, label) = match unsafe { self.recover(head, None, &mut recovered) } {
            Recovery::Missing => (Error::NotInRegistry, UNKNOWN_NAME),
            Recovery::Spliced(Some(name)) => (Error::CorruptHeader, unsafe { name.as_str() }),
            _ => (Error::CorruptHeader, UNKNOWN_NAME),
        };
        lines.push(format!("Memoryblock {label}: {error}\n"));
        lines.append(&mut recovered);
        drop(guard);
        Err(self.fail(error, &lines))
    }

    unsafe fn allocation_len(&self, block: Option<Block<Self>>) -> usize {
        block.map_or(0, |block| unsafe {
            MemHead::from_payload(block.as_non_null()).as_ref().len
        })
    }

    unsafe fn name(&self, block: Option<Block<Self>>) -> Cow<'static, str> {
        let Some(block) = block else {
            return Cow::Borrowed(crate::NULL_NAME);
        };
        let head = unsafe { MemHead::from_payload(block.as_non_null()) };
        let guard = self.lock.lock();
        let head_ref = unsafe { head.as_ref() };
        let name = if head_ref.has_owned_name() {
            Cow::Owned(unsafe { head_ref.name.as_str() }.to_owned())
        } else {
            let name: &'static str = unsafe { head_ref.name.as_str() };
            Cow::Borrowed(name)
        };
        drop(guard);
        name
    }

    unsafe fn set_name(&self, block: Block<Self>, name: &'static str) {
        let head = unsafe { MemHead::from_payload(block.as_non_null()) };
        let (name, owned) = self.make_name(name);

        let guard = self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let head_mut = unsafe { &mut *head.as_ptr() };
        let old = head_mut.has_owned_name().then_some(head_mut.name);
        unsafe { inner.registry.rename(head, name) };
        head_mut.name_owned = owned as u8;
        drop(guard);

        if let Some(old) = old {
            unsafe { old.release() };
        }
    }

    fn current_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    fn peak_bytes(&self) -> usize {
        let guard = self.lock.lock();
        let peak = unsafe { &*self.inner.get() }.peak;
        drop(guard);
        peak
    }

    fn block_count(&self) -> usize {
        self.blocks.load(Ordering::Relaxed)
    }

    fn reset_peak_bytes(&self) {
        let guard = self.lock.lock();
        unsafe { &mut *self.inner.get() }.peak = self.bytes.load(Ordering::Relaxed);
        drop(guard);
    }

    fn consistency_check(&self) -> bool {
        let guard = self.lock.lock();
        let consistent = unsafe { (*self.inner.get()).registry.is_consistent() };
        drop(guard);
        if !consistent {
            warn!("registry consistency check failed");
        }
        consistent
    }

    fn for_each_block(&self, f: &mut dyn FnMut(Block<Self>)) {
        let guard = self.lock.lock();
        let inner = unsafe { &*self.inner.get() };
        for head in unsafe { inner.registry.intact_blocks() } {
            f(unsafe { Block::from_raw(MemHead::payload(head)) });
        }
        drop(guard);
    }

    fn print_report(&self) {
        self.sink.emit(format_args!("{}", self.report()));
    }

    fn print_report_structured(&self) {
        self.sink.emit(format_args!("{}", self.structured_report()));
    }

    fn print_blocks(&self) {
        self.sink.emit(format_args!("{}", self.block_list()));
    }

    fn sink(&self) -> &Sink {
        &self.sink
    }

    fn set_memory_debug(&self, enabled: bool) {
        self.debug_fill.store(enabled, Ordering::Relaxed);
    }

    fn report_leaks(&self) -> usize {
        let blocks = self.block_count();
        if blocks > 0 {
            self.sink.emit(format_args!(
                "Error: Not freed memory blocks: {blocks}, total unfreed memory {:.6} MB\n",
                self.current_bytes() as f64 / (1024.0 * 1024.0)
            ));
            self.print_blocks();
        }
        blocks
    }

    fn set_leak_detection_done(&self) {
        self.leak_detection_done.store(true, Ordering::Relaxed);
    }
}

impl<P: Platform, L: Lock> Drop for Guarded<P, L> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.registry.is_empty() {
            return;
        }
        let live = unsafe { inner.registry.intact_blocks() };
        if live.is_empty() {
            return;
        }
        let bytes: usize = live.iter().map(|head| unsafe { head.as_ref() }.len).sum();
        self.sink.emit(format_args!(
            "Error: Not freed memory blocks: {}, total unfreed memory {:.6} MB\n",
            live.len(),
            bytes as f64 / (1024.0 * 1024.0)
        ));
        for &head in &live {
            let head_ref = unsafe { head.as_ref() };
            self.sink.emit(format_args!(
                "{} len: {} {:p}\n",
                unsafe { head_ref.name.as_str() },
                head_ref.len,
                unsafe { MemHead::payload(head) }
            ));
        }
        for head in live {
            unsafe { self.release(head) };
        }
        self.inner.get_mut().registry = Registry::EMPTY;
    }
}

impl<P: Platform, L: Lock> Debug for Guarded<P, L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Guarded")
            .field("blocks", &self.blocks.load(Ordering::Relaxed))
            .field("bytes", &self.bytes.load(Ordering::Relaxed))
            .field("config", &self.config)
            .field("sink", &self.sink)
            .finish()
    }
}

unsafe impl<P: Platform + Send, L: Lock + Send> Send for Guarded<P, L> {}
unsafe impl<P: Platform, L: Lock + Sync> Sync for Guarded<P, L> {}
