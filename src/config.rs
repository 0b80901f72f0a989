//! Allocator configuration.

/// Settings shared by both allocators.
///
/// The defaults come from cargo features: `abort-on-error` turns on
/// [`abort_on_error`](Config::abort_on_error) and `duplicate-names` turns on
/// [`duplicate_names`](Config::duplicate_names). Debug fill is off by default
/// and can also be toggled at runtime with
/// [`MemAllocator::set_memory_debug`](crate::MemAllocator::set_memory_debug).
///
/// ```rust
/// # use guardalloc::{Config, Guarded, System};
/// # use std::sync::Mutex;
/// let config = Config::new().debug_fill(true).duplicate_names(true);
/// let allocator = Guarded::<_, Mutex<()>>::with_config(System, config);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pub(crate) debug_fill: bool,
    pub(crate) abort_on_error: bool,
    pub(crate) duplicate_names: bool,
}
impl Config {
    /// The default configuration.
    pub const fn new() -> Self {
        Self {
            debug_fill: false,
            abort_on_error: cfg!(feature = "abort-on-error"),
            duplicate_names: cfg!(feature = "duplicate-names"),
        }
    }

    /// Fill new blocks with [`ALLOC_POISON`] and freed blocks with
    /// [`FREE_POISON`], so that reads of uninitialized or freed memory stand
    /// out.
    pub const fn debug_fill(mut self, enabled: bool) -> Self {
        self.debug_fill = enabled;
        self
    }

    /// Abort the process after reporting any memory error (double free,
    /// corruption, freeing an unknown or null pointer).
    pub const fn abort_on_error(mut self, enabled: bool) -> Self {
        self.abort_on_error = enabled;
        self
    }

    /// Copy block names onto the heap instead of borrowing them. The guarded
    /// allocator then owns every name and releases it with its block.
    pub const fn duplicate_names(mut self, enabled: bool) -> Self {
        self.duplicate_names = enabled;
        self
    }
}
impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// The byte written over new payloads when debug fill is on.
pub const ALLOC_POISON: u8 = 0xa1;

/// The byte written over payloads being freed when debug fill is on.
pub const FREE_POISON: u8 = 0xde;
