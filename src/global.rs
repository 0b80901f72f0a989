//! The process-wide allocator.
//!
//! Code that does not thread an allocator through its call graph uses the one
//! returned by [`global`]. Which kind it is, is decided at build time: the
//! guarded allocator by default, the lock-free one with the `lockfree` cargo
//! feature. Both implement [`MemAllocator`], so callers do not change.
//!
//! The allocator is created on first use with the default [`Config`], unless
//! [`init`] ran first.

use std::sync::OnceLock;

use log::debug;

use crate::{Config, Error, MemAllocator, Result, System};

/// The allocator kind selected for this build.
#[cfg(not(feature = "lockfree"))]
pub type DefaultAllocator = crate::Guarded<System, std::sync::Mutex<()>>;

/// The allocator kind selected for this build.
#[cfg(feature = "lockfree")]
pub type DefaultAllocator = crate::LockFree<System>;

static GLOBAL: OnceLock<DefaultAllocator> = OnceLock::new();

/// Creates the process-wide allocator with `config`.
///
/// # Returns
/// [`Error::AlreadyInitialized`] if the allocator was already created, by an
/// earlier call or by a call to [`global`].
pub fn init(config: Config) -> Result<&'static DefaultAllocator> {
    let mut created = false;
    let allocator = GLOBAL.get_or_init(|| {
        created = true;
        DefaultAllocator::with_config(System, config)
    });
    if !created {
        return Err(Error::AlreadyInitialized);
    }
    debug!("global allocator initialized with {config:?}");
    Ok(allocator)
}

/// The process-wide allocator.
pub fn global() -> &'static DefaultAllocator {
    GLOBAL.get_or_init(|| DefaultAllocator::new(System))
}

/// Ends the process-wide allocator's lifetime: writes a leak report and
/// flags any later frees.
///
/// The allocator itself lives until the process exits, so blocks can still
/// be freed after this call.
///
/// # Returns
/// The number of blocks still live.
pub fn shutdown() -> usize {
    let allocator = global();
    let leaked = allocator.report_leaks();
    allocator.set_leak_detection_done();
    leaked
}
