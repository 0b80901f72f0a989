//! Leak detection at teardown.

use log::{info, warn};

use crate::MemAllocator;

/// Reports the blocks still live in an allocator when it goes out of scope.
///
/// Create one at the start of `main`, after the allocator. When it is dropped
/// it writes a leak report to the allocator's sink and marks leak detection as
/// done, so that frees running later (from other statics, for instance) are
/// flagged instead of silently shrinking a count that was already reported.
///
/// ```rust,no_run
/// # use guardalloc::{global, LeakDetector, MemAllocator};
/// let _leaks = LeakDetector::new(global::global()).fail_on_leak(true);
/// let block = global::global().allocate(16, "scratch").unwrap();
/// unsafe { global::global().free(Some(block)).unwrap() };
/// ```
#[derive(Debug)]
pub struct LeakDetector<A: MemAllocator + 'static> {
    allocator: &'static A,
    fail_on_leak: bool,
}
impl<A: MemAllocator + 'static> LeakDetector<A> {
    /// Watches `allocator`.
    pub fn new(allocator: &'static A) -> Self {
        Self {
            allocator,
            fail_on_leak: false,
        }
    }

    /// Exit the process with status 1 if any block leaked.
    pub fn fail_on_leak(mut self, fail: bool) -> Self {
        self.fail_on_leak = fail;
        self
    }

    /// Runs the leak report now, as the drop would.
    ///
    /// # Returns
    /// The number of leaked blocks.
    pub fn check(&self) -> usize {
        let leaked = self.allocator.report_leaks();
        self.allocator.set_leak_detection_done();
        if leaked > 0 {
            warn!("{leaked} blocks leaked");
        } else {
            info!("no blocks leaked");
        }
        leaked
    }
}
impl<A: MemAllocator + 'static> Drop for LeakDetector<A> {
    fn drop(&mut self) {
        if self.check() > 0 && self.fail_on_leak {
            std::process::exit(1);
        }
    }
}
