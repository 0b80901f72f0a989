//! The lock around the guarded allocator's registry.
//!
//! Every registry edit, tag flip and walk of the guarded allocator happens
//! with one lock held. That lock is a type parameter of
//! [`Guarded`](crate::Guarded) rather than a fixed mutex because the allocator
//! usually sits under code that already has opinions about locking: a host
//! with its own mutex type (one that records contention, or that is
//! priority-aware) can guard the registry with it, and a host that cannot
//! block can use a spin lock. The lock holds no data; the allocator keeps its
//! state next to it and only touches it while a guard is alive.
//!
//! # Provided locks
//! - [`std::sync::Mutex<()>`], the default. Poisoning is ignored, since no
//!   registry edit can panic partway through.
//! - `spin::Mutex<()>` with the `spin` feature. Spinning wastes time under
//!   contention
//!   ([spinlocks considered harmful](https://matklad.github.io/2020/01/02/spinlocks-considered-harmful.html)),
//!   so only use it where blocking is not an option.

#[cfg(feature = "spin")]
use spin::Mutex;

/// A lock that can guard a registry.
///
/// Implement it for a mutex over `()`; the guard only marks the critical
/// section.
///
/// # Safety
/// Only one guard may be alive at a time, like a mutex. Locking must not
/// allocate through the allocator being guarded, which would deadlock on its
/// own registry.
pub unsafe trait Lock: Default {
    /// Held for the length of a critical section; dropping it unlocks.
    type Guard<'a>
    where
        Self: 'a;

    /// Blocks (or spins) until the lock is free, then takes it.
    fn lock(&self) -> Self::Guard<'_>;
}

#[cfg(feature = "spin")]
unsafe impl Lock for Mutex<()> {
    type Guard<'a> = spin::MutexGuard<'a, ()>;

    fn lock(&self) -> Self::Guard<'_> {
        self.lock()
    }
}

unsafe impl Lock for std::sync::Mutex<()> {
    type Guard<'a> = std::sync::MutexGuard<'a, ()>;

    fn lock(&self) -> Self::Guard<'_> {
        // no data behind the mutex, so poison carries no meaning
        self.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
