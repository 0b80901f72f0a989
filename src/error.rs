//! Error types used across the crate.
//!
//! Every recoverable failure is also written to the allocator's
//! [`Sink`](crate::sink::Sink) before it is returned, so callers that ignore
//! the error still leave a trace in the diagnostics. Integer overflow in array
//! allocations is not represented here: it aborts the process.

use core::fmt::Display;

/// [`core::result::Result`] with [`Error`] as the error type.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
/// An error returned from a function in this crate.
pub enum Error {
    /// The platform allocator could not satisfy the request, or the padded
    /// size of the request does not fit in a `usize`.
    OutOfMemory,
    /// The requested alignment was not a power of two, or too large to be
    /// stored in a block header.
    InvalidAlignment,
    /// Attempted to free a null block.
    NullFree,
    /// The pointer passed to `free` cannot have come from this allocator,
    /// because it is not aligned like a payload.
    IllegalPointer,
    /// The block was already freed.
    DoubleFree,
    /// The header tags of the block were overwritten. The block was removed
    /// from the registry if it could be found, but its memory was not
    /// released.
    CorruptHeader,
    /// The trailer tag after the payload was overwritten, which usually means
    /// a write past the end of the block.
    CorruptTrailer,
    /// The block could not be found among the live blocks.
    NotInRegistry,
    /// The process-wide allocator was already set up.
    AlreadyInitialized,
}
impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidAlignment => {
                write!(f, "the alignment was not a power of two below 1024")
            }
            Self::NullFree => write!(f, "attempt to free NULL pointer"),
            Self::IllegalPointer => write!(f, "attempt to free illegal pointer"),
            Self::DoubleFree => write!(f, "double free"),
            Self::CorruptHeader => write!(f, "error in header"),
            Self::CorruptTrailer => write!(f, "end corrupt"),
            Self::NotInRegistry => write!(f, "pointer not in memlist"),
            Self::AlreadyInitialized => write!(f, "the global allocator was already initialized"),
        }
    }
}
impl std::error::Error for Error {}
