//! Size and placement arithmetic shared by both allocators.
//!
//! Every block is laid out as `[padding][header][payload][tail]`. Plain blocks
//! have no padding. Aligned blocks get just enough padding that the payload,
//! which follows a header of arbitrary size, starts on the requested boundary.
//! The padding is a pure function of the alignment and the header size, so the
//! real base of the block can be recovered from the header alone.

use core::ptr::NonNull;

/// Payload lengths are always rounded up to a multiple of this value. This
/// keeps the trailer of guarded blocks 4-byte aligned and frees the low bit
/// of lock-free lengths for the aligned flag.
pub const LEN_GRANULE: usize = 4;

/// The alignment of memory returned by a platform's plain allocation path.
pub const MALLOC_ALIGNMENT: usize = 8;

/// Guarded aligned allocations are never aligned to less than this.
pub const GUARDED_MIN_ALIGNMENT: usize = 8;

/// Lock-free aligned allocations are never aligned to less than this.
pub const ALIGNED_MALLOC_MIN_ALIGNMENT: usize = core::mem::size_of::<*const ()>();

/// Alignments at or above this value cannot be stored in a block header.
pub const ALIGNMENT_LIMIT: usize = 1024;

/// Rounds a payload length up to [`LEN_GRANULE`].
///
/// Returns `None` if the rounded length does not fit in a `usize`.
pub const fn align_len(len: usize) -> Option<usize> {
    match len.checked_add(LEN_GRANULE - 1) {
        Some(len) => Some(len & !(LEN_GRANULE - 1)),
        None => None,
    }
}

/// The byte length of `count` elements of `size` bytes, or `None` on overflow.
pub const fn array_len(count: usize, size: usize) -> Option<usize> {
    count.checked_mul(size)
}

/// The number of bytes to place before a header of `header` bytes so that the
/// byte following it is aligned to `alignment`, given a base that is itself
/// aligned to `alignment`.
///
/// `alignment` must be a power of two.
pub const fn padding(alignment: usize, header: usize) -> usize {
    (alignment - header % alignment) % alignment
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The placement of an aligned block.
///
/// # Usage
/// Build one with [`Envelope::new`], allocate [`Envelope::total`] bytes
/// aligned to [`Envelope::alignment`], then find the header with
/// [`Envelope::header_of`]. On free, rebuild the envelope from the alignment
/// stored in the header and call [`Envelope::real_base`] to get back the
/// pointer the platform handed out.
pub struct Envelope {
    alignment: usize,
    header: usize,
    padding: usize,
}
impl Envelope {
    /// Computes the envelope for a header of `header` bytes and a requested
    /// alignment.
    ///
    /// The alignment must be a power of two below [`ALIGNMENT_LIMIT`],
    /// otherwise this function returns `None`. Alignments below `minimum` are
    /// raised to it; the raised value is the one reported by
    /// [`alignment`](Envelope::alignment) and the one to store.
    pub const fn new(alignment: usize, minimum: usize, header: usize) -> Option<Self> {
        if !alignment.is_power_of_two() || alignment >= ALIGNMENT_LIMIT {
            return None;
        }
        let alignment = if alignment < minimum {
            minimum
        } else {
            alignment
        };
        Some(Self {
            alignment,
            header,
            padding: padding(alignment, header),
        })
    }

    /// The (clamped) alignment of the payload.
    pub const fn alignment(&self) -> usize {
        self.alignment
    }

    /// The number of bytes before the header.
    pub const fn padding(&self) -> usize {
        self.padding
    }

    /// The size to request from the platform for `len` payload bytes and a
    /// trailer of `tail` bytes, or `None` on overflow.
    pub const fn total(&self, len: usize, tail: usize) -> Option<usize> {
        match (self.padding + self.header + tail).checked_add(len) {
            Some(total) => Some(total),
            None => None,
        }
    }

    /// The location of the header inside a block starting at `base`.
    ///
    /// # Safety
    /// `base` must point to an allocation of at least
    /// [`total`](Envelope::total) bytes.
    pub unsafe fn header_of(&self, base: NonNull<u8>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(base.as_ptr().add(self.padding)) }
    }

    /// The base of the block whose header is at `header`. This is the exact
    /// inverse of [`header_of`](Envelope::header_of).
    ///
    /// # Safety
    /// `header` must have been obtained from [`header_of`](Envelope::header_of)
    /// on an envelope with the same alignment and header size.
    pub unsafe fn real_base(&self, header: NonNull<u8>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(header.as_ptr().sub(self.padding)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_lengths_to_granule() {
        assert_eq!(align_len(0), Some(0));
        assert_eq!(align_len(1), Some(4));
        assert_eq!(align_len(4), Some(4));
        assert_eq!(align_len(101), Some(104));
        assert_eq!(align_len(usize::MAX), None);
        assert_eq!(align_len(usize::MAX - 3), Some(usize::MAX - 3));
    }

    #[test]
    fn array_len_detects_overflow() {
        assert_eq!(array_len(16, 4), Some(64));
        assert_eq!(array_len(0, usize::MAX), Some(0));
        assert_eq!(array_len(usize::MAX / 2 + 1, 2), None);
    }

    #[test]
    fn payload_lands_on_boundary() {
        for header in [8, 16, 24, 56, 72, 80] {
            let mut alignment = 1;
            while alignment < ALIGNMENT_LIMIT {
                let envelope = Envelope::new(alignment, GUARDED_MIN_ALIGNMENT, header).unwrap();
                let base = envelope.alignment() * 3;
                let payload = base + envelope.padding() + header;
                assert_eq!(payload % envelope.alignment(), 0, "{envelope:?}");
                assert!(envelope.padding() < envelope.alignment());
                alignment *= 2;
            }
        }
    }

    #[test]
    fn real_base_inverts_header_of() {
        let envelope = Envelope::new(64, GUARDED_MIN_ALIGNMENT, 72).unwrap();
        let mut storage = [0u8; 256];
        let base = NonNull::new(storage.as_mut_ptr()).unwrap();
        unsafe {
            let header = envelope.header_of(base);
            assert_eq!(header.as_ptr() as usize - base.as_ptr() as usize, 56);
            assert_eq!(envelope.real_base(header), base);
        }
    }

    #[test]
    fn clamps_small_alignments() {
        let envelope = Envelope::new(2, GUARDED_MIN_ALIGNMENT, 72).unwrap();
        assert_eq!(envelope.alignment(), 8);
        assert_eq!(envelope.padding(), 0);
    }

    #[test]
    fn rejects_invalid_alignments() {
        assert_eq!(Envelope::new(0, 8, 72), None);
        assert_eq!(Envelope::new(24, 8, 72), None);
        assert_eq!(Envelope::new(ALIGNMENT_LIMIT, 8, 72), None);
        assert!(Envelope::new(ALIGNMENT_LIMIT / 2, 8, 72).is_some());
    }

    #[test]
    fn total_checks_overflow() {
        let envelope = Envelope::new(16, 8, 72).unwrap();
        assert_eq!(envelope.total(100, 8), Some(8 + 72 + 100 + 8));
        assert_eq!(envelope.total(usize::MAX, 8), None);
    }
}
