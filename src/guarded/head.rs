use core::{fmt::Debug, mem::size_of, ptr::NonNull};

use crate::layout::{Envelope, GUARDED_MIN_ALIGNMENT, LEN_GRANULE};

/// Builds a tag from four ASCII bytes, first byte lowest.
pub const fn make_id(id: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*id)
}

/// First header tag of a live block.
pub const MEMTAG1: u32 = make_id(b"MEMO");
/// Second header tag of a live block.
pub const MEMTAG2: u32 = make_id(b"BLOC");
/// Trailer tag of a live block.
pub const MEMTAG3: u32 = make_id(b"KEND");
/// Written over all three tags when a block is freed.
pub const MEMFREE: u32 = make_id(b"FREE");

pub const HEAD_SIZE: usize = size_of::<MemHead>();
pub const TAIL_SIZE: usize = size_of::<MemTail>();

const _: () = assert!(HEAD_SIZE % GUARDED_MIN_ALIGNMENT == 0);

/// A block name. Either borrowed from a `&'static str`, or an owned heap copy;
/// which one is recorded in the header, not here, since `next_name` copies are
/// never owned.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Name {
    ptr: *const u8,
    len: usize,
}
impl Name {
    pub const NONE: Self = Self {
        ptr: core::ptr::null(),
        len: 0,
    };

    pub fn borrowed(name: &'static str) -> Self {
        Self {
            ptr: name.as_ptr(),
            len: name.len(),
        }
    }

    /// Copies `name` onto the heap. Must be released with
    /// [`release`](Name::release).
    pub fn owned(name: &str) -> Self {
        let name = Box::<str>::from(name);
        let len = name.len();
        Self {
            ptr: Box::into_raw(name) as *const u8,
            len,
        }
    }

    pub fn is_none(&self) -> bool {
        self.ptr.is_null()
    }

    /// # Safety
    /// The name must be [`NONE`](Name::NONE), borrowed, or owned and not
    /// released yet. The returned string must not outlive an owned name.
    pub unsafe fn as_str<'a>(&self) -> &'a str {
        if self.is_none() {
            return "";
        }
        unsafe {
            core::str::from_utf8_unchecked(core::slice::from_raw_parts(self.ptr, self.len))
        }
    }

    /// # Safety
    /// The name must have come from [`owned`](Name::owned) and must not be
    /// used afterwards.
    pub unsafe fn release(self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.ptr as *mut u8, self.len);
        drop(unsafe { Box::from_raw(slice as *mut str) });
    }
}

pub struct Link {
    pub prev: Option<NonNull<MemHead>>,
    pub next: Option<NonNull<MemHead>>,
}
impl Link {
    pub const UNLINKED: Self = Link {
        prev: None,
        next: None,
    };
}

/// The header in front of every guarded payload.
///
/// Every field is valid for any bit pattern except the links, which are only
/// followed through blocks whose tags check out.
#[repr(C)]
pub struct MemHead {
    pub tag1: u32,
    pub len: usize,
    pub link: Link,
    pub name: Name,
    /// The name of `link.next`, so a report can be built in one forward walk
    /// and a corrupt successor can still be named.
    pub next_name: Name,
    pub tag2: u32,
    pub name_owned: u8,
    /// 0 for plain blocks, otherwise the (clamped) alignment.
    pub alignment: u16,
}
impl MemHead {
    pub fn new(len: usize, name: Name, name_owned: bool, alignment: u16) -> Self {
        Self {
            tag1: MEMTAG1,
            len,
            link: Link::UNLINKED,
            name,
            next_name: Name::NONE,
            tag2: MEMTAG2,
            name_owned: name_owned as u8,
            alignment,
        }
    }

    /// # Safety
    /// `payload` must have been returned by [`payload`](MemHead::payload), or
    /// at least be preceded by `HEAD_SIZE` readable bytes.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<MemHead> {
        unsafe { NonNull::new_unchecked(payload.as_ptr().sub(HEAD_SIZE)).cast() }
    }

    /// # Safety
    /// `head` must point to a header followed by its payload.
    pub unsafe fn payload(head: NonNull<MemHead>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(head.as_ptr().cast::<u8>().add(HEAD_SIZE)) }
    }

    pub fn tags_intact(&self) -> bool {
        self.tag1 == MEMTAG1 && self.tag2 == MEMTAG2
    }

    /// Whether the rest of the header can be trusted: both tags intact and a
    /// rounded length.
    pub fn is_valid(&self) -> bool {
        self.tags_intact() && self.len % LEN_GRANULE == 0
    }

    pub fn is_freed(&self) -> bool {
        self.tag1 == MEMFREE && self.tag2 == MEMFREE
    }

    pub fn has_owned_name(&self) -> bool {
        self.name_owned != 0
    }

    /// # Safety
    /// `head` must point to a header with a trustworthy `len`, followed by its
    /// payload and trailer.
    unsafe fn tail(head: NonNull<MemHead>) -> *mut MemTail {
        unsafe {
            MemHead::payload(head)
                .as_ptr()
                .add(head.as_ref().len)
                .cast::<MemTail>()
        }
    }

    /// # Safety
    /// See [`tail`](MemHead::tail).
    pub unsafe fn write_tail(head: NonNull<MemHead>, tag3: u32) {
        unsafe { Self::tail(head).write_unaligned(MemTail { tag3 }) }
    }

    /// # Safety
    /// See [`tail`](MemHead::tail).
    pub unsafe fn tail_intact(head: NonNull<MemHead>) -> bool {
        let head_ref = unsafe { head.as_ref() };
        head_ref.len % LEN_GRANULE == 0
            && unsafe { Self::tail(head).read_unaligned() }.tag3 == MEMTAG3
    }

    /// The envelope of an aligned block, `None` for a plain one.
    pub fn envelope(&self) -> Option<Envelope> {
        match self.alignment {
            0 => None,
            alignment => Envelope::new(alignment as usize, GUARDED_MIN_ALIGNMENT, HEAD_SIZE),
        }
    }
}
impl Debug for MemHead {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} len: {:#x} align: {}",
            unsafe { self.name.as_str() },
            self.len,
            self.alignment
        )
    }
}

#[repr(C)]
pub struct MemTail {
    pub tag3: u32,
}
