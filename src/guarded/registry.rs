use core::ptr::NonNull;

use log::debug;

use super::head::{MemHead, Name};

/// The list of live guarded blocks, linked through their headers.
///
/// Every method requires the allocator's lock to be held.
pub struct Registry {
    first: Option<NonNull<MemHead>>,
    last: Option<NonNull<MemHead>>,
}

/// How far a scan from one end of the registry got.
struct Scan {
    /// The block the scan stopped at: the first corrupt block, or the target.
    /// `None` if the scan ran off the end.
    stop: Option<NonNull<MemHead>>,
    /// The last block with intact tags before `stop`.
    last_ok: Option<NonNull<MemHead>>,
}

/// The outcome of [`Registry::recover`].
pub enum Recovery {
    /// The block is not in the registry, and nothing in it is corrupt.
    Missing,
    /// The block was spliced out of the registry. The name is the one cached
    /// by its predecessor, if it had one.
    Spliced(Option<Name>),
    /// Exactly one block is corrupt, and it is not the one being looked for.
    OtherCorrupt(Option<Name>),
    /// The scans from the two ends stopped at different blocks, so more than
    /// one block is corrupt. Nothing was changed.
    MultipleCorrupt,
}

impl Registry {
    pub const EMPTY: Self = Self {
        first: None,
        last: None,
    };

    /// # Safety
    /// No header in the registry may be currently in use, but all must be
    /// valid. The supplied header must be valid and unlinked.
    pub unsafe fn push_back(&mut self, mut head: NonNull<MemHead>) {
        let head_mut = unsafe { head.as_mut() };
        head_mut.link.prev = self.last;
        head_mut.link.next = None;
        head_mut.next_name = Name::NONE;
        match self.last {
            Some(mut last) => {
                let last = unsafe { last.as_mut() };
                last.link.next = Some(head);
                last.next_name = head_mut.name;
            }
            None => self.first = Some(head),
        }
        self.last = Some(head);
    }

    /// # Safety
    /// No header in the registry may be currently in use, but all must be
    /// valid. The supplied header must be in the registry.
    pub unsafe fn remove(&mut self, mut head: NonNull<MemHead>) {
        let head_mut = unsafe { head.as_mut() };
        let (prev, next) = (head_mut.link.prev, head_mut.link.next);
        match prev {
            Some(mut prev) => {
                let prev = unsafe { prev.as_mut() };
                prev.link.next = next;
                prev.next_name = next.map_or(Name::NONE, |next| unsafe { next.as_ref() }.name);
            }
            None => self.first = next,
        }
        match next {
            Some(mut next) => unsafe { next.as_mut() }.link.prev = prev,
            None => self.last = prev,
        }
        head_mut.link.prev = None;
        head_mut.link.next = None;
    }

    /// Changes the name of a block, keeping its predecessor's cached copy in
    /// step.
    ///
    /// # Safety
    /// See [`remove`](Registry::remove).
    pub unsafe fn rename(&mut self, mut head: NonNull<MemHead>, name: Name) {
        let head_mut = unsafe { head.as_mut() };
        head_mut.name = name;
        if let Some(mut prev) = head_mut.link.prev {
            unsafe { prev.as_mut() }.next_name = name;
        }
    }

    /// # Safety
    /// No header in the registry may be currently in use, but all must be
    /// valid.
    pub unsafe fn iter(&self) -> RegistryIter {
        RegistryIter { next: self.first }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// # Safety
    /// All headers reachable through intact blocks must be readable.
    unsafe fn scan_forward(&self, target: Option<NonNull<MemHead>>) -> Scan {
        let mut scan = Scan {
            stop: self.first,
            last_ok: None,
        };
        while let Some(head) = scan.stop {
            if Some(head) == target || !unsafe { head.as_ref() }.tags_intact() {
                break;
            }
            scan.last_ok = Some(head);
            scan.stop = unsafe { head.as_ref() }.link.next;
        }
        scan
    }

    /// # Safety
    /// See [`scan_forward`](Registry::scan_forward).
    unsafe fn scan_backward(&self, target: Option<NonNull<MemHead>>) -> Scan {
        let mut scan = Scan {
            stop: self.last,
            last_ok: None,
        };
        while let Some(head) = scan.stop {
            if Some(head) == target || !unsafe { head.as_ref() }.tags_intact() {
                break;
            }
            scan.last_ok = Some(head);
            scan.stop = unsafe { head.as_ref() }.link.prev;
        }
        scan
    }

    /// Walks the registry from both ends, checking the tags and trailer of
    /// every block and that each block's successor links back to it.
    ///
    /// # Safety
    /// See [`scan_forward`](Registry::scan_forward).
    pub unsafe fn is_consistent(&self) -> bool {
        let mut prev = None;
        let mut cursor = self.first;
        while let Some(head) = cursor {
            let head_ref = unsafe { head.as_ref() };
            if !head_ref.tags_intact()
                || !unsafe { MemHead::tail_intact(head) }
                || head_ref.link.prev != prev
            {
                return false;
            }
            prev = Some(head);
            cursor = head_ref.link.next;
        }
        if prev != self.last {
            return false;
        }
        unsafe { self.scan_backward(None) }.stop.is_none()
    }

    /// Every block with intact tags that can be reached without reading a
    /// corrupt header, in registry order.
    ///
    /// The forward walk stops at the first corrupt block, and the rest of the
    /// list is picked up walking back from `last`. Blocks between two corrupt
    /// ones cannot be reached safely and are left out.
    ///
    /// # Safety
    /// See [`scan_forward`](Registry::scan_forward).
    pub unsafe fn intact_blocks(&self) -> Vec<NonNull<MemHead>> {
        let mut blocks = Vec::new();
        let mut cursor = self.first;
        while let Some(head) = cursor {
            if !unsafe { head.as_ref() }.tags_intact() {
                break;
            }
            blocks.push(head);
            cursor = unsafe { head.as_ref() }.link.next;
        }
        if cursor.is_none() {
            return blocks;
        }
        let split = blocks.len();
        let mut cursor = self.last;
        while let Some(head) = cursor {
            if !unsafe { head.as_ref() }.tags_intact() {
                break;
            }
            blocks.push(head);
            cursor = unsafe { head.as_ref() }.link.prev;
        }
        blocks[split..].reverse();
        blocks
    }

    /// Finds `target` despite corruption and splices it out of the registry.
    ///
    /// Two scans, one from each end, stop at the first block with bad tags.
    /// If they stop at the same block, it is the only corrupt one and the
    /// blocks on either side of it are known good, so it can be unlinked by
    /// joining those two without reading its own links. If nothing is
    /// corrupt, the scans are repeated looking for `target` itself.
    ///
    /// More than one corrupt block is detected and reported, but not repaired.
    ///
    /// # Safety
    /// See [`scan_forward`](Registry::scan_forward).
    pub unsafe fn recover(&mut self, target: NonNull<MemHead>) -> Recovery {
        let mut forward = unsafe { self.scan_forward(None) };
        let mut backward = unsafe { self.scan_backward(None) };

        if forward.stop != backward.stop {
            debug!("registry scans stopped at different blocks");
            return Recovery::MultipleCorrupt;
        }

        if forward.stop.is_none() {
            forward = unsafe { self.scan_forward(Some(target)) };
            if forward.stop.is_none() {
                return Recovery::Missing;
            }
            backward = unsafe { self.scan_backward(Some(target)) };
        }

        let name = forward
            .last_ok
            .map(|head| unsafe { head.as_ref() }.next_name)
            .filter(|name| !name.is_none());

        if forward.stop != Some(target) {
            debug!("a block other than {target:p} is corrupt");
            return Recovery::OtherCorrupt(name);
        }

        debug!("splicing {target:p} out of the registry");
        match (forward.last_ok, backward.last_ok) {
            (Some(mut before), Some(mut after)) => {
                let after_name = unsafe { after.as_ref() }.name;
                let before = unsafe { before.as_mut() };
                before.link.next = Some(after);
                before.next_name = after_name;
                unsafe { after.as_mut() }.link.prev = forward.last_ok;
            }
            (Some(mut before), None) => {
                let before = unsafe { before.as_mut() };
                before.link.next = None;
                before.next_name = Name::NONE;
                self.last = forward.last_ok;
            }
            (None, Some(mut after)) => {
                unsafe { after.as_mut() }.link.prev = None;
                self.first = backward.last_ok;
            }
            (None, None) => {
                self.first = None;
                self.last = None;
            }
        }

        Recovery::Spliced(name)
    }
}
impl Default for Registry {
    fn default() -> Self {
        Self::EMPTY
    }
}

pub struct RegistryIter {
    next: Option<NonNull<MemHead>>,
}
impl Iterator for RegistryIter {
    type Item = NonNull<MemHead>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next;
        if let Some(next) = next {
            self.next = unsafe { next.as_ref().link.next };
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::super::head::{HEAD_SIZE, MEMTAG3, TAIL_SIZE};
    use super::*;

    /// Headers with room for a 4-byte payload and a trailer, kept in plain
    /// memory so that tests can corrupt them freely.
    struct Heads {
        _storage: Vec<Vec<u64>>,
    }
    impl Heads {
        fn new(names: &[&'static str]) -> (Self, Vec<NonNull<MemHead>>) {
            let mut storage: Vec<Vec<u64>> = names
                .iter()
                .map(|_| vec![0u64; (HEAD_SIZE + 8 + TAIL_SIZE).div_ceil(8)])
                .collect();
            let heads = storage
                .iter_mut()
                .zip(names)
                .map(|(words, name)| {
                    let head = NonNull::new(words.as_mut_ptr()).unwrap().cast::<MemHead>();
                    unsafe {
                        head.as_ptr()
                            .write(MemHead::new(4, Name::borrowed(name), false, 0));
                        MemHead::write_tail(head, MEMTAG3);
                    }
                    head
                })
                .collect();
            (Self { _storage: storage }, heads)
        }
    }

    fn build(names: &[&'static str]) -> (Heads, Registry, Vec<NonNull<MemHead>>) {
        let (storage, heads) = Heads::new(names);
        let mut registry = Registry::EMPTY;
        for &head in &heads {
            unsafe { registry.push_back(head) };
        }
        (storage, registry, heads)
    }

    fn names(registry: &Registry) -> Vec<&'static str> {
        unsafe { registry.iter() }
            .map(|head| unsafe { head.as_ref().name.as_str() })
            .collect()
    }

    fn listed(registry: &Registry) -> Vec<&'static str> {
        unsafe { registry.intact_blocks() }
            .into_iter()
            .map(|head| unsafe { head.as_ref().name.as_str() })
            .collect()
    }

    fn corrupt(head: NonNull<MemHead>) {
        unsafe { (*head.as_ptr()).tag1 ^= 0x1 };
    }

    #[test]
    fn push_and_remove_keep_next_names() {
        let (_storage, mut registry, heads) = build(&["a", "b", "c"]);
        assert_eq!(names(&registry), ["a", "b", "c"]);
        unsafe {
            assert_eq!(heads[0].as_ref().next_name.as_str(), "b");
            registry.remove(heads[1]);
            assert_eq!(heads[0].as_ref().next_name.as_str(), "c");
            registry.rename(heads[2], Name::borrowed("z"));
            assert_eq!(heads[0].as_ref().next_name.as_str(), "z");
            registry.remove(heads[2]);
            assert!(heads[0].as_ref().next_name.is_none());
            registry.remove(heads[0]);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn consistency_detects_corruption() {
        let (_storage, registry, heads) = build(&["a", "b", "c"]);
        assert!(unsafe { registry.is_consistent() });
        corrupt(heads[1]);
        assert!(!unsafe { registry.is_consistent() });
    }

    #[test]
    fn recover_splices_corrupt_middle_block() {
        let (_storage, mut registry, heads) = build(&["a", "b", "c"]);
        corrupt(heads[1]);
        match unsafe { registry.recover(heads[1]) } {
            Recovery::Spliced(Some(name)) => assert_eq!(unsafe { name.as_str() }, "b"),
            _ => panic!("expected the block to be spliced"),
        }
        assert_eq!(names(&registry), ["a", "c"]);
        assert!(unsafe { registry.is_consistent() });
        unsafe {
            assert_eq!(heads[0].as_ref().next_name.as_str(), "c");
            assert_eq!(heads[2].as_ref().link.prev, Some(heads[0]));
        }
    }

    #[test]
    fn recover_splices_ends() {
        let (_storage, mut registry, heads) = build(&["a", "b", "c"]);
        corrupt(heads[0]);
        assert!(matches!(
            unsafe { registry.recover(heads[0]) },
            Recovery::Spliced(None)
        ));
        assert_eq!(names(&registry), ["b", "c"]);

        corrupt(heads[2]);
        assert!(matches!(
            unsafe { registry.recover(heads[2]) },
            Recovery::Spliced(Some(_))
        ));
        assert_eq!(names(&registry), ["b"]);
        assert!(unsafe { registry.is_consistent() });

        corrupt(heads[1]);
        assert!(matches!(
            unsafe { registry.recover(heads[1]) },
            Recovery::Spliced(None)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn recover_finds_intact_target() {
        let (_storage, mut registry, heads) = build(&["a", "b", "c"]);
        assert!(matches!(
            unsafe { registry.recover(heads[1]) },
            Recovery::Spliced(Some(_))
        ));
        assert_eq!(names(&registry), ["a", "c"]);
    }

    #[test]
    fn recover_reports_missing_and_other_corruption() {
        let (_storage, mut registry, heads) = build(&["a", "b", "c"]);
        let (_other_storage, others) = Heads::new(&["stranger"]);
        assert!(matches!(
            unsafe { registry.recover(others[0]) },
            Recovery::Missing
        ));

        corrupt(heads[2]);
        match unsafe { registry.recover(heads[0]) } {
            Recovery::OtherCorrupt(Some(name)) => assert_eq!(unsafe { name.as_str() }, "c"),
            _ => panic!("expected another block to be blamed"),
        }
        assert_eq!(names(&registry), ["a", "b", "c"]);
    }

    #[test]
    fn intact_blocks_skip_corruption() {
        let (_storage, registry, heads) = build(&["a", "b", "c", "d", "e"]);
        assert_eq!(listed(&registry), ["a", "b", "c", "d", "e"]);

        unsafe { heads[2].as_ptr().cast::<u8>().write_bytes(0xff, HEAD_SIZE) };
        assert_eq!(listed(&registry), ["a", "b", "d", "e"]);

        corrupt(heads[3]);
        assert_eq!(listed(&registry), ["a", "b", "e"]);
    }

    #[test]
    fn recover_refuses_multiple_corruption() {
        let (_storage, mut registry, heads) = build(&["a", "b", "c", "d"]);
        corrupt(heads[1]);
        corrupt(heads[3]);
        assert!(matches!(
            unsafe { registry.recover(heads[1]) },
            Recovery::MultipleCorrupt
        ));
        assert_eq!(names(&registry), ["a", "b", "c", "d"]);
    }
}
