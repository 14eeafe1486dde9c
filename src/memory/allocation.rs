use super::bucket::MAX_SMALL_SIZE;
use super::page::PageId;
use super::protection::ProtectTarget;
use super::segment::{SecondaryMetadata, SegmentId};
use super::vm::PageProtection;
use std::ptr::NonNull;

/// Where an allocation's bytes live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AllocationKind {
    /// Granules inside a bucketed page.
    Small { page: PageId },
    /// A run of whole pages of its own.
    Large { segment: SegmentId, page_count: usize },
}

/// A granted code region.
///
/// The heap keeps the bookkeeping; this is a handle the caller passes back to
/// [`CodeHeap::free`](super::heap::CodeHeap::free) and friends. Handles are
/// cheap to clone, and a clone of a freed allocation is rejected rather than
/// freed twice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    address: NonNull<u8>,
    size: usize,
    pub(crate) kind: AllocationKind,
    metadata: Option<SecondaryMetadata>,
}

// Safety: the handle never dereferences the address on its own; access goes
// through the heap that issued it.
unsafe impl Send for Allocation {}

impl Allocation {
    pub(crate) fn small(address: NonNull<u8>, size: usize, page: PageId, metadata: Option<SecondaryMetadata>) -> Self {
        debug_assert!(size <= MAX_SMALL_SIZE);
        Self {
            address,
            size,
            kind: AllocationKind::Small { page },
            metadata,
        }
    }

    pub(crate) fn large(
        address: NonNull<u8>,
        size: usize,
        segment: SegmentId,
        page_count: usize,
        metadata: Option<SecondaryMetadata>,
    ) -> Self {
        debug_assert!(size > MAX_SMALL_SIZE);
        Self {
            address,
            size,
            kind: AllocationKind::Large { segment, page_count },
            metadata,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.address
    }

    #[inline]
    #[must_use]
    pub fn address(&self) -> usize {
        self.address.as_ptr() as usize
    }

    /// Requested size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn is_large(&self) -> bool {
        matches!(self.kind, AllocationKind::Large { .. })
    }

    /// Pages backing a large allocation; `None` for bucketed ones.
    #[must_use]
    pub fn page_count(&self) -> Option<usize> {
        match self.kind {
            AllocationKind::Large { page_count, .. } => Some(page_count),
            AllocationKind::Small { .. } => None,
        }
    }

    #[must_use]
    pub fn secondary_metadata(&self) -> Option<&SecondaryMetadata> {
        self.metadata.as_ref()
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.address() && address < self.address() + self.size
    }

    /// Readable view of the emitted code.
    ///
    /// # Safety
    ///
    /// The allocation must be live and not decommitted.
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[u8] {
        // Safety: caller guarantees the range is committed and readable.
        unsafe { std::slice::from_raw_parts(self.address.as_ptr(), self.size) }
    }

    /// Writable view for emitting code.
    ///
    /// # Safety
    ///
    /// The allocation must be live, and its pages must currently be writable
    /// (see [`CodeHeap::protect_read_write`](super::heap::CodeHeap::protect_read_write)).
    /// No other reference to the range may exist.
    #[allow(clippy::mut_from_ref)]
    #[must_use]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // Safety: caller guarantees exclusive, writable access.
        unsafe { std::slice::from_raw_parts_mut(self.address.as_ptr(), self.size) }
    }
}

/// Heap-side record of a large region.
#[derive(Debug)]
pub(crate) struct LargeObject {
    pub address: NonNull<u8>,
    pub segment: SegmentId,
    pub page_count: usize,
    pub protection: PageProtection,
    pub decommitted: bool,
}

impl LargeObject {
    pub fn contains(&self, address: usize, page_size: usize) -> bool {
        let base = self.address.as_ptr() as usize;
        address >= base && address < base + self.page_count * page_size
    }
}

impl ProtectTarget for LargeObject {
    fn base(&self) -> NonNull<u8> {
        self.address
    }

    fn page_count(&self) -> usize {
        self.page_count
    }

    fn segment(&self) -> SegmentId {
        self.segment
    }

    fn protection(&self) -> PageProtection {
        self.protection
    }

    fn set_protection(&mut self, protection: PageProtection) {
        self.protection = protection;
    }

    fn is_decommitted(&self) -> bool {
        self.decommitted
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::segment::ProviderKind;

    fn addr(v: usize) -> NonNull<u8> {
        NonNull::new(v as *mut u8).unwrap()
    }

    #[test]
    fn test_small_and_large_are_exclusive() {
        let page = PageId { index: 3, generation: 1 };
        let small = Allocation::small(addr(0x1000), 300, page, None);
        assert!(!small.is_large());
        assert_eq!(small.page_count(), None);
        assert!(small.contains(0x1000 + 299));
        assert!(!small.contains(0x1000 + 300));

        let segment = SegmentId { kind: ProviderKind::Regular, index: 0, generation: 0 };
        let large = Allocation::large(addr(0x10_0000), 5000, segment, 2, None);
        assert!(large.is_large());
        assert_eq!(large.page_count(), Some(2));
        assert_ne!(small, large);
    }

    #[test]
    fn test_clone_compares_equal() {
        let page = PageId { index: 0, generation: 0 };
        let a = Allocation::small(addr(0x2000), 128, page, None);
        let b = a.clone();
        assert_eq!(a, b);
        let c = Allocation::small(addr(0x2000), 128, PageId { index: 0, generation: 1 }, None);
        assert_ne!(a, c, "a recycled page slot yields a different handle");
    }
}
