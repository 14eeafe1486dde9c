use super::bucket::{BucketId, GRANULE_SIZE};
use super::segment::SegmentId;
use super::vm::PageProtection;
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Index of the first run of `len` consecutive set bits, lowest first.
pub(crate) fn first_run_of_ones(bits: &FixedBitSet, len: usize) -> Option<usize> {
    if len == 0 || len > bits.len() {
        return None;
    }
    let mut run_start = 0;
    let mut run_len = 0;
    for i in 0..bits.len() {
        if bits.contains(i) {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len == len {
                return Some(run_start);
            }
        } else {
            run_len = 0;
        }
    }
    None
}

/// Stable handle to a page record in the heap's page table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PageId {
    pub index: u32,
    pub generation: u32,
}

/// Which heap list currently holds a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageListKind {
    Partial(BucketId),
    Full(BucketId),
    Decommitted,
}

/// Metadata for one OS page of code, split into 128-byte granules.
///
/// The page never owns its memory: the segment does. Protection changes and
/// decommits go through the page source.
pub(crate) struct Page {
    pub address: NonNull<u8>,
    pub segment: SegmentId,
    /// Set bit = free granule.
    pub free_bits: FixedBitSet,
    pub bucket: BucketId,
    pub decommitted: bool,
    pub protection: PageProtection,
    pub list: PageListKind,
    /// Position inside the list named by `list`.
    pub list_slot: usize,
}

impl Page {
    pub fn new(address: NonNull<u8>, segment: SegmentId, bucket: BucketId, page_size: usize) -> Self {
        let mut free_bits = FixedBitSet::with_capacity(page_size / GRANULE_SIZE);
        free_bits.insert_range(..);
        Self {
            address,
            segment,
            free_bits,
            bucket,
            decommitted: false,
            protection: PageProtection::EXECUTE_READ,
            list: PageListKind::Partial(bucket),
            list_slot: 0,
        }
    }

    #[inline]
    pub fn granule_count(&self) -> usize {
        self.free_bits.len()
    }

    pub fn size(&self) -> usize {
        self.granule_count() * GRANULE_SIZE
    }

    /// Every granule is allocated.
    #[inline]
    pub fn has_no_space(&self) -> bool {
        self.free_bits.is_clear()
    }

    /// Every granule is free.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.free_bits.count_ones(..) == self.granule_count()
    }

    /// A contiguous free run can serve `bucket`.
    #[inline]
    pub fn can_allocate(&self, bucket: BucketId) -> bool {
        first_run_of_ones(&self.free_bits, bucket.granules()).is_some()
    }

    pub fn free_run(&self, granules: usize) -> Option<usize> {
        first_run_of_ones(&self.free_bits, granules)
    }

    pub fn contains(&self, address: usize) -> bool {
        let base = self.address.as_ptr() as usize;
        address >= base && address < base + self.size()
    }

    /// Granule holding `address`. `None` if the address is outside the page
    /// or not granule aligned.
    pub fn granule_index_of(&self, address: NonNull<u8>) -> Option<usize> {
        let address = address.as_ptr() as usize;
        if !self.contains(address) {
            return None;
        }
        let offset = address - self.address.as_ptr() as usize;
        offset.is_multiple_of(GRANULE_SIZE).then_some(offset / GRANULE_SIZE)
    }

    pub fn granule_address(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.granule_count());
        // Safety: index is within the page.
        unsafe { NonNull::new_unchecked(self.address.as_ptr().add(index * GRANULE_SIZE)) }
    }

    pub fn mark_allocated(&mut self, index: usize, granules: usize) {
        debug_assert_eq!(self.free_bits.count_ones(index..index + granules), granules);
        self.free_bits.set_range(index..index + granules, false);
    }

    pub fn mark_free(&mut self, index: usize, granules: usize) {
        debug_assert_eq!(self.free_bits.count_ones(index..index + granules), 0);
        self.free_bits.insert_range(index..index + granules);
    }

    /// True when the whole range is currently allocated.
    pub fn is_range_allocated(&self, index: usize, granules: usize) -> bool {
        index + granules <= self.granule_count()
            && self.free_bits.count_ones(index..index + granules) == 0
    }
}

/// Unordered page list with O(1) insert and removal.
///
/// Each page records its slot, so removal swaps the last entry into the hole
/// and patches that page's slot.
#[derive(Default)]
pub(crate) struct PageList {
    ids: Vec<PageId>,
}

impl PageList {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = PageId> + '_ {
        self.ids.iter().copied()
    }

    /// Push `id`, returning its slot.
    pub fn push(&mut self, id: PageId) -> usize {
        self.ids.push(id);
        self.ids.len() - 1
    }

    /// Remove the entry at `slot`. Returns the id that moved into `slot`,
    /// if any, so the caller can update that page's record.
    pub fn remove(&mut self, slot: usize) -> Option<PageId> {
        self.ids.swap_remove(slot);
        self.ids.get(slot).copied()
    }

    pub fn take_all(&mut self) -> Vec<PageId> {
        std::mem::take(&mut self.ids)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::segment::ProviderKind;

    fn fake_page() -> (Vec<u8>, Page) {
        let mut backing = vec![0u8; 4096];
        let addr = NonNull::new(backing.as_mut_ptr()).unwrap();
        let seg = SegmentId { kind: ProviderKind::Regular, index: 0, generation: 0 };
        (backing, Page::new(addr, seg, BucketId::Bucket256, 4096))
    }

    #[test]
    fn test_first_run_of_ones() {
        let mut bits = FixedBitSet::with_capacity(32);
        assert_eq!(first_run_of_ones(&bits, 1), None);
        bits.insert_range(4..6);
        bits.insert_range(10..14);
        assert_eq!(first_run_of_ones(&bits, 1), Some(4));
        assert_eq!(first_run_of_ones(&bits, 2), Some(4));
        assert_eq!(first_run_of_ones(&bits, 3), Some(10));
        assert_eq!(first_run_of_ones(&bits, 4), Some(10));
        assert_eq!(first_run_of_ones(&bits, 5), None);
        assert_eq!(first_run_of_ones(&bits, 0), None);
        assert_eq!(first_run_of_ones(&bits, 33), None);
    }

    #[test]
    fn test_fresh_page_is_empty() {
        let (_backing, page) = fake_page();
        assert_eq!(page.granule_count(), 32);
        assert!(page.is_empty());
        assert!(!page.has_no_space());
        assert!(page.can_allocate(BucketId::Bucket4096));
    }

    #[test]
    fn test_page_fill_and_space_queries() {
        let (_backing, mut page) = fake_page();
        page.mark_allocated(0, 31);
        assert!(!page.has_no_space());
        assert!(!page.can_allocate(BucketId::Bucket256), "one granule left, bucket needs two");
        assert_eq!(page.free_run(1), Some(31));
        page.mark_allocated(31, 1);
        assert!(page.has_no_space());
        assert!(page.is_range_allocated(0, 32));

        page.mark_free(4, 2);
        assert!(page.can_allocate(BucketId::Bucket256));
        assert!(!page.is_empty());
    }

    #[test]
    fn test_granule_index_of() {
        let (_backing, page) = fake_page();
        let base = page.address.as_ptr() as usize;
        let at = |off: usize| NonNull::new((base + off) as *mut u8).unwrap();
        assert_eq!(page.granule_index_of(at(0)), Some(0));
        assert_eq!(page.granule_index_of(at(384)), Some(3));
        assert_eq!(page.granule_index_of(at(385)), None, "misaligned");
        assert_eq!(page.granule_index_of(at(4096)), None, "past the end");
        assert_eq!(page.granule_address(3), at(384));
    }

    #[test]
    fn test_page_list_swap_remove() {
        let id = |i| PageId { index: i, generation: 0 };
        let mut list = PageList::default();
        assert_eq!(list.push(id(1)), 0);
        assert_eq!(list.push(id(2)), 1);
        assert_eq!(list.push(id(3)), 2);

        // Removing the head moves the tail into slot 0.
        assert_eq!(list.remove(0), Some(id(3)));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![id(3), id(2)]);
        // Removing the tail moves nothing.
        assert_eq!(list.remove(1), None);
        assert_eq!(list.len(), 1);
        assert_eq!(list.take_all(), vec![id(3)]);
        assert!(list.is_empty());
    }
}
