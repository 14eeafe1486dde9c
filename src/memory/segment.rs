use super::page::first_run_of_ones;
use super::vm::{PageProtection, PlatformVmOps, VmError, VmOps};
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Size of one function-table (unwind) record reserved per requested record.
pub const UNWIND_RECORD_SIZE: usize = 12;

/// Metadata blocks are carved at this alignment.
const METADATA_ALIGN: usize = 8;

/// Smallest hole worth reporting as remaining metadata capacity.
pub(crate) const MIN_METADATA_BLOCK: usize = 64;

/// Bytes a metadata request occupies: the record table plus trailing data.
pub(crate) fn metadata_request_size(record_count: u16, metadata_size: u16) -> usize {
    usize::from(record_count) * UNWIND_RECORD_SIZE + usize::from(metadata_size)
}

/// Which provider a segment was reserved from. Fixed for the segment's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Regular,
    PreReserved,
}

/// Non-owning handle to a segment in a provider's segment table.
///
/// The generation guards against a handle outliving its segment: a released
/// slot is reused with a bumped generation, so stale handles never match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegmentId {
    pub(crate) kind: ProviderKind,
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl SegmentId {
    #[inline]
    #[must_use]
    pub fn kind(self) -> ProviderKind {
        self.kind
    }

    /// Lock-free: the answer is baked into the handle.
    #[inline]
    #[must_use]
    pub fn is_pre_reserved(self) -> bool {
        self.kind == ProviderKind::PreReserved
    }
}

/// Unwind/stack-walk records reserved for one code allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecondaryMetadata {
    address: NonNull<u8>,
    size: usize,
    record_count: u16,
    function_start: usize,
    function_size: usize,
    segment: SegmentId,
}

// Safety: the handle only names memory owned by the segment; it never
// dereferences it on its own.
unsafe impl Send for SecondaryMetadata {}

impl SecondaryMetadata {
    /// Start of the reserved block (writable, never executable).
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.address
    }

    /// Bytes reserved, including the per-record table.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn record_count(&self) -> u16 {
        self.record_count
    }

    /// Code range these records describe.
    #[must_use]
    pub fn function_range(&self) -> std::ops::Range<usize> {
        self.function_start..self.function_start + self.function_size
    }

    #[must_use]
    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    fn offset_in(&self, arena: &MetadataArena) -> usize {
        self.address.as_ptr() as usize - arena.base.as_ptr() as usize
    }
}

/// First-fit byte allocator over a segment's metadata pages.
pub(crate) struct MetadataArena {
    base: NonNull<u8>,
    capacity: usize,
    /// Free holes `(offset, len)`, sorted by offset and coalesced.
    holes: Vec<(usize, usize)>,
    used: usize,
}

impl MetadataArena {
    fn new(base: NonNull<u8>, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            holes: vec![(0, capacity)],
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn can_allocate(&self) -> bool {
        self.can_fit(MIN_METADATA_BLOCK)
    }

    pub fn can_fit(&self, len: usize) -> bool {
        let len = len.next_multiple_of(METADATA_ALIGN);
        self.holes.iter().any(|&(_, hole)| hole >= len)
    }

    fn alloc(&mut self, len: usize) -> Option<usize> {
        let len = len.next_multiple_of(METADATA_ALIGN);
        let pos = self.holes.iter().position(|&(_, hole)| hole >= len)?;
        let (offset, hole) = self.holes[pos];
        if hole == len {
            self.holes.remove(pos);
        } else {
            self.holes[pos] = (offset + len, hole - len);
        }
        self.used += len;
        Some(offset)
    }

    fn free(&mut self, offset: usize, len: usize) {
        let len = len.next_multiple_of(METADATA_ALIGN);
        debug_assert!(offset + len <= self.capacity);
        let pos = self.holes.partition_point(|&(o, _)| o < offset);
        debug_assert!(
            pos == self.holes.len() || self.holes[pos].0 >= offset + len,
            "metadata block at offset {offset} freed twice"
        );
        self.holes.insert(pos, (offset, len));
        // Coalesce with the right neighbour, then the left.
        if pos + 1 < self.holes.len() && self.holes[pos].0 + self.holes[pos].1 == self.holes[pos + 1].0 {
            self.holes[pos].1 += self.holes[pos + 1].1;
            self.holes.remove(pos + 1);
        }
        if pos > 0 && self.holes[pos - 1].0 + self.holes[pos - 1].1 == self.holes[pos].0 {
            self.holes[pos - 1].1 += self.holes[pos].1;
            self.holes.remove(pos);
        }
        self.used -= len;
    }
}

/// A reservation of contiguous code pages followed by optional metadata pages.
///
/// Layout: `[code page 0 .. code page N) [metadata pages)`. Code pages are
/// committed lazily as they are handed out; metadata pages are committed
/// read-write for the segment's whole lifetime.
pub(crate) struct Segment {
    base: NonNull<u8>,
    page_size: usize,
    page_count: usize,
    reserved_size: usize,
    /// Set bit = page not handed out.
    free_pages: FixedBitSet,
    /// Reserved for a single large region.
    dedicated: bool,
    metadata: Option<MetadataArena>,
}

// Safety: Segment owns its reservation; it is only reached through the
// PageSource lock.
unsafe impl Send for Segment {}

impl Drop for Segment {
    fn drop(&mut self) {
        // Safety: the reservation is owned by this segment and no page
        // handle may outlive it (providers only drop unused segments, or
        // everything at PageSource teardown).
        unsafe {
            drop(PlatformVmOps::release(self.base, self.reserved_size));
        }
    }
}

impl Segment {
    /// Reserve a segment of `page_count` code pages plus `metadata_pages`.
    pub fn reserve(
        page_count: usize,
        metadata_pages: usize,
        page_size: usize,
        dedicated: bool,
    ) -> Result<Self, VmError> {
        debug_assert!(page_count > 0, "segment must hold at least one code page");
        let code_size = page_count * page_size;
        let metadata_size = metadata_pages * page_size;
        let reserved_size = code_size + metadata_size;

        // Safety: FFI call to reserve memory.
        let base = unsafe { PlatformVmOps::reserve(reserved_size)? };

        let metadata = if metadata_pages > 0 {
            // Safety: metadata range lies inside the fresh reservation.
            let meta_base = unsafe { NonNull::new_unchecked(base.as_ptr().add(code_size)) };
            // Safety: FFI call to commit memory.
            if let Err(e) = unsafe { PlatformVmOps::commit(meta_base, metadata_size) } {
                // Safety: FFI call to release the reservation made above.
                unsafe { drop(PlatformVmOps::release(base, reserved_size)) };
                return Err(e);
            }
            Some(MetadataArena::new(meta_base, metadata_size))
        } else {
            None
        };

        let mut free_pages = FixedBitSet::with_capacity(page_count);
        free_pages.insert_range(..);

        Ok(Self {
            base,
            page_size,
            page_count,
            reserved_size,
            free_pages,
            dedicated,
            metadata,
        })
    }

    pub fn reserved_size(&self) -> usize {
        self.reserved_size
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    pub fn free_page_count(&self) -> usize {
        self.free_pages.count_ones(..)
    }

    /// True when no code page is handed out and no metadata is live.
    pub fn is_unused(&self) -> bool {
        self.free_page_count() == self.page_count
            && self.metadata.as_ref().is_none_or(|m| m.used() == 0)
    }

    pub fn contains(&self, address: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        address >= base && address < base + self.page_count * self.page_size
    }

    fn page_index(&self, address: NonNull<u8>) -> usize {
        let offset = address.as_ptr() as usize - self.base.as_ptr() as usize;
        debug_assert!(
            offset.is_multiple_of(self.page_size),
            "address {address:p} is not page aligned"
        );
        offset / self.page_size
    }

    pub fn find_free_run(&self, count: usize) -> Option<usize> {
        first_run_of_ones(&self.free_pages, count)
    }

    /// Commit `count` pages at `index` and hand them out execute-read.
    pub fn take_pages(&mut self, index: usize, count: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert_eq!(self.free_pages.count_ones(index..index + count), count);
        // Safety: index + count is within the code range.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * self.page_size)) };
        let size = count * self.page_size;
        // Safety: FFI calls on a range inside our reservation.
        unsafe {
            PlatformVmOps::commit(ptr, size)?;
            if let Err(e) = PlatformVmOps::protect(ptr, size, PageProtection::EXECUTE_READ) {
                drop(PlatformVmOps::decommit(ptr, size));
                return Err(e);
            }
        }
        self.free_pages.set_range(index..index + count, false);
        Ok(ptr)
    }

    /// Take pages back. Decommits them unless the caller already did.
    pub fn return_pages(
        &mut self,
        address: NonNull<u8>,
        count: usize,
        already_decommitted: bool,
    ) -> Result<(), VmError> {
        let index = self.page_index(address);
        debug_assert!(index + count <= self.page_count);
        debug_assert_eq!(
            self.free_pages.count_ones(index..index + count),
            0,
            "returning pages that were never handed out"
        );
        if !already_decommitted {
            // Safety: FFI call on a range inside our reservation.
            unsafe { PlatformVmOps::decommit(address, count * self.page_size)? };
        }
        self.free_pages.insert_range(index..index + count);
        Ok(())
    }

    pub fn metadata(&self) -> Option<&MetadataArena> {
        self.metadata.as_ref()
    }

    pub fn can_allocate_metadata(&self) -> bool {
        self.metadata.as_ref().is_some_and(MetadataArena::can_allocate)
    }

    /// Room for a block of `bytes` right now.
    pub fn can_fit_metadata(&self, bytes: usize) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.can_fit(bytes))
    }

    pub fn alloc_metadata(
        &mut self,
        id: SegmentId,
        function_start: usize,
        function_size: usize,
        record_count: u16,
        metadata_size: u16,
    ) -> Option<SecondaryMetadata> {
        let arena = self.metadata.as_mut()?;
        let size = metadata_request_size(record_count, metadata_size);
        let offset = arena.alloc(size)?;
        // Safety: offset is inside the committed metadata range.
        let address = unsafe { NonNull::new_unchecked(arena.base.as_ptr().add(offset)) };
        Some(SecondaryMetadata {
            address,
            size,
            record_count,
            function_start,
            function_size,
            segment: id,
        })
    }

    pub fn release_metadata(&mut self, metadata: &SecondaryMetadata) {
        let Some(arena) = self.metadata.as_mut() else {
            debug_assert!(false, "segment has no metadata arena");
            return;
        };
        let offset = metadata.offset_in(arena);
        arena.free(offset, metadata.size);
    }
}
