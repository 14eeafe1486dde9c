use super::allocation::{Allocation, AllocationKind, LargeObject};
use super::bucket::{BucketId, GRANULE_SIZE, SMALL_BUCKET_COUNT, classify_bucket, granules_for_bytes};
use super::error::HeapError;
use super::metadata::SecondaryMetadataTracker;
use super::page::{Page, PageId, PageList, PageListKind};
use super::page_source::{PageGrant, PageSource, PageSourceGuard};
use super::protection::{ProtectionController, fill_with_traps};
use super::segment::{SecondaryMetadata, SegmentId, metadata_request_size};
use super::vm::PageProtection;
use crate::sync::Arc;
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct CodeHeapConfig {
    /// Empty pages a bucket keeps for reuse when [`CodeHeap::compact`] runs.
    pub empty_pages_per_bucket: usize,
}

impl Default for CodeHeapConfig {
    fn default() -> Self {
        Self { empty_pages_per_bucket: 1 }
    }
}

/// Point-in-time view of a heap's bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub partial_pages: [usize; SMALL_BUCKET_COUNT],
    pub full_pages: [usize; SMALL_BUCKET_COUNT],
    /// Pages with every granule free, on either list.
    pub empty_pages: usize,
    pub decommitted_pages: usize,
    pub large_objects: usize,
    pub decommitted_large_objects: usize,
    pub live_allocations: usize,
    /// Allocations carrying unwind records.
    pub metadata_records: usize,
}

impl HeapStats {
    #[must_use]
    pub fn partial_pages_in(&self, bucket: BucketId) -> usize {
        if bucket.is_large() { 0 } else { self.partial_pages[bucket.index()] }
    }

    #[must_use]
    pub fn full_pages_in(&self, bucket: BucketId) -> usize {
        if bucket.is_large() { 0 } else { self.full_pages[bucket.index()] }
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.partial_pages.iter().sum::<usize>() + self.full_pages.iter().sum::<usize>() + self.decommitted_pages
    }
}

struct PageSlot {
    generation: u32,
    page: Option<Page>,
}

/// Bucketed allocator for JIT code.
///
/// Small requests share pages split into 128-byte granules; each of the five
/// buckets keeps a partial and a full page list. Requests above 4096 bytes get
/// whole pages of their own. Pages come from a [`PageSource`] that may be
/// shared with other heaps.
///
/// `&mut self` on every mutating call is the single-writer contract: wrap the
/// heap in a lock to share it.
pub struct CodeHeap {
    source: Arc<PageSource>,
    config: CodeHeapConfig,
    page_size: usize,
    pages: Vec<PageSlot>,
    free_page_slots: Vec<u32>,
    partial: [PageList; SMALL_BUCKET_COUNT],
    full: [PageList; SMALL_BUCKET_COUNT],
    decommitted: PageList,
    large_objects: HashMap<usize, LargeObject>,
    decommitted_large: HashMap<usize, LargeObject>,
    live: HashMap<usize, Allocation>,
    metadata: SecondaryMetadataTracker,
    all_code_in_pre_reserved: bool,
}

// Safety: pages and large objects only name memory owned by the shared
// PageSource; the heap itself is accessed through `&mut self`.
unsafe impl Send for CodeHeap {}

impl CodeHeap {
    #[must_use]
    pub fn new(source: Arc<PageSource>, config: CodeHeapConfig) -> Self {
        let page_size = source.page_size();
        Self {
            source,
            config,
            page_size,
            pages: Vec::new(),
            free_page_slots: Vec::new(),
            partial: Default::default(),
            full: Default::default(),
            decommitted: PageList::default(),
            large_objects: HashMap::new(),
            decommitted_large: HashMap::new(),
            live: HashMap::new(),
            metadata: SecondaryMetadataTracker::default(),
            all_code_in_pre_reserved: true,
        }
    }

    #[must_use]
    pub fn source(&self) -> &Arc<PageSource> {
        &self.source
    }

    /// Allocate `bytes` of code memory, plus `record_count` unwind records and
    /// `metadata_size` bytes of unwind data when the source carries metadata.
    ///
    /// The returned memory is execute-read; call
    /// [`protect_read_write`](Self::protect_read_write) to emit into it.
    pub fn allocate(
        &mut self,
        bytes: usize,
        record_count: u16,
        metadata_size: u16,
        prefer_pre_reserved: bool,
    ) -> Result<Allocation, HeapError> {
        if bytes == 0 {
            return Err(HeapError::ZeroSize);
        }
        let metadata_bytes = if record_count > 0 && self.source.allocates_secondary_metadata() {
            metadata_request_size(record_count, metadata_size)
        } else {
            0
        };
        let capacity = self.source.metadata_capacity_per_segment();
        if metadata_bytes > capacity {
            log::debug!("[codeheap] {metadata_bytes} bytes of metadata can never fit a {capacity}-byte segment arena");
            return Err(HeapError::MetadataCapacityExhausted { requested: metadata_bytes, capacity });
        }
        let bucket = classify_bucket(bytes);
        let allocation = if bucket.is_large() {
            self.allocate_large(bytes, record_count, metadata_size, metadata_bytes, prefer_pre_reserved)?
        } else {
            self.allocate_small(bucket, bytes, record_count, metadata_size, metadata_bytes, prefer_pre_reserved)?
        };
        log::trace!(
            "[codeheap] alloc {bytes} ({bucket:?}) -> {:p}{}",
            allocation.as_ptr(),
            if allocation.secondary_metadata().is_some() { " +metadata" } else { "" }
        );
        self.live.insert(allocation.address(), allocation.clone());
        Ok(allocation)
    }

    fn allocate_small(
        &mut self,
        bucket: BucketId,
        bytes: usize,
        record_count: u16,
        metadata_size: u16,
        metadata_bytes: usize,
        prefer_pre_reserved: bool,
    ) -> Result<Allocation, HeapError> {
        let source = Arc::clone(&self.source);
        let mut guard = source.lock();
        let granules = granules_for_bytes(bytes);
        let mut fresh_only = false;
        loop {
            let reuse = if fresh_only { None } else { self.find_page(bucket, prefer_pre_reserved) };
            let (id, created) = match reuse {
                Some(id) => (id, false),
                None => (self.new_page(&mut guard, bucket, prefer_pre_reserved, metadata_bytes)?, true),
            };

            let page = self.page_mut(id);
            let index = page.free_run(granules).ok_or(HeapError::OutOfMemory { bytes })?;
            page.mark_allocated(index, granules);
            let address = page.granule_address(index);
            let segment = page.segment;
            let had_metadata_room = guard.segment_can_allocate_metadata(segment);

            let attached = self.metadata.attach(
                &mut guard,
                segment,
                address.as_ptr() as usize,
                bytes,
                record_count,
                metadata_size,
            );
            match attached {
                Ok(metadata) => {
                    self.note_grant(segment);
                    self.update_fullness(&guard, id);
                    self.refresh_segment_if_changed(&guard, segment, had_metadata_room);
                    return Ok(Allocation::small(address, bytes, id, metadata));
                }
                Err(e) => {
                    // Roll back so the request leaves no trace on this page.
                    self.page_mut(id).mark_free(index, granules);
                    if created {
                        if let Err(release) = self.release_page(&mut guard, id) {
                            log::warn!("[codeheap] giving back fresh page failed: {release}");
                        }
                    } else {
                        self.update_fullness(&guard, id);
                    }
                    if matches!(e, HeapError::MetadataCapacityExhausted { .. }) && !fresh_only {
                        log::debug!("[codeheap] metadata full in {segment:?}, retrying on a fresh page");
                        fresh_only = true;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn allocate_large(
        &mut self,
        bytes: usize,
        record_count: u16,
        metadata_size: u16,
        metadata_bytes: usize,
        prefer_pre_reserved: bool,
    ) -> Result<Allocation, HeapError> {
        let page_count = bytes.div_ceil(self.page_size);
        let source = Arc::clone(&self.source);
        let mut guard = source.lock();

        let mut grant = guard.alloc_large_region(page_count, prefer_pre_reserved, metadata_bytes)?;
        let mut had_metadata_room = guard.segment_can_allocate_metadata(grant.segment);
        let metadata = match self.attach_large(&mut guard, grant, page_count, bytes, record_count, metadata_size) {
            Err(HeapError::MetadataCapacityExhausted { .. }) if grant.segment.is_pre_reserved() => {
                log::debug!("[codeheap] pre-reserved metadata full, moving {page_count}-page region to a regular segment");
                grant = guard.alloc_regular(page_count, metadata_bytes)?;
                had_metadata_room = guard.segment_can_allocate_metadata(grant.segment);
                self.attach_large(&mut guard, grant, page_count, bytes, record_count, metadata_size)?
            }
            other => other?,
        };
        self.note_grant(grant.segment);
        self.refresh_segment_if_changed(&guard, grant.segment, had_metadata_room);

        let key = grant.address.as_ptr() as usize;
        self.large_objects.insert(
            key,
            LargeObject {
                address: grant.address,
                segment: grant.segment,
                page_count,
                protection: PageProtection::EXECUTE_READ,
                decommitted: false,
            },
        );
        log::debug!("[codeheap] large object {:p}: {page_count} page(s) in {:?}", grant.address, grant.segment);
        Ok(Allocation::large(grant.address, bytes, grant.segment, page_count, metadata))
    }

    /// Attach metadata to a fresh large region, giving the region back if that
    /// fails.
    fn attach_large(
        &mut self,
        guard: &mut PageSourceGuard<'_>,
        grant: PageGrant,
        page_count: usize,
        bytes: usize,
        record_count: u16,
        metadata_size: u16,
    ) -> Result<Option<SecondaryMetadata>, HeapError> {
        let start = grant.address.as_ptr() as usize;
        match self
            .metadata
            .attach(guard, grant.segment, start, bytes, record_count, metadata_size)
        {
            Ok(metadata) => Ok(metadata),
            Err(e) => {
                if let Err(release) = guard.release_pages(grant.address, page_count, grant.segment) {
                    log::warn!("[codeheap] giving back region {:p} failed: {release}", grant.address);
                }
                Err(e)
            }
        }
    }

    /// Release `allocation`.
    ///
    /// Freed bytes are overwritten with trap instructions. An emptied page
    /// stays on its bucket's partial list until [`compact`](Self::compact).
    pub fn free(&mut self, allocation: &Allocation) -> Result<(), HeapError> {
        self.check_live(allocation)?;
        match allocation.kind {
            AllocationKind::Small { page } => self.free_small(allocation, page)?,
            AllocationKind::Large { .. } => self.free_large(allocation)?,
        }
        log::trace!("[codeheap] free {:p} ({} bytes)", allocation.as_ptr(), allocation.size());
        Ok(())
    }

    fn free_small(&mut self, allocation: &Allocation, id: PageId) -> Result<(), HeapError> {
        let address = allocation.address();
        let granules = granules_for_bytes(allocation.size());
        let source = Arc::clone(&self.source);
        let mut guard = source.lock();

        let page = self.page_mut(id);
        let index = page
            .granule_index_of(allocation.as_ptr())
            .ok_or(HeapError::NotInHeap { address })?;
        if !page.is_range_allocated(index, granules) {
            return Err(HeapError::DoubleFree { address });
        }
        let decommitted = page.decommitted;
        if decommitted {
            page.mark_free(index, granules);
        } else {
            ProtectionController::new(&source).with_writable(page, |page| {
                // Safety: the page is writable and the range belongs to this
                // allocation.
                unsafe { fill_with_traps(allocation.as_ptr(), granules * GRANULE_SIZE) };
                page.mark_free(index, granules);
            });
        }

        self.live.remove(&address);
        self.release_metadata(&mut guard, allocation)?;

        if !decommitted {
            self.update_fullness(&guard, id);
        } else if self.page(id).is_some_and(Page::is_empty) {
            self.release_page(&mut guard, id)?;
        }
        Ok(())
    }

    fn free_large(&mut self, allocation: &Allocation) -> Result<(), HeapError> {
        let address = allocation.address();
        let source = Arc::clone(&self.source);
        let mut guard = source.lock();

        let mut object = self
            .large_objects
            .remove(&address)
            .or_else(|| self.decommitted_large.remove(&address))
            .ok_or(HeapError::NotInHeap { address })?;
        if !object.decommitted {
            ProtectionController::new(&source).make_writable(&mut object);
        }

        self.live.remove(&address);
        self.release_metadata(&mut guard, allocation)?;
        if object.decommitted {
            guard.release_decommitted_pages(object.address, object.page_count, object.segment)
        } else {
            guard.release_pages(object.address, object.page_count, object.segment)
        }
    }

    /// Drop the physical backing of the page(s) under `allocation`.
    ///
    /// A small allocation decommits its whole page, so every allocation that
    /// shares it becomes unusable. They all stay live until freed and
    /// [`is_in_heap`](Self::is_in_heap) keeps reporting them. Decommitted
    /// pages are never handed out again.
    pub fn decommit(&mut self, allocation: &Allocation) -> Result<(), HeapError> {
        self.check_live(allocation)?;
        let address = allocation.address();
        match allocation.kind {
            AllocationKind::Small { page: id } => {
                let page = self.page(id).ok_or(HeapError::NotInHeap { address })?;
                if page.decommitted {
                    return Ok(());
                }
                // Safety: the page is a live grant from this source.
                unsafe { self.source.decommit_pages(page.address, 1, page.segment)? };
                self.move_to(id, PageListKind::Decommitted);
                let page = self.page_mut(id);
                page.decommitted = true;
                page.protection = PageProtection::NO_ACCESS;
            }
            AllocationKind::Large { .. } => {
                let Some(object) = self.large_objects.get(&address) else {
                    return Ok(());
                };
                // Safety: the region is a live grant from this source.
                unsafe {
                    self.source
                        .decommit_pages(object.address, object.page_count, object.segment)?;
                }
                if let Some(mut object) = self.large_objects.remove(&address) {
                    object.decommitted = true;
                    object.protection = PageProtection::NO_ACCESS;
                    self.decommitted_large.insert(address, object);
                }
            }
        }
        Ok(())
    }

    /// Release every allocation and page. Handles issued before stay invalid.
    pub fn free_all(&mut self) {
        let source = Arc::clone(&self.source);
        let mut guard = source.lock();
        let live = self.live.len();

        self.metadata.release_all(&mut guard);
        self.live.clear();
        for list in self.partial.iter_mut().chain(self.full.iter_mut()) {
            list.take_all();
        }
        self.decommitted.take_all();

        let mut released_pages = 0;
        for (index, slot) in self.pages.iter_mut().enumerate() {
            let Some(page) = slot.page.take() else {
                continue;
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free_page_slots.push(u32::try_from(index).unwrap_or(u32::MAX));
            let result = if page.decommitted {
                guard.release_decommitted_pages(page.address, 1, page.segment)
            } else {
                guard.release_pages(page.address, 1, page.segment)
            };
            if let Err(e) = result {
                log::error!("[codeheap] releasing page {:p} failed: {e}", page.address);
            }
            released_pages += 1;
        }

        let released_large = self.large_objects.len() + self.decommitted_large.len();
        for (_, object) in self.large_objects.drain().chain(self.decommitted_large.drain()) {
            let result = if object.decommitted {
                guard.release_decommitted_pages(object.address, object.page_count, object.segment)
            } else {
                guard.release_pages(object.address, object.page_count, object.segment)
            };
            if let Err(e) = result {
                log::error!("[codeheap] releasing large object {:p} failed: {e}", object.address);
            }
        }

        if released_pages + released_large > 0 {
            log::debug!(
                "[codeheap] free_all: {live} allocation(s), {released_pages} page(s), {released_large} large object(s)"
            );
        }
    }

    /// Return empty pages to the source, keeping up to
    /// `empty_pages_per_bucket` per bucket. Also drops decommitted pages that
    /// no longer hold anything. Returns the number of pages released.
    pub fn compact(&mut self) -> Result<usize, HeapError> {
        let source = Arc::clone(&self.source);
        let mut guard = source.lock();
        let keep = self.config.empty_pages_per_bucket;
        let mut released = 0;

        for bucket in BucketId::SMALL {
            let empty: Vec<PageId> = self.partial[bucket.index()]
                .iter()
                .chain(self.full[bucket.index()].iter())
                .filter(|&id| self.page(id).is_some_and(Page::is_empty))
                .collect();
            for id in empty.into_iter().skip(keep) {
                self.release_page(&mut guard, id)?;
                released += 1;
            }
        }

        let drained: Vec<PageId> = self
            .decommitted
            .iter()
            .filter(|&id| self.page(id).is_some_and(Page::is_empty))
            .collect();
        for id in drained {
            self.release_page(&mut guard, id)?;
            released += 1;
        }

        if released > 0 {
            log::debug!("[codeheap] compact released {released} page(s)");
        }
        Ok(released)
    }

    /// Whether `address` lies in a page or large region this heap tracks,
    /// decommitted ones included.
    #[must_use]
    pub fn is_in_heap(&self, address: *const u8) -> bool {
        let address = address as usize;
        self.pages
            .iter()
            .filter_map(|slot| slot.page.as_ref())
            .any(|page| page.contains(address))
            || self
                .large_objects
                .values()
                .chain(self.decommitted_large.values())
                .any(|object| object.contains(address, self.page_size))
    }

    /// Make the pages under `allocation` writable (and not executable) for
    /// emission. Returns the protection they had.
    ///
    /// For a small allocation this covers the whole page, so its neighbours
    /// cannot run until [`protect_execute_read_only`](Self::protect_execute_read_only).
    pub fn protect_read_write(&mut self, allocation: &Allocation) -> Result<PageProtection, HeapError> {
        self.check_live(allocation)?;
        let address = allocation.address();
        let source = Arc::clone(&self.source);
        let controller = ProtectionController::new(&source);
        match allocation.kind {
            AllocationKind::Small { page } => {
                let page = self.page_mut(page);
                if page.decommitted {
                    return Err(HeapError::Decommitted { address });
                }
                Ok(controller.make_writable(page))
            }
            AllocationKind::Large { .. } => {
                let object = self
                    .large_objects
                    .get_mut(&address)
                    .ok_or(HeapError::Decommitted { address })?;
                Ok(controller.make_writable(object))
            }
        }
    }

    /// Seal the pages under `allocation` as execute-read.
    pub fn protect_execute_read_only(&mut self, allocation: &Allocation) -> Result<(), HeapError> {
        self.check_live(allocation)?;
        let address = allocation.address();
        let source = Arc::clone(&self.source);
        let controller = ProtectionController::new(&source);
        match allocation.kind {
            AllocationKind::Small { page } => {
                let page = self.page_mut(page);
                if page.decommitted {
                    return Err(HeapError::Decommitted { address });
                }
                controller.make_execute_read_only(page, PageProtection::EXECUTE_READ);
            }
            AllocationKind::Large { .. } => {
                let object = self
                    .large_objects
                    .get_mut(&address)
                    .ok_or(HeapError::Decommitted { address })?;
                controller.make_execute_read_only(object, PageProtection::EXECUTE_READ);
            }
        }
        Ok(())
    }

    /// Unwind records of the live function containing `pc`.
    #[must_use]
    pub fn find_metadata(&self, pc: usize) -> Option<&SecondaryMetadata> {
        self.metadata.find(pc)
    }

    /// False once any code has been placed outside the pre-reserved region.
    #[must_use]
    pub fn all_code_in_pre_reserved_region(&self) -> bool {
        self.all_code_in_pre_reserved
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            decommitted_pages: self.decommitted.len(),
            large_objects: self.large_objects.len(),
            decommitted_large_objects: self.decommitted_large.len(),
            live_allocations: self.live.len(),
            metadata_records: self.metadata.len(),
            ..HeapStats::default()
        };
        for bucket in BucketId::SMALL {
            stats.partial_pages[bucket.index()] = self.partial[bucket.index()].len();
            stats.full_pages[bucket.index()] = self.full[bucket.index()].len();
        }
        stats.empty_pages = self
            .pages
            .iter()
            .filter_map(|slot| slot.page.as_ref())
            .filter(|page| !page.decommitted && page.is_empty())
            .count();
        stats
    }

    // ---------------------------------------------------------------------
    // Page table and lists
    // ---------------------------------------------------------------------

    fn page(&self, id: PageId) -> Option<&Page> {
        let slot = self.pages.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.page.as_ref()
    }

    /// Internal lookup; a stale id here is a bookkeeping bug.
    fn page_mut(&mut self, id: PageId) -> &mut Page {
        self.pages
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.page.as_mut())
            .unwrap_or_else(|| panic!("stale page handle {id:?}"))
    }

    fn insert_page(&mut self, page: Page) -> PageId {
        if let Some(index) = self.free_page_slots.pop() {
            let slot = &mut self.pages[index as usize];
            slot.page = Some(page);
            return PageId { index, generation: slot.generation };
        }
        let index = u32::try_from(self.pages.len()).unwrap_or(u32::MAX);
        self.pages.push(PageSlot { generation: 0, page: Some(page) });
        PageId { index, generation: 0 }
    }

    fn list_mut(&mut self, kind: PageListKind) -> &mut PageList {
        match kind {
            PageListKind::Partial(bucket) => &mut self.partial[bucket.index()],
            PageListKind::Full(bucket) => &mut self.full[bucket.index()],
            PageListKind::Decommitted => &mut self.decommitted,
        }
    }

    fn link(&mut self, id: PageId, kind: PageListKind) {
        let slot = self.list_mut(kind).push(id);
        let page = self.page_mut(id);
        page.list = kind;
        page.list_slot = slot;
    }

    fn unlink(&mut self, id: PageId) {
        let (kind, slot) = {
            let page = self.page_mut(id);
            (page.list, page.list_slot)
        };
        if let Some(moved) = self.list_mut(kind).remove(slot) {
            self.page_mut(moved).list_slot = slot;
        }
    }

    fn move_to(&mut self, id: PageId, kind: PageListKind) {
        self.unlink(id);
        self.link(id, kind);
    }

    /// Unlink `id`, forget it and give its memory back.
    fn release_page(&mut self, guard: &mut PageSourceGuard<'_>, id: PageId) -> Result<(), HeapError> {
        self.unlink(id);
        let slot = &mut self.pages[id.index as usize];
        let Some(page) = slot.page.take() else {
            return Ok(());
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free_page_slots.push(id.index);
        log::debug!("[codeheap] release page {:p} ({:?})", page.address, page.bucket);
        if page.decommitted {
            guard.release_decommitted_pages(page.address, 1, page.segment)
        } else {
            guard.release_pages(page.address, 1, page.segment)
        }
    }

    /// A partial page of `bucket` with a run for it, else a page of a larger
    /// bucket that still has one. Split pages move to `bucket`.
    fn find_page(&mut self, bucket: BucketId, prefer_pre_reserved: bool) -> Option<PageId> {
        let fits = |page: &Page| page.can_allocate(bucket);
        if let Some(id) = self.partial[bucket.index()]
            .iter()
            .find(|&id| self.page(id).is_some_and(fits))
        {
            return Some(id);
        }

        let split_from = |pre_reserved_only: bool| {
            bucket.larger().find_map(|larger| {
                self.partial[larger.index()].iter().find(|&id| {
                    self.page(id)
                        .is_some_and(|page| fits(page) && (!pre_reserved_only || page.segment.is_pre_reserved()))
                })
            })
        };
        let id = if prefer_pre_reserved {
            split_from(true).or_else(|| split_from(false))
        } else {
            split_from(false)
        }?;

        let from = self.page_mut(id).bucket;
        log::debug!("[codeheap] split {from:?} page into {bucket:?}");
        self.move_to(id, PageListKind::Partial(bucket));
        self.page_mut(id).bucket = bucket;
        Some(id)
    }

    fn new_page(
        &mut self,
        guard: &mut PageSourceGuard<'_>,
        bucket: BucketId,
        prefer_pre_reserved: bool,
        metadata_bytes: usize,
    ) -> Result<PageId, HeapError> {
        let grant = guard.alloc_page(prefer_pre_reserved, metadata_bytes)?;
        let id = self.insert_page(Page::new(grant.address, grant.segment, bucket, self.page_size));
        self.link(id, PageListKind::Partial(bucket));
        log::debug!("[codeheap] new {bucket:?} page {:p} in {:?}", grant.address, grant.segment);
        Ok(id)
    }

    /// Record where code was placed. Called once a request succeeds.
    fn note_grant(&mut self, segment: SegmentId) {
        if !segment.is_pre_reserved() && self.all_code_in_pre_reserved {
            log::debug!("[codeheap] code placed outside the pre-reserved region");
            self.all_code_in_pre_reserved = false;
        }
    }

    /// Move a page between its bucket's partial and full lists. A page is
    /// full when no granule is free, or when its segment has no room for
    /// more metadata.
    fn update_fullness(&mut self, guard: &PageSourceGuard<'_>, id: PageId) {
        let tracks_metadata = self.source.allocates_secondary_metadata();
        let Some(page) = self.page(id) else {
            return;
        };
        if page.decommitted {
            return;
        }
        let full = page.has_no_space() || (tracks_metadata && !guard.segment_can_allocate_metadata(page.segment));
        let target = match (page.list, full) {
            (PageListKind::Partial(bucket), true) => PageListKind::Full(bucket),
            (PageListKind::Full(bucket), false) => PageListKind::Partial(bucket),
            _ => return,
        };
        log::debug!("[codeheap] page {:p} -> {target:?}", page.address);
        self.move_to(id, target);
    }

    /// Drop `allocation`'s unwind records, then re-evaluate pages of the
    /// segment if that gave it metadata room again.
    fn release_metadata(&mut self, guard: &mut PageSourceGuard<'_>, allocation: &Allocation) -> Result<(), HeapError> {
        let Some(segment) = allocation.secondary_metadata().map(SecondaryMetadata::segment) else {
            return Ok(());
        };
        let had_metadata_room = guard.segment_can_allocate_metadata(segment);
        self.metadata.release(guard, allocation.address())?;
        self.refresh_segment_if_changed(guard, segment, had_metadata_room);
        Ok(())
    }

    /// Metadata capacity is shared by every page of a segment. When it runs
    /// out or comes back, move all of the segment's pages accordingly.
    fn refresh_segment_if_changed(&mut self, guard: &PageSourceGuard<'_>, segment: SegmentId, had_room: bool) {
        if !self.source.allocates_secondary_metadata() || guard.segment_can_allocate_metadata(segment) == had_room {
            return;
        }
        let siblings: Vec<PageId> = self
            .pages
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let page = slot.page.as_ref()?;
                (page.segment == segment).then(|| PageId {
                    index: u32::try_from(index).unwrap_or(u32::MAX),
                    generation: slot.generation,
                })
            })
            .collect();
        for id in siblings {
            self.update_fullness(guard, id);
        }
    }

    fn check_live(&self, allocation: &Allocation) -> Result<(), HeapError> {
        let address = allocation.address();
        match self.live.get(&address) {
            Some(live) if live == allocation => Ok(()),
            Some(_) => {
                log::warn!("[codeheap] stale handle for {address:#x}");
                Err(HeapError::DoubleFree { address })
            }
            None if self.is_in_heap(allocation.as_ptr().as_ptr()) => {
                log::warn!("[codeheap] {address:#x} is not live");
                Err(HeapError::DoubleFree { address })
            }
            None => {
                log::warn!("[codeheap] {address:#x} does not belong to this heap");
                Err(HeapError::NotInHeap { address })
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn page_of(&self, allocation: &Allocation) -> Option<&Page> {
        match allocation.kind {
            AllocationKind::Small { page } => self.page(page),
            AllocationKind::Large { .. } => None,
        }
    }

    /// Every live allocation, for invariant checks.
    #[cfg(test)]
    pub(crate) fn live_allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.live.values()
    }
}

impl Drop for CodeHeap {
    fn drop(&mut self) {
        self.free_all();
    }
}
