use super::error::HeapError;
use super::segment::{ProviderKind, SecondaryMetadata, Segment, SegmentId, metadata_request_size};
use super::stats::SourceCounters;
use super::vm::{PageProtection, PlatformVmOps, VmError, VmOps};
use crate::sync::{Mutex, MutexGuard};
use std::ptr::NonNull;

/// Tuning for a [`PageSource`].
#[derive(Clone, Debug)]
pub struct PageSourceConfig {
    /// Code pages in the pre-reserved region. `0` disables the region.
    pub pre_reserved_pages: usize,
    /// Code pages per regular segment.
    pub segment_pages: usize,
    /// Carve unwind metadata out of each segment.
    pub allocate_secondary_metadata: bool,
    /// Metadata pages appended to every segment when metadata is enabled.
    pub metadata_pages_per_segment: usize,
    /// Cap on regular code pages handed out at once. `None` means the OS is
    /// the only limit.
    pub max_regular_pages: Option<usize>,
}

impl Default for PageSourceConfig {
    fn default() -> Self {
        Self {
            pre_reserved_pages: 256,
            segment_pages: 32,
            allocate_secondary_metadata: true,
            metadata_pages_per_segment: 1,
            max_regular_pages: None,
        }
    }
}

/// Snapshot of a source's diagnostic counters, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub reserved: usize,
    pub committed: usize,
    pub metadata: usize,
}

/// Pages handed out by a provider, plus the segment that owns them.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PageGrant {
    pub address: NonNull<u8>,
    pub segment: SegmentId,
}

struct SegmentSlot {
    generation: u32,
    segment: Option<Segment>,
}

/// One of the two page suppliers. The variant is fixed at construction and
/// selects the reservation strategy:
///
/// - `Regular` reserves `segment_pages`-sized segments on demand, gives each
///   multi-page region a dedicated segment, and unmaps segments once unused.
/// - `PreReserved` reserves one region lazily and hands out runs from it until
///   it is exhausted. The region stays mapped until the source is dropped.
struct PageProvider {
    kind: ProviderKind,
    slots: Vec<SegmentSlot>,
    free_slots: Vec<u32>,
    page_size: usize,
    segment_pages: usize,
    metadata_pages: usize,
    page_limit: Option<usize>,
    pages_out: usize,
}

impl PageProvider {
    fn new(
        kind: ProviderKind,
        page_size: usize,
        segment_pages: usize,
        metadata_pages: usize,
        page_limit: Option<usize>,
    ) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free_slots: Vec::new(),
            page_size,
            segment_pages,
            metadata_pages,
            page_limit,
            pages_out: 0,
        }
    }

    fn segment(&self, id: SegmentId) -> Option<&Segment> {
        debug_assert_eq!(id.kind, self.kind);
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.segment.as_ref()
    }

    fn segment_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        debug_assert_eq!(id.kind, self.kind);
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.segment.as_mut()
    }

    fn install(&mut self, segment: Segment) -> SegmentId {
        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index as usize];
            slot.segment = Some(segment);
            return SegmentId { kind: self.kind, index, generation: slot.generation };
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(SegmentSlot { generation: 0, segment: Some(segment) });
        SegmentId { kind: self.kind, index, generation: 0 }
    }

    /// Unmap a regular segment once nothing references it.
    fn retire_if_unused(&mut self, id: SegmentId, counters: &SourceCounters) {
        if self.kind == ProviderKind::PreReserved {
            return;
        }
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return;
        };
        if slot.generation != id.generation || !slot.segment.as_ref().is_some_and(Segment::is_unused) {
            return;
        }
        if let Some(segment) = slot.segment.take() {
            counters.reserved.sub(segment.reserved_size());
            log::debug!(
                "[codeheap] release {:?} segment #{} ({} bytes)",
                self.kind,
                id.index,
                segment.reserved_size()
            );
            // Segment::drop unmaps the reservation.
            drop(segment);
            slot.generation = slot.generation.wrapping_add(1);
            self.free_slots.push(id.index);
        }
    }

    /// Hand out `count` contiguous committed pages, or `Ok(None)` when this
    /// provider has no room left. A non-zero `metadata_bytes` only accepts
    /// segments that can still fit a metadata block of that size.
    fn alloc_pages(
        &mut self,
        count: usize,
        metadata_bytes: usize,
        counters: &SourceCounters,
    ) -> Result<Option<PageGrant>, VmError> {
        if self.page_limit.is_some_and(|limit| self.pages_out + count > limit) {
            return Ok(None);
        }

        let shares_segments = self.kind == ProviderKind::PreReserved || count == 1;
        if shares_segments {
            for (index, slot) in self.slots.iter_mut().enumerate() {
                let Some(segment) = slot.segment.as_mut() else {
                    continue;
                };
                if segment.is_dedicated() || (metadata_bytes > 0 && !segment.can_fit_metadata(metadata_bytes)) {
                    continue;
                }
                let Some(page_index) = segment.find_free_run(count) else {
                    continue;
                };
                let address = segment.take_pages(page_index, count)?;
                self.pages_out += count;
                counters.committed.add(count * self.page_size);
                let segment = SegmentId {
                    kind: self.kind,
                    index: u32::try_from(index).unwrap_or(u32::MAX),
                    generation: slot.generation,
                };
                return Ok(Some(PageGrant { address, segment }));
            }
        }

        let (segment_pages, dedicated) = match self.kind {
            ProviderKind::PreReserved if self.slots.is_empty() && count <= self.segment_pages => {
                (self.segment_pages, false)
            }
            ProviderKind::PreReserved => return Ok(None),
            ProviderKind::Regular if count > 1 => (count, true),
            ProviderKind::Regular => (self.segment_pages.max(1), false),
        };

        let mut segment = Segment::reserve(segment_pages, self.metadata_pages, self.page_size, dedicated)?;
        let address = segment.take_pages(0, count)?;
        counters.reserved.add(segment.reserved_size());
        counters.committed.add(count * self.page_size);
        log::debug!(
            "[codeheap] reserve {:?} segment: {} code pages, {} metadata pages{}",
            self.kind,
            segment_pages,
            self.metadata_pages,
            if dedicated { " (dedicated)" } else { "" }
        );
        self.pages_out += count;
        let segment = self.install(segment);
        Ok(Some(PageGrant { address, segment }))
    }

    fn release_pages(
        &mut self,
        address: NonNull<u8>,
        count: usize,
        id: SegmentId,
        already_decommitted: bool,
        counters: &SourceCounters,
    ) -> Result<(), HeapError> {
        let page_size = self.page_size;
        let segment = self
            .segment_mut(id)
            .filter(|s| s.contains(address.as_ptr() as usize))
            .ok_or(HeapError::NotInHeap { address: address.as_ptr() as usize })?;
        segment.return_pages(address, count, already_decommitted)?;
        if !already_decommitted {
            counters.committed.sub(count * page_size);
        }
        self.pages_out = self.pages_out.saturating_sub(count);
        self.retire_if_unused(id, counters);
        Ok(())
    }

    fn release_all(&mut self, counters: &SourceCounters) {
        for slot in &mut self.slots {
            if let Some(segment) = slot.segment.take() {
                counters.reserved.sub(segment.reserved_size());
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.slots.clear();
        self.free_slots.clear();
        self.pages_out = 0;
    }
}

struct Providers {
    pre_reserved: PageProvider,
    regular: PageProvider,
}

impl Providers {
    fn route(&mut self, segment: SegmentId) -> &mut PageProvider {
        match segment.kind {
            ProviderKind::PreReserved => &mut self.pre_reserved,
            ProviderKind::Regular => &mut self.regular,
        }
    }

    fn route_ref(&self, segment: SegmentId) -> &PageProvider {
        match segment.kind {
            ProviderKind::PreReserved => &self.pre_reserved,
            ProviderKind::Regular => &self.regular,
        }
    }
}

/// Supplies code pages to any number of heaps.
///
/// Every operation that inspects and then mutates provider state goes through
/// a [`PageSourceGuard`] obtained from [`PageSource::lock`]. Decommit, protect
/// and the per-segment capability queries only touch the OS or immutable
/// state and run without the lock.
pub struct PageSource {
    config: PageSourceConfig,
    page_size: usize,
    providers: Mutex<Providers>,
    counters: SourceCounters,
}

impl Default for PageSource {
    fn default() -> Self {
        Self::new(PageSourceConfig::default())
    }
}

impl PageSource {
    #[must_use]
    pub fn new(mut config: PageSourceConfig) -> Self {
        if config.metadata_pages_per_segment == 0 {
            config.allocate_secondary_metadata = false;
        }
        let page_size = PlatformVmOps::page_size();
        let metadata_pages = if config.allocate_secondary_metadata {
            config.metadata_pages_per_segment
        } else {
            0
        };
        let providers = Providers {
            pre_reserved: PageProvider::new(
                ProviderKind::PreReserved,
                page_size,
                config.pre_reserved_pages,
                metadata_pages,
                None,
            ),
            regular: PageProvider::new(
                ProviderKind::Regular,
                page_size,
                config.segment_pages,
                metadata_pages,
                config.max_regular_pages,
            ),
        };
        Self {
            config,
            page_size,
            providers: Mutex::new(providers),
            counters: SourceCounters::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn config(&self) -> &PageSourceConfig {
        &self.config
    }

    /// Acquire the source lock.
    pub fn lock(&self) -> PageSourceGuard<'_> {
        PageSourceGuard {
            source: self,
            providers: self.providers.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
        }
    }

    /// Lock-free: fixed per segment.
    #[inline]
    #[must_use]
    pub fn is_pre_reserved_segment(&self, segment: SegmentId) -> bool {
        segment.is_pre_reserved()
    }

    /// Lock-free: fixed per source.
    #[inline]
    #[must_use]
    pub fn allocates_secondary_metadata(&self) -> bool {
        self.config.allocate_secondary_metadata
    }

    /// Bytes of metadata one segment can hold; a larger request never fits.
    #[must_use]
    pub fn metadata_capacity_per_segment(&self) -> usize {
        if self.allocates_secondary_metadata() {
            self.config.metadata_pages_per_segment * self.page_size
        } else {
            0
        }
    }

    /// Drop the physical backing of `page_count` pages, keeping the address
    /// range reserved. The pages stay owned by their segment until released
    /// through [`PageSourceGuard::release_decommitted_pages`].
    ///
    /// # Safety
    ///
    /// `address` must be the start of `page_count` pages handed out from
    /// `segment` and not yet released. Nothing may run or read the range
    /// afterwards.
    pub(crate) unsafe fn decommit_pages(
        &self,
        address: NonNull<u8>,
        page_count: usize,
        segment: SegmentId,
    ) -> Result<(), VmError> {
        let size = page_count * self.page_size;
        // Safety: caller guarantees the range is a live grant.
        unsafe { PlatformVmOps::decommit(address, size)? };
        self.counters.committed.sub(size);
        log::debug!(
            "[codeheap] decommit {page_count} page(s) at {address:p} ({:?} segment #{})",
            segment.kind,
            segment.index
        );
        Ok(())
    }

    /// Change the protection of committed pages.
    ///
    /// # Safety
    ///
    /// `address` must be the start of `page_count` committed pages handed out
    /// from `segment`.
    pub(crate) unsafe fn protect_pages(
        &self,
        address: NonNull<u8>,
        page_count: usize,
        segment: SegmentId,
        protection: PageProtection,
    ) -> Result<(), VmError> {
        log::trace!(
            "[codeheap] protect {page_count} page(s) at {address:p} ({:?} segment) -> {protection:?}",
            segment.kind
        );
        // Safety: caller guarantees the range is committed.
        unsafe { PlatformVmOps::protect(address, page_count * self.page_size, protection) }
    }

    #[must_use]
    pub fn stats(&self) -> SourceStats {
        SourceStats {
            reserved: self.counters.reserved.get(),
            committed: self.counters.committed.get(),
            metadata: self.counters.metadata.get(),
        }
    }
}

impl Drop for PageSource {
    fn drop(&mut self) {
        let mut providers = self.providers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        providers.pre_reserved.release_all(&self.counters);
        providers.regular.release_all(&self.counters);
    }
}

/// Exclusive access to a [`PageSource`]'s providers.
///
/// Holding the guard across a check-then-act sequence (probe a segment's
/// metadata capacity, then allocate from it) keeps other heaps out.
pub struct PageSourceGuard<'a> {
    source: &'a PageSource,
    providers: MutexGuard<'a, Providers>,
}

impl PageSourceGuard<'_> {
    #[must_use]
    pub fn source(&self) -> &PageSource {
        self.source
    }

    /// One page, from the pre-reserved region when `prefer_pre_reserved` and
    /// it has room, otherwise from the regular provider.
    pub(crate) fn alloc_page(
        &mut self,
        prefer_pre_reserved: bool,
        metadata_bytes: usize,
    ) -> Result<PageGrant, HeapError> {
        self.alloc_region(1, prefer_pre_reserved, metadata_bytes)
    }

    /// `page_count` contiguous pages with the same fallback policy as
    /// [`alloc_page`](Self::alloc_page). Regular regions get a dedicated
    /// segment.
    pub(crate) fn alloc_large_region(
        &mut self,
        page_count: usize,
        prefer_pre_reserved: bool,
        metadata_bytes: usize,
    ) -> Result<PageGrant, HeapError> {
        self.alloc_region(page_count, prefer_pre_reserved, metadata_bytes)
    }

    /// Skip the pre-reserved region and go straight to the regular provider.
    pub(crate) fn alloc_regular(&mut self, page_count: usize, metadata_bytes: usize) -> Result<PageGrant, HeapError> {
        self.alloc_region(page_count, false, metadata_bytes)
    }

    fn alloc_region(
        &mut self,
        page_count: usize,
        prefer_pre_reserved: bool,
        metadata_bytes: usize,
    ) -> Result<PageGrant, HeapError> {
        let counters = &self.source.counters;
        if prefer_pre_reserved {
            match self.providers.pre_reserved.alloc_pages(page_count, metadata_bytes, counters) {
                Ok(Some(grant)) => return Ok(grant),
                Ok(None) => {
                    log::warn!("[codeheap] pre-reserved region exhausted for {page_count} page(s), falling back");
                }
                Err(e) => {
                    log::warn!("[codeheap] pre-reserved region unavailable ({e}), falling back");
                }
            }
        }
        let bytes = page_count * self.source.page_size;
        match self.providers.regular.alloc_pages(page_count, metadata_bytes, counters) {
            Ok(Some(grant)) => Ok(grant),
            Ok(None) => {
                log::warn!("[codeheap] out of code memory ({bytes} bytes)");
                Err(HeapError::OutOfMemory { bytes })
            }
            Err(e @ (VmError::ReservationFailed(_) | VmError::CommitFailed(_))) => {
                log::warn!("[codeheap] out of code memory ({bytes} bytes): {e}");
                Err(HeapError::OutOfMemory { bytes })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Return committed pages to their provider.
    pub(crate) fn release_pages(
        &mut self,
        address: NonNull<u8>,
        page_count: usize,
        segment: SegmentId,
    ) -> Result<(), HeapError> {
        let counters = &self.source.counters;
        self.providers.route(segment).release_pages(address, page_count, segment, false, counters)
    }

    /// Return pages that already went through
    /// [`PageSource::decommit_pages`].
    pub(crate) fn release_decommitted_pages(
        &mut self,
        address: NonNull<u8>,
        page_count: usize,
        segment: SegmentId,
    ) -> Result<(), HeapError> {
        let counters = &self.source.counters;
        self.providers.route(segment).release_pages(address, page_count, segment, true, counters)
    }

    /// Whether `segment` has a metadata block left. Pages in segments that
    /// do not are treated as full.
    #[must_use]
    pub(crate) fn segment_can_allocate_metadata(&self, segment: SegmentId) -> bool {
        self.providers
            .route_ref(segment)
            .segment(segment)
            .is_some_and(Segment::can_allocate_metadata)
    }

    pub(crate) fn alloc_secondary_metadata(
        &mut self,
        segment: SegmentId,
        function_start: usize,
        function_size: usize,
        record_count: u16,
        metadata_size: u16,
    ) -> Result<SecondaryMetadata, HeapError> {
        let counters = &self.source.counters;
        let requested = metadata_request_size(record_count, metadata_size);
        let owner = self
            .providers
            .route(segment)
            .segment_mut(segment)
            .ok_or(HeapError::NotInHeap { address: function_start })?;
        let capacity = owner.metadata().map_or(0, |m| m.capacity() - m.used());
        let metadata = owner
            .alloc_metadata(segment, function_start, function_size, record_count, metadata_size)
            .ok_or(HeapError::MetadataCapacityExhausted { requested, capacity })?;
        counters.metadata.add(metadata.size());
        Ok(metadata)
    }

    pub(crate) fn release_secondary_metadata(&mut self, metadata: &SecondaryMetadata) -> Result<(), HeapError> {
        let counters = &self.source.counters;
        let segment = metadata.segment();
        let provider = self.providers.route(segment);
        let owner = provider
            .segment_mut(segment)
            .ok_or(HeapError::NotInHeap { address: metadata.function_range().start })?;
        owner.release_metadata(metadata);
        counters.metadata.sub(metadata.size());
        provider.retire_if_unused(segment, counters);
        Ok(())
    }

    /// Segments currently reserved by the provider of `kind`.
    #[must_use]
    pub fn segment_count(&self, kind: ProviderKind) -> usize {
        let provider = match kind {
            ProviderKind::PreReserved => &self.providers.pre_reserved,
            ProviderKind::Regular => &self.providers.regular,
        };
        provider.slots.iter().filter(|s| s.segment.is_some()).count()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn small_config() -> PageSourceConfig {
        PageSourceConfig {
            pre_reserved_pages: 4,
            segment_pages: 4,
            ..PageSourceConfig::default()
        }
    }

    #[test]
    fn test_alloc_page_prefers_pre_reserved() {
        let source = PageSource::new(small_config());
        let mut guard = source.lock();
        let grant = guard.alloc_page(true, 0).unwrap();
        assert!(source.is_pre_reserved_segment(grant.segment));
        let grant = guard.alloc_page(false, 0).unwrap();
        assert!(!source.is_pre_reserved_segment(grant.segment));
        assert_eq!(guard.segment_count(ProviderKind::PreReserved), 1);
        assert_eq!(guard.segment_count(ProviderKind::Regular), 1);
    }

    #[test]
    fn test_pre_reserved_exhaustion_falls_back() {
        let source = PageSource::new(small_config());
        let mut guard = source.lock();
        for _ in 0..4 {
            let grant = guard.alloc_page(true, 0).unwrap();
            assert!(grant.segment.is_pre_reserved());
        }
        let grant = guard.alloc_page(true, 0).unwrap();
        assert_eq!(grant.segment.kind(), ProviderKind::Regular);
    }

    #[test]
    fn test_disabled_pre_reserved_region() {
        let source = PageSource::new(PageSourceConfig { pre_reserved_pages: 0, ..small_config() });
        let mut guard = source.lock();
        let grant = guard.alloc_page(true, 0).unwrap();
        assert_eq!(grant.segment.kind(), ProviderKind::Regular);
        assert_eq!(guard.segment_count(ProviderKind::PreReserved), 0);
    }

    #[test]
    fn test_regular_limit_reports_oom() {
        let source = PageSource::new(PageSourceConfig {
            pre_reserved_pages: 0,
            max_regular_pages: Some(2),
            ..small_config()
        });
        let mut guard = source.lock();
        let a = guard.alloc_page(false, 0).unwrap();
        let _b = guard.alloc_page(false, 0).unwrap();
        let err = guard.alloc_page(false, 0).unwrap_err();
        assert!(matches!(err, HeapError::OutOfMemory { .. }));

        guard.release_pages(a.address, 1, a.segment).unwrap();
        assert!(guard.alloc_page(false, 0).is_ok(), "released page frees quota");
    }

    #[test]
    #[cfg(not(miri))]
    fn test_commit_failure_reports_oom() {
        use crate::memory::vm::fault;

        let source = PageSource::new(PageSourceConfig { pre_reserved_pages: 0, ..small_config() });
        let mut guard = source.lock();

        // Fresh segment: committing its metadata pages fails.
        fault::fail_next_commits(1);
        let err = guard.alloc_page(false, 0).unwrap_err();
        assert!(matches!(err, HeapError::OutOfMemory { .. }), "{err}");
        assert!(err.is_recoverable());
        assert_eq!(source.stats().reserved, 0, "failed reservation is unmapped");

        // Existing segment: committing the code page fails.
        let first = guard.alloc_page(false, 0).unwrap();
        let before = source.stats();
        fault::fail_next_commits(1);
        let err = guard.alloc_page(false, 0).unwrap_err();
        assert!(matches!(err, HeapError::OutOfMemory { .. }), "{err}");
        assert_eq!(source.stats(), before);

        let second = guard.alloc_page(false, 0).unwrap();
        assert_eq!(second.segment, first.segment);
    }

    #[test]
    fn test_large_region_gets_dedicated_segment() {
        let source = PageSource::new(PageSourceConfig { pre_reserved_pages: 0, ..small_config() });
        let mut guard = source.lock();
        let region = guard.alloc_large_region(3, false, 0).unwrap();
        let page = guard.alloc_page(false, 0).unwrap();
        assert_ne!(region.segment, page.segment, "single pages never share a dedicated segment");
        assert_eq!(guard.segment_count(ProviderKind::Regular), 2);

        guard.release_pages(region.address, 3, region.segment).unwrap();
        assert_eq!(guard.segment_count(ProviderKind::Regular), 1, "unused segment is unmapped");
    }

    #[test]
    fn test_release_unmaps_and_invalidates_handle() {
        let source = PageSource::new(PageSourceConfig { pre_reserved_pages: 0, ..small_config() });
        let before = source.stats();
        let mut guard = source.lock();
        let grant = guard.alloc_page(false, 0).unwrap();
        assert!(source.stats().reserved > before.reserved);
        assert_eq!(source.stats().committed, before.committed + source.page_size());

        guard.release_pages(grant.address, 1, grant.segment).unwrap();
        assert_eq!(source.stats(), before);

        // The slot was recycled with a new generation; the old handle is stale.
        let err = guard.release_pages(grant.address, 1, grant.segment).unwrap_err();
        assert!(matches!(err, HeapError::NotInHeap { .. }));
    }

    #[test]
    fn test_decommit_then_release_decommitted() {
        let source = PageSource::new(PageSourceConfig { pre_reserved_pages: 0, ..small_config() });
        let mut guard = source.lock();
        let grant = guard.alloc_page(false, 0).unwrap();
        // Safety: Test code; the grant is live.
        unsafe { source.decommit_pages(grant.address, 1, grant.segment).unwrap() };
        assert_eq!(source.stats().committed, 0);
        guard.release_decommitted_pages(grant.address, 1, grant.segment).unwrap();
        assert_eq!(guard.segment_count(ProviderKind::Regular), 0);
    }

    #[test]
    fn test_protect_pages_round_trip() {
        let source = PageSource::new(small_config());
        let mut guard = source.lock();
        let grant = guard.alloc_page(true, 0).unwrap();
        // Safety: Test code; the grant is committed.
        unsafe {
            source
                .protect_pages(grant.address, 1, grant.segment, PageProtection::READ_WRITE)
                .unwrap();
            grant.address.as_ptr().write(0xC3);
            source
                .protect_pages(grant.address, 1, grant.segment, PageProtection::EXECUTE_READ)
                .unwrap();
            assert_eq!(grant.address.as_ptr().read(), 0xC3);
        }
    }

    #[test]
    fn test_secondary_metadata_keeps_segment_alive() {
        let source = PageSource::new(PageSourceConfig { pre_reserved_pages: 0, ..small_config() });
        let mut guard = source.lock();
        let grant = guard.alloc_page(false, 64).unwrap();
        assert!(guard.segment_can_allocate_metadata(grant.segment));

        let md = guard
            .alloc_secondary_metadata(grant.segment, grant.address.as_ptr() as usize, 256, 1, 32)
            .unwrap();
        assert_eq!(source.stats().metadata, md.size());

        guard.release_pages(grant.address, 1, grant.segment).unwrap();
        assert_eq!(guard.segment_count(ProviderKind::Regular), 1, "live metadata pins the segment");
        guard.release_secondary_metadata(&md).unwrap();
        assert_eq!(guard.segment_count(ProviderKind::Regular), 0);
        assert_eq!(source.stats().metadata, 0);
    }

    #[test]
    fn test_metadata_exhaustion_is_reported() {
        let source = PageSource::new(PageSourceConfig { pre_reserved_pages: 0, ..small_config() });
        let mut guard = source.lock();
        let grant = guard.alloc_page(false, 64).unwrap();
        let start = grant.address.as_ptr() as usize;
        let mut blocks = Vec::new();
        let err = loop {
            match guard.alloc_secondary_metadata(grant.segment, start, 128, 4, 1024) {
                Ok(md) => blocks.push(md),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, HeapError::MetadataCapacityExhausted { .. }));
        assert!(!blocks.is_empty());
        for md in &blocks {
            guard.release_secondary_metadata(md).unwrap();
        }
        guard.release_pages(grant.address, 1, grant.segment).unwrap();
    }

    #[test]
    fn test_metadata_disabled_by_config() {
        let source = PageSource::new(PageSourceConfig {
            allocate_secondary_metadata: false,
            ..small_config()
        });
        assert!(!source.allocates_secondary_metadata());
        let mut guard = source.lock();
        let grant = guard.alloc_page(false, 0).unwrap();
        assert!(!guard.segment_can_allocate_metadata(grant.segment));
    }

    #[test]
    fn test_drop_releases_everything() {
        let source = PageSource::new(small_config());
        {
            let mut guard = source.lock();
            guard.alloc_page(true, 0).unwrap();
            guard.alloc_large_region(2, false, 0).unwrap();
        }
        drop(source);
    }
}
