use super::error::HeapError;
use super::page_source::PageSourceGuard;
use super::segment::{SecondaryMetadata, SegmentId};
use std::collections::BTreeMap;

/// Unwind records of live allocations, keyed by function start.
///
/// Lookups by program counter walk the map backwards from the pc, which is
/// what a stack walker needs.
#[derive(Default)]
pub(crate) struct SecondaryMetadataTracker {
    by_function: BTreeMap<usize, SecondaryMetadata>,
}

impl SecondaryMetadataTracker {
    /// Reserve `record_count` unwind records plus `metadata_size` bytes in
    /// `segment` for the code at `function_start`.
    ///
    /// Returns `Ok(None)` when nothing was asked for or the source does not
    /// carry metadata.
    pub fn attach(
        &mut self,
        guard: &mut PageSourceGuard<'_>,
        segment: SegmentId,
        function_start: usize,
        function_size: usize,
        record_count: u16,
        metadata_size: u16,
    ) -> Result<Option<SecondaryMetadata>, HeapError> {
        if record_count == 0 || !guard.source().allocates_secondary_metadata() {
            return Ok(None);
        }
        let metadata =
            guard.alloc_secondary_metadata(segment, function_start, function_size, record_count, metadata_size)?;
        let previous = self.by_function.insert(function_start, metadata.clone());
        debug_assert!(previous.is_none(), "function {function_start:#x} already has metadata");
        Ok(Some(metadata))
    }

    /// Release the records attached to `function_start`, if any.
    pub fn release(&mut self, guard: &mut PageSourceGuard<'_>, function_start: usize) -> Result<(), HeapError> {
        match self.by_function.remove(&function_start) {
            Some(metadata) => guard.release_secondary_metadata(&metadata),
            None => Ok(()),
        }
    }

    /// Records whose function range contains `pc`.
    pub fn find(&self, pc: usize) -> Option<&SecondaryMetadata> {
        self.by_function
            .range(..=pc)
            .next_back()
            .map(|(_, md)| md)
            .filter(|md| md.function_range().contains(&pc))
    }

    pub fn len(&self) -> usize {
        self.by_function.len()
    }

    /// Release everything. Failures are logged and skipped.
    pub fn release_all(&mut self, guard: &mut PageSourceGuard<'_>) {
        for (start, metadata) in std::mem::take(&mut self.by_function) {
            if let Err(e) = guard.release_secondary_metadata(&metadata) {
                log::warn!("[codeheap] dropping metadata of {start:#x} failed: {e}");
            }
        }
    }
}
