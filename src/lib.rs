#[cfg(not(target_pointer_width = "64"))]
compile_error!("codeheap supports only 64-bit targets.");

#[cfg(not(any(unix, loom, miri)))]
compile_error!("codeheap needs a unix virtual-memory backend (or cfg(loom)/miri for the mock).");

pub(crate) mod sync;

// public module; the pieces inside stay pub(crate) and are re-exported below
pub mod memory;

// heap
pub use memory::heap::{CodeHeap, CodeHeapConfig, HeapStats};

// page supply
pub use memory::page_source::{PageSource, PageSourceConfig, PageSourceGuard, SourceStats};
pub use memory::segment::{ProviderKind, SecondaryMetadata, SegmentId, UNWIND_RECORD_SIZE};

// allocations
pub use memory::allocation::Allocation;
pub use memory::bucket::{BucketId, GRANULE_SIZE, MAX_SMALL_SIZE, classify_bucket};

// errors
pub use memory::error::HeapError;
pub use memory::vm::{PageProtection, VmError};
