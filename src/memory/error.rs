use super::vm::VmError;

/// Failures surfaced by [`CodeHeap`](super::heap::CodeHeap).
///
/// `OutOfMemory` and `MetadataCapacityExhausted` are the recoverable ones:
/// free something (or `compact`) and retry. The rest indicate a caller bug.
#[derive(Debug, thiserror::Error)]
pub enum HeapError {
    #[error("out of code memory for a {bytes}-byte request")]
    OutOfMemory { bytes: usize },

    #[error("secondary metadata of {requested} bytes does not fit (segment capacity {capacity})")]
    MetadataCapacityExhausted { requested: usize, capacity: usize },

    #[error("zero-byte code allocation")]
    ZeroSize,

    #[error("address {address:#x} is not a live allocation of this heap")]
    NotInHeap { address: usize },

    #[error("address {address:#x} was already freed")]
    DoubleFree { address: usize },

    #[error("allocation at {address:#x} is decommitted")]
    Decommitted { address: usize },

    #[error(transparent)]
    Vm(#[from] VmError),
}

impl HeapError {
    /// True for conditions a caller may recover from by releasing memory.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HeapError::OutOfMemory { .. } | HeapError::MetadataCapacityExhausted { .. }
        )
    }
}
