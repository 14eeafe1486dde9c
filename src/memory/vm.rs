use bitflags::bitflags;
use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(std::io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(std::io::Error),
    #[error("VM decommit failed: {0}")]
    DecommitFailed(std::io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(std::io::Error),
    #[error("VM protect ({protection:?}) failed: {source}")]
    ProtectFailed {
        protection: PageProtection,
        source: std::io::Error,
    },
    #[error("refusing to map memory both writable and executable ({0:?})")]
    WriteExecuteViolation(PageProtection),
}

bitflags! {
    /// Access rights of a committed range of code pages.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct PageProtection: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const NO_ACCESS = 0;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const EXECUTE_READ = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl PageProtection {
    /// True for any combination that allows writing and executing at once.
    #[inline]
    #[must_use]
    pub fn violates_wx(self) -> bool {
        self.contains(Self::WRITE | Self::EXECUTE)
    }
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages, read-write) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Change the access rights of a committed range.
    ///
    /// Rejects writable+executable requests with
    /// [`VmError::WriteExecuteViolation`] before touching the OS.
    unsafe fn protect(
        ptr: NonNull<u8>,
        size: usize,
        protection: PageProtection,
    ) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

/// Test-only failure injection for the unix backend.
#[cfg(all(test, unix, not(any(loom, miri))))]
pub(crate) mod fault {
    use std::cell::Cell;

    thread_local! {
        static FAILING_COMMITS: Cell<usize> = const { Cell::new(0) };
    }

    /// Make the next `count` commits on this thread fail with `ENOMEM`.
    pub(crate) fn fail_next_commits(count: usize) {
        FAILING_COMMITS.with(|c| c.set(count));
    }

    pub(super) fn take_commit_failure() -> bool {
        FAILING_COMMITS.with(|c| {
            let left = c.get();
            if left > 0 {
                c.set(left - 1);
            }
            left > 0
        })
    }
}

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PageProtection, PlatformVmOps, VmError, VmOps};
    use std::io;

    fn prot_bits(protection: PageProtection) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if protection.contains(PageProtection::READ) {
            prot |= libc::PROT_READ;
        }
        if protection.contains(PageProtection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if protection.contains(PageProtection::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            #[cfg(test)]
            if super::fault::take_commit_failure() {
                return Err(VmError::CommitFailed(io::Error::from_raw_os_error(libc::ENOMEM)));
            }

            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            // Safety: FFI call to madvise.
            unsafe {
                // Code pages are committed one at a time right before the
                // emitter writes into them; fault them in up front.
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED)
            };

            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_FREE marks pages for lazy reclamation; mprotect(PROT_NONE)
            // removes access so stale code can never run from a decommitted
            // page. Recommit goes through commit() (mprotect RW).
            //
            // MADV_FREE: macOS (all versions), Linux >= 4.5.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn protect(
            ptr: NonNull<u8>,
            size: usize,
            protection: PageProtection,
        ) -> Result<(), VmError> {
            if protection.violates_wx() {
                return Err(VmError::WriteExecuteViolation(protection));
            }
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, prot_bits(protection))
            } != 0
            {
                return Err(VmError::ProtectFailed {
                    protection,
                    source: io::Error::last_os_error(),
                });
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls: loom runs inside a
// single OS process with its own scheduler. Every "reservation" is a plain
// heap allocation (via `std::alloc::alloc_zeroed` / `dealloc`).
//
// `commit`, `decommit` and `protect` are no-ops: the memory is always
// accessible once reserved. `protect` still enforces W^X so the heap's
// sequencing is checked under the model.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // no-op; memory remains accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    unsafe fn protect(
        _ptr: NonNull<u8>,
        _size: usize,
        protection: PageProtection,
    ) -> Result<(), VmError> {
        if protection.violates_wx() {
            return Err(VmError::WriteExecuteViolation(protection));
        }
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}
