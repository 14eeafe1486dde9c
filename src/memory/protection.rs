//! Write-xor-execute sequencing for code pages.
//!
//! Code memory is `EXECUTE_READ` whenever the heap is not inside one of its
//! own mutations. Free flips a page to `READ_WRITE`, poisons the freed bytes,
//! and flips it back before returning.

use super::page::Page;
use super::page_source::PageSource;
use super::segment::SegmentId;
use super::vm::PageProtection;
use std::ptr::NonNull;

/// Something whose pages can change protection as one unit: a bucketed page
/// or a large region.
pub(crate) trait ProtectTarget {
    fn base(&self) -> NonNull<u8>;
    fn page_count(&self) -> usize;
    fn segment(&self) -> SegmentId;
    fn protection(&self) -> PageProtection;
    fn set_protection(&mut self, protection: PageProtection);
    /// Decommitted memory has no backing to protect.
    fn is_decommitted(&self) -> bool;
}

impl ProtectTarget for Page {
    fn base(&self) -> NonNull<u8> {
        self.address
    }

    fn page_count(&self) -> usize {
        1
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

pub(crate) struct ProtectionController<'s> {
    source: &'s PageSource,
}

impl<'s> ProtectionController<'s> {
    pub fn new(source: &'s PageSource) -> Self {
        Self { source }
    }

    /// Make `target` writable and non-executable. Returns the flags it had.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses the change.
    pub fn make_writable<T: ProtectTarget>(&self, target: &mut T) -> PageProtection {
        let previous = target.protection();
        if previous != PageProtection::READ_WRITE {
            self.apply(target, PageProtection::READ_WRITE);
        }
        previous
    }

    /// Put `target` back to `restore`, normally the value
    /// [`make_writable`](Self::make_writable) returned.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses the change or `restore` is writable and
    /// executable at once.
    pub fn make_execute_read_only<T: ProtectTarget>(&self, target: &mut T, restore: PageProtection) {
        if target.protection() != restore {
            self.apply(target, restore);
        }
    }

    /// Run `f` with `target` writable, then restore its previous flags.
    pub fn with_writable<T: ProtectTarget, R>(&self, target: &mut T, f: impl FnOnce(&mut T) -> R) -> R {
        let previous = self.make_writable(target);
        let out = f(target);
        self.make_execute_read_only(target, previous);
        out
    }

    fn apply<T: ProtectTarget>(&self, target: &mut T, protection: PageProtection) {
        debug_assert!(!target.is_decommitted(), "protecting decommitted memory");
        // Safety: targets only describe committed pages handed out by this
        // source.
        let result = unsafe {
            self.source
                .protect_pages(target.base(), target.page_count(), target.segment(), protection)
        };
        if let Err(e) = result {
            log::error!(
                "[codeheap] protect {:p} ({} page(s)) to {protection:?} failed: {e}",
                target.base(),
                target.page_count()
            );
            panic!(
                "failed to change protection of code region {:p} to {protection:?}: {e}",
                target.base()
            );
        }
        target.set_protection(protection);
    }
}

/// Overwrite freed code with the target's breakpoint instruction so a stale
/// jump traps instead of running leftovers.
///
/// # Safety
///
/// `ptr..ptr + len` must be writable and `len` a multiple of 4.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub(crate) unsafe fn fill_with_traps(ptr: NonNull<u8>, len: usize) {
    // int3
    // Safety: caller guarantees the range is writable.
    unsafe { ptr.as_ptr().write_bytes(0xCC, len) };
}

/// See the x86 variant.
///
/// # Safety
///
/// `ptr..ptr + len` must be writable and `len` a multiple of 4.
#[cfg(target_arch = "aarch64")]
pub(crate) unsafe fn fill_with_traps(ptr: NonNull<u8>, len: usize) {
    const BRK_0: u32 = 0xD420_0000;
    let words = ptr.as_ptr().cast::<u32>();
    for i in 0..len / 4 {
        // Safety: caller guarantees the range is writable; granules are
        // 128-byte aligned.
        unsafe { words.add(i).write(BRK_0.to_le()) };
    }
}

/// See the x86 variant.
///
/// # Safety
///
/// `ptr..ptr + len` must be writable.
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) unsafe fn fill_with_traps(ptr: NonNull<u8>, len: usize) {
    // Safety: caller guarantees the range is writable.
    unsafe { ptr.as_ptr().write_bytes(0, len) };
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::bucket::BucketId;
    use crate::memory::page_source::PageSourceConfig;

    fn page_from(source: &PageSource) -> Page {
        let grant = source.lock().alloc_page(false, 0).unwrap();
        Page::new(grant.address, grant.segment, BucketId::Bucket256, source.page_size())
    }

    #[test]
    fn test_make_writable_returns_previous() {
        let source = PageSource::new(PageSourceConfig::default());
        let controller = ProtectionController::new(&source);
        let mut page = page_from(&source);
        assert_eq!(page.protection, PageProtection::EXECUTE_READ);

        let previous = controller.make_writable(&mut page);
        assert_eq!(previous, PageProtection::EXECUTE_READ);
        assert_eq!(page.protection, PageProtection::READ_WRITE);
        // Safety: Test code; page is writable.
        unsafe { page.address.as_ptr().write(0x90) };

        // Already writable: reports READ_WRITE so the caller restores that.
        assert_eq!(controller.make_writable(&mut page), PageProtection::READ_WRITE);

        controller.make_execute_read_only(&mut page, previous);
        assert_eq!(page.protection, PageProtection::EXECUTE_READ);
        // Safety: Test code; page is readable.
        assert_eq!(unsafe { page.address.as_ptr().read() }, 0x90);
    }

    #[test]
    fn test_with_writable_restores() {
        let source = PageSource::new(PageSourceConfig::default());
        let controller = ProtectionController::new(&source);
        let mut page = page_from(&source);
        let len = page.size();
        controller.with_writable(&mut page, |p| {
            assert_eq!(p.protection, PageProtection::READ_WRITE);
            // Safety: Test code; page is writable.
            unsafe { fill_with_traps(p.address, len) };
        });
        assert_eq!(page.protection, PageProtection::EXECUTE_READ);

        // Safety: Test code; page is readable.
        let bytes = unsafe { std::slice::from_raw_parts(page.address.as_ptr(), len) };
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        assert!(bytes.iter().all(|&b| b == 0xCC));
        #[cfg(target_arch = "aarch64")]
        assert_eq!(&bytes[..4], &0xD420_0000u32.to_le_bytes());
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "failed to change protection")]
    fn test_write_execute_restore_is_fatal() {
        let source = PageSource::new(PageSourceConfig::default());
        let controller = ProtectionController::new(&source);
        let mut page = page_from(&source);
        let wx = PageProtection::READ_WRITE | PageProtection::EXECUTE;
        controller.make_execute_read_only(&mut page, wx);
    }
}
