/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// The only shared mutable state in the crate is the `PageSource` provider
/// lock and its stat counters; heaps are single-writer. These models check
/// that heaps sharing one source never hand out the same page and that the
/// counters settle once everything is returned.
///
/// # Design notes
///
///   - Thread counts kept to 2 (state space is exponential).
///   - One or two operations per thread.
///   - Every model builds a fresh `PageSource`; under cfg(loom) it reserves
///     through the heap-backed `VmOps` mock.
///   - Sources are configured with tiny segments so the fallback paths run
///     without looping over many pages.
#[cfg(loom)]
mod tests {
    use crate::memory::heap::{CodeHeap, CodeHeapConfig};
    use crate::memory::page_source::{PageSource, PageSourceConfig};
    use crate::memory::segment::ProviderKind;
    use crate::sync::Arc;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    fn tiny_source(pre_reserved_pages: usize) -> Arc<PageSource> {
        Arc::new(PageSource::new(PageSourceConfig {
            pre_reserved_pages,
            segment_pages: 2,
            ..PageSourceConfig::default()
        }))
    }

    // =====================================================================
    // 1. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::memory::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });

            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // 10 + 5 - 3 + 8 = 20
            assert_eq!(counter.get(), 20);
        });
    }

    // =====================================================================
    // 2. PageSource: raw page grants
    // =====================================================================

    /// Two threads take and return a page through the provider lock.
    #[test]
    fn loom_page_source_alloc_release() {
        bounded(2).check(|| {
            let source = tiny_source(0);
            let s1 = source.clone();
            let s2 = source.clone();

            let t1 = loom::thread::spawn(move || {
                let mut guard = s1.lock();
                let grant = guard.alloc_page(false, 0).unwrap();
                guard.release_pages(grant.address, 1, grant.segment).unwrap();
            });

            let t2 = loom::thread::spawn(move || {
                let mut guard = s2.lock();
                let grant = guard.alloc_page(false, 0).unwrap();
                guard.release_pages(grant.address, 1, grant.segment).unwrap();
            });

            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(source.stats().committed, 0);
            assert_eq!(source.lock().segment_count(ProviderKind::Regular), 0);
        });
    }

    // =====================================================================
    // 3. CodeHeap: two heaps on one source
    // =====================================================================

    /// Both heaps prefer a one-page pre-reserved region: exactly one gets it,
    /// the other falls back to a regular segment.
    #[test]
    fn loom_two_heaps_race_for_pre_reserved_page() {
        bounded(2).check(|| {
            let source = tiny_source(1);
            let s1 = source.clone();
            let s2 = source.clone();

            let t1 = loom::thread::spawn(move || {
                let mut heap = CodeHeap::new(s1, CodeHeapConfig::default());
                let a = heap.allocate(256, 1, 8, true).unwrap();
                (heap, a)
            });

            let t2 = loom::thread::spawn(move || {
                let mut heap = CodeHeap::new(s2, CodeHeapConfig::default());
                let a = heap.allocate(256, 1, 8, true).unwrap();
                (heap, a)
            });

            let (h1, a1) = t1.join().unwrap();
            let (h2, a2) = t2.join().unwrap();

            assert_ne!(a1.address(), a2.address());
            assert!(
                h1.all_code_in_pre_reserved_region() != h2.all_code_in_pre_reserved_region(),
                "exactly one heap lands in the pre-reserved page"
            );
            assert_eq!(source.stats().metadata, a1.secondary_metadata().unwrap().size() * 2);

            drop(h1);
            drop(h2);
            let stats = source.stats();
            assert_eq!(stats.committed, 0);
            assert_eq!(stats.metadata, 0);
        });
    }

    /// One heap frees while the other allocates; the freed page is returned
    /// and may be reused, but never while still owned.
    #[test]
    fn loom_free_races_with_allocate() {
        bounded(2).check(|| {
            let source = tiny_source(0);
            let mut owner = CodeHeap::new(source.clone(), CodeHeapConfig { empty_pages_per_bucket: 0 });
            let held = owner.allocate(6000, 0, 0, false).unwrap();
            let s2 = source.clone();

            let t1 = loom::thread::spawn(move || {
                owner.free(&held).unwrap();
                owner
            });

            let t2 = loom::thread::spawn(move || {
                let mut heap = CodeHeap::new(s2, CodeHeapConfig::default());
                let a = heap.allocate(128, 0, 0, false).unwrap();
                (heap, a)
            });

            let owner = t1.join().unwrap();
            let (heap, a) = t2.join().unwrap();
            assert!(heap.is_in_heap(a.as_ptr().as_ptr()));
            assert!(!owner.is_in_heap(a.as_ptr().as_ptr()));

            drop(owner);
            drop(heap);
            assert_eq!(source.stats().committed, 0);
        });
    }
}
