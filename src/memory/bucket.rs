//! Size classes for code allocations.

/// Bytes tracked by one bit of a page's free vector; the minimum allocation.
pub const GRANULE_SIZE: usize = 128;

/// Largest request served from a bucketed page. Anything bigger takes the
/// large-object path.
pub const MAX_SMALL_SIZE: usize = 4096;

/// Number of buckets that own page lists (everything except `Large`).
pub(crate) const SMALL_BUCKET_COUNT: usize = 5;

/// Size class of a request, ordered by capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BucketId {
    Bucket256,
    Bucket512,
    Bucket1024,
    Bucket2048,
    Bucket4096,
    Large,
}

impl BucketId {
    pub(crate) const SMALL: [BucketId; SMALL_BUCKET_COUNT] = [
        BucketId::Bucket256,
        BucketId::Bucket512,
        BucketId::Bucket1024,
        BucketId::Bucket2048,
        BucketId::Bucket4096,
    ];

    /// Capacity in bytes, `None` for `Large`.
    #[must_use]
    pub fn capacity(self) -> Option<usize> {
        match self {
            BucketId::Bucket256 => Some(256),
            BucketId::Bucket512 => Some(512),
            BucketId::Bucket1024 => Some(1024),
            BucketId::Bucket2048 => Some(2048),
            BucketId::Bucket4096 => Some(4096),
            BucketId::Large => None,
        }
    }

    /// Contiguous granules a page needs free to serve this bucket.
    ///
    /// # Panics
    ///
    /// Panics for `Large`, which never touches a page's free vector.
    #[must_use]
    pub fn granules(self) -> usize {
        match self.capacity() {
            Some(cap) => cap / GRANULE_SIZE,
            None => panic!("large allocations are not granule-tracked"),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_large(self) -> bool {
        self == BucketId::Large
    }

    /// Index into the per-bucket page lists.
    #[inline]
    pub(crate) fn index(self) -> usize {
        debug_assert!(!self.is_large(), "Large has no page list");
        self as usize
    }

    /// Small buckets strictly larger than `self`, ascending.
    pub(crate) fn larger(self) -> impl Iterator<Item = BucketId> {
        Self::SMALL.into_iter().filter(move |b| *b > self)
    }
}

/// Round `bytes` up to the nearest bucket capacity.
///
/// Total: zero-byte requests land in the smallest bucket; callers reject
/// them before getting here.
#[must_use]
pub fn classify_bucket(bytes: usize) -> BucketId {
    if bytes > MAX_SMALL_SIZE {
        return BucketId::Large;
    }
    BucketId::SMALL
        .into_iter()
        .find(|b| b.capacity().is_some_and(|cap| bytes <= cap))
        .unwrap_or(BucketId::Large)
}

/// Granules an allocation of `bytes` occupies (at least one).
#[inline]
pub(crate) fn granules_for_bytes(bytes: usize) -> usize {
    bytes.div_ceil(GRANULE_SIZE).max(1)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_classify_boundaries() {
        assert_eq!(classify_bucket(1), BucketId::Bucket256);
        assert_eq!(classify_bucket(128), BucketId::Bucket256);
        assert_eq!(classify_bucket(256), BucketId::Bucket256);
        assert_eq!(classify_bucket(257), BucketId::Bucket512);
        assert_eq!(classify_bucket(512), BucketId::Bucket512);
        assert_eq!(classify_bucket(513), BucketId::Bucket1024);
        assert_eq!(classify_bucket(2048), BucketId::Bucket2048);
        assert_eq!(classify_bucket(2049), BucketId::Bucket4096);
        assert_eq!(classify_bucket(4096), BucketId::Bucket4096);
        assert_eq!(classify_bucket(4097), BucketId::Large);
        assert_eq!(classify_bucket(usize::MAX), BucketId::Large);
    }

    #[test]
    fn test_classify_is_smallest_fitting_capacity() {
        for s in 1..=MAX_SMALL_SIZE {
            let b = classify_bucket(s);
            let cap = b.capacity().unwrap();
            assert!(cap >= s, "bucket {b:?} too small for {s}");
            // No smaller bucket would have fit.
            for smaller in BucketId::SMALL.into_iter().filter(|x| *x < b) {
                assert!(smaller.capacity().unwrap() < s);
            }
        }
    }

    #[test]
    fn test_bucket_order_and_granules() {
        assert!(BucketId::Bucket256 < BucketId::Bucket4096);
        assert!(BucketId::Bucket4096 < BucketId::Large);
        assert_eq!(BucketId::Bucket256.granules(), 2);
        assert_eq!(BucketId::Bucket4096.granules(), 32);
        let larger: Vec<_> = BucketId::Bucket1024.larger().collect();
        assert_eq!(larger, vec![BucketId::Bucket2048, BucketId::Bucket4096]);
        assert_eq!(BucketId::Bucket4096.larger().count(), 0);
    }

    #[test]
    fn test_granules_for_bytes_rounds_up() {
        assert_eq!(granules_for_bytes(0), 1);
        assert_eq!(granules_for_bytes(1), 1);
        assert_eq!(granules_for_bytes(128), 1);
        assert_eq!(granules_for_bytes(129), 2);
        assert_eq!(granules_for_bytes(4096), 32);
    }

    #[test]
    #[should_panic(expected = "not granule-tracked")]
    fn test_large_has_no_granules() {
        let _ = BucketId::Large.granules();
    }
}
