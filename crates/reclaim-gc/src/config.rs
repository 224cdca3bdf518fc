//! Collector configuration.
//!
//! Bucket counts, slab sizes and thresholds are implementation
//! configuration, not contract: the defaults mirror the reference policy
//! (16-byte small granularity up to 768 bytes, optional 256-byte medium
//! granularity up to 8 KiB, large objects above that).

/// Granularity of small size classes in bytes.
pub const SMALL_GRANULARITY: usize = 16;

/// Where an allocation of a given size lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeBucket {
    /// Small size class, by bucket index.
    Small(usize),
    /// Medium size class, by bucket index.
    Medium(usize),
    /// Above the medium ceiling: the large-object pool.
    Large,
}

/// Tuning knobs for one collector instance.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Largest size served from small slabs. Must be a multiple of
    /// [`SMALL_GRANULARITY`].
    pub max_small_object_size: usize,
    /// Whether medium buckets exist; without them, everything above the
    /// small ceiling goes to the large-object pool.
    pub medium_buckets: bool,
    /// Granularity of medium size classes in bytes.
    pub medium_granularity: usize,
    /// Largest size served from medium slabs.
    pub max_medium_object_size: usize,
    /// Pages per small slab.
    pub small_slab_pages: usize,
    /// Pages per medium slab.
    pub medium_slab_pages: usize,
    /// Spawn the background worker; required for the concurrent collect
    /// mode and for background sweeping.
    pub background: bool,
    /// Allow the background worker to sweep non-finalizable size classes.
    pub concurrent_sweep: bool,
    /// Number of sibling work lists the mark phase splits into.
    pub mark_parallelism: usize,
    /// Maximum chunks a mark work list may hold before overflowing into
    /// the OOM-rescan protocol.
    pub mark_chunk_budget: usize,
    /// Empty slabs kept per pool as a low-water reserve instead of
    /// releasing their pages.
    pub empty_slab_reserve: usize,
    /// In partial mode, slabs whose live-slot percentage is at least this
    /// value are folded back for allocation without being swept.
    pub partial_min_live_percent: u8,
    /// Bytes allocated since the last collection that trigger an automatic
    /// one from the allocation slow path. Zero disables the heuristic.
    pub auto_collect_bytes: usize,
    /// Hard ceiling on reserved bytes. Exceeding it behaves like page
    /// reservation failure.
    pub memory_limit: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_small_object_size: 768,
            medium_buckets: true,
            medium_granularity: 256,
            max_medium_object_size: 8192,
            small_slab_pages: 1,
            medium_slab_pages: 8,
            background: true,
            concurrent_sweep: true,
            mark_parallelism: 2,
            mark_chunk_budget: 4096,
            empty_slab_reserve: 4,
            partial_min_live_percent: 50,
            auto_collect_bytes: 16 * 1024 * 1024,
            memory_limit: usize::MAX,
        }
    }
}

impl CollectorConfig {
    /// Number of small buckets.
    #[must_use]
    pub const fn small_bucket_count(&self) -> usize {
        self.max_small_object_size / SMALL_GRANULARITY
    }

    /// Number of medium buckets (zero when disabled).
    #[must_use]
    pub const fn medium_bucket_count(&self) -> usize {
        if self.medium_buckets {
            (self.max_medium_object_size - self.max_small_object_size) / self.medium_granularity
        } else {
            0
        }
    }

    /// Route a request size to its bucket. Zero-sized requests take the
    /// smallest class so every allocation has a distinct address.
    #[must_use]
    pub fn bucket_for_size(&self, size: usize) -> SizeBucket {
        let size = size.max(1);
        if size <= self.max_small_object_size {
            SizeBucket::Small((size + SMALL_GRANULARITY - 1) / SMALL_GRANULARITY - 1)
        } else if self.medium_buckets && size <= self.max_medium_object_size {
            let over = size - self.max_small_object_size;
            SizeBucket::Medium((over + self.medium_granularity - 1) / self.medium_granularity - 1)
        } else {
            SizeBucket::Large
        }
    }

    /// Object size of a small bucket.
    #[must_use]
    pub const fn small_bucket_size(&self, bucket: usize) -> usize {
        (bucket + 1) * SMALL_GRANULARITY
    }

    /// Object size of a medium bucket.
    #[must_use]
    pub const fn medium_bucket_size(&self, bucket: usize) -> usize {
        self.max_small_object_size + (bucket + 1) * self.medium_granularity
    }
}
