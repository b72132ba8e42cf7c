use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics of the read cache.
#[derive(Default)]
pub(crate) struct ReadMetrics {
    pub hits: Counter,
    pub misses: Counter,
    pub evictions: Counter,
    pub am_pages: Gauge,
    pub a1in_pages: Gauge,
    pub a1out_pages: Gauge,
    pub pinned_pages: Gauge,
}

impl ReadMetrics {
    /// Initialize the `ReadMetrics` struct and register the metrics in the provided registry.
    pub(crate) fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "hits",
            "Number of loads served without reading from the write cache",
            metrics.hits.clone(),
        );
        registry.register(
            "misses",
            "Number of loads that fetched the page from the write cache",
            metrics.misses.clone(),
        );
        registry.register(
            "evictions",
            "Number of pages evicted from memory",
            metrics.evictions.clone(),
        );
        registry.register(
            "am_pages",
            "Number of pages in the hot queue",
            metrics.am_pages.clone(),
        );
        registry.register(
            "a1in_pages",
            "Number of pages in the probationary queue",
            metrics.a1in_pages.clone(),
        );
        registry.register(
            "a1out_pages",
            "Number of keys in the ghost queue",
            metrics.a1out_pages.clone(),
        );
        registry.register(
            "pinned_pages",
            "Number of pinned pages",
            metrics.pinned_pages.clone(),
        );

        metrics
    }
}

/// Metrics of the write cache.
#[derive(Default)]
pub(crate) struct WriteMetrics {
    pub dirty_pages: Gauge,
    pub exclusive_pages: Gauge,
    pub write_cache_bytes: Gauge,
    pub flushed_pages: Counter,
    pub last_flush_pages: Gauge,
    pub last_flush_duration: Gauge,
    pub checkpoints: Counter,
    pub last_checkpoint: Gauge,
    pub low_disk_space: Counter,
}

impl WriteMetrics {
    /// Initialize the `WriteMetrics` struct and register the metrics in the provided registry.
    pub(crate) fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "dirty_pages",
            "Number of pages with unflushed content",
            metrics.dirty_pages.clone(),
        );
        registry.register(
            "exclusive_pages",
            "Number of dirty pages referenced only by the write cache",
            metrics.exclusive_pages.clone(),
        );
        registry.register(
            "write_cache_bytes",
            "Memory held by dirty pages",
            metrics.write_cache_bytes.clone(),
        );
        registry.register(
            "flushed_pages",
            "Number of pages written to disk",
            metrics.flushed_pages.clone(),
        );
        registry.register(
            "last_flush_pages",
            "Number of pages written by the last background flush",
            metrics.last_flush_pages.clone(),
        );
        registry.register(
            "last_flush_duration",
            "Duration of the last background flush in milliseconds",
            metrics.last_flush_duration.clone(),
        );
        registry.register(
            "checkpoints",
            "Number of fuzzy checkpoints completed",
            metrics.checkpoints.clone(),
        );
        registry.register(
            "last_checkpoint",
            "Completion time of the last fuzzy checkpoint in milliseconds since the UNIX epoch",
            metrics.last_checkpoint.clone(),
        );
        registry.register(
            "low_disk_space",
            "Number of low disk space notifications",
            metrics.low_disk_space.clone(),
        );

        metrics
    }
}
