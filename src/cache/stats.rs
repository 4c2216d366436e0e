use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared by every component of one engine instance
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Availability probes issued
    pub probes: Arc<AtomicU64>,
    /// Entries that ended up on the original locator
    pub fallbacks: Arc<AtomicU64>,
    /// Segments fetched and inserted into the cache
    pub segments_loaded: Arc<AtomicU64>,
    /// Segment fetches that failed (first-segment failures included)
    pub segments_failed: Arc<AtomicU64>,
    /// Segment fetches abandoned through cancellation
    pub segments_cancelled: Arc<AtomicU64>,
    /// Payload bytes fetched into the cache
    pub bytes_fetched: Arc<AtomicU64>,
    /// Cache entries evicted to stay within budget
    pub evictions: Arc<AtomicU64>,
    /// Resolutions answered from the cache
    pub resolver_hits: Arc<AtomicU64>,
    /// Resolutions answered with the original locator
    pub resolver_misses: Arc<AtomicU64>,
    /// Posters pre-warmed successfully
    pub posters_warmed: Arc<AtomicU64>,
    /// Posters that failed or timed out
    pub posters_failed: Arc<AtomicU64>,
    /// Start time for calculating uptime
    pub start_time: Instant,
}

/// Point-in-time copy of [`EngineStats`] suitable for serialization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub probes: u64,
    pub fallbacks: u64,
    pub segments_loaded: u64,
    pub segments_failed: u64,
    pub segments_cancelled: u64,
    pub bytes_fetched: u64,
    pub evictions: u64,
    pub resolver_hits: u64,
    pub resolver_misses: u64,
    pub posters_warmed: u64,
    pub posters_failed: u64,
    pub uptime_secs: u64,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            probes: Arc::new(AtomicU64::new(0)),
            fallbacks: Arc::new(AtomicU64::new(0)),
            segments_loaded: Arc::new(AtomicU64::new(0)),
            segments_failed: Arc::new(AtomicU64::new(0)),
            segments_cancelled: Arc::new(AtomicU64::new(0)),
            bytes_fetched: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
            resolver_hits: Arc::new(AtomicU64::new(0)),
            resolver_misses: Arc::new(AtomicU64::new(0)),
            posters_warmed: Arc::new(AtomicU64::new(0)),
            posters_failed: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn increment_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_loaded(&self, bytes: u64) {
        self.segments_loaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_segment_failed(&self) {
        self.segments_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_segment_cancelled(&self) {
        self.segments_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_resolver_hit(&self) {
        self.resolver_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_resolver_miss(&self) {
        self.resolver_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_poster_warmed(&self) {
        self.posters_warmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_poster_failed(&self) {
        self.posters_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            probes: self.probes.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            segments_loaded: self.segments_loaded.load(Ordering::Relaxed),
            segments_failed: self.segments_failed.load(Ordering::Relaxed),
            segments_cancelled: self.segments_cancelled.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resolver_hits: self.resolver_hits.load(Ordering::Relaxed),
            resolver_misses: self.resolver_misses.load(Ordering::Relaxed),
            posters_warmed: self.posters_warmed.load(Ordering::Relaxed),
            posters_failed: self.posters_failed.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn format_report(&self, cache_size: u64, cache_budget: u64) -> String {
        let snapshot = self.snapshot();
        let hours = snapshot.uptime_secs / 3600;
        let minutes = (snapshot.uptime_secs % 3600) / 60;
        let seconds = snapshot.uptime_secs % 60;

        let lookups = snapshot.resolver_hits + snapshot.resolver_misses;
        let hit_rate = if lookups > 0 {
            (snapshot.resolver_hits as f64 / lookups as f64) * 100.0
        } else {
            0.0
        };

        let fetched_mb = snapshot.bytes_fetched as f64 / (1024.0 * 1024.0);
        let used_mb = cache_size as f64 / (1024.0 * 1024.0);
        let budget_mb = cache_budget as f64 / (1024.0 * 1024.0);

        let mut report = format!(
            "Stream Stats [{}h {}m {}s] | Probes: {} | Fallbacks: {} | Segments: {} loaded, {} failed, {} cancelled | Fetched: {:.1} MB | Hit Rate: {:.1}%",
            hours,
            minutes,
            seconds,
            snapshot.probes,
            snapshot.fallbacks,
            snapshot.segments_loaded,
            snapshot.segments_failed,
            snapshot.segments_cancelled,
            fetched_mb,
            hit_rate
        );

        report.push_str(&format!(
            "\n   Cache: {:.1}/{:.1} MB | Evictions: {} | Posters: {} warmed, {} failed",
            used_mb, budget_mb, snapshot.evictions, snapshot.posters_warmed, snapshot.posters_failed
        ));

        report
    }
}
