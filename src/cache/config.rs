use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamCacheConfig {
    /// Resident byte budget of the segment cache, in megabytes
    pub max_cache_mb: u64,

    /// Nominal duration represented by one per-file segment
    pub segment_duration_secs: f64,

    /// Duration assumed for segment planning until the player reports the real one
    pub assumed_duration_secs: f64,

    /// Buffer health reported once the first segment alone is resident
    pub first_segment_health: u8,

    /// Segments prepared for the second lookahead item
    pub partial_lookahead_segments: usize,

    /// Background segment fetches allowed in flight per loading call
    pub max_concurrent_fetches: usize,

    /// Upper bound on the segment availability probe
    pub probe_timeout_ms: u64,

    /// Upper bound on the manifest fetch and on the first-segment fetch
    pub first_segment_timeout_ms: u64,

    /// Enable periodic stats reporting
    pub enable_stats: bool,

    /// Stats reporting interval in seconds
    pub stats_interval_secs: u64,
}

impl Default for StreamCacheConfig {
    fn default() -> Self {
        Self {
            max_cache_mb: 100,
            segment_duration_secs: 3.0,
            assumed_duration_secs: 30.0,
            first_segment_health: 25,
            partial_lookahead_segments: 3,
            max_concurrent_fetches: 3,
            probe_timeout_ms: 1000,
            first_segment_timeout_ms: 3000,
            enable_stats: true,
            stats_interval_secs: 30,
        }
    }
}

impl StreamCacheConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_mb == 0 {
            return Err(anyhow::anyhow!("max_cache_mb must be greater than 0"));
        }

        if !self.segment_duration_secs.is_finite() || self.segment_duration_secs <= 0.0 {
            return Err(anyhow::anyhow!(
                "segment_duration_secs must be a positive number"
            ));
        }

        if !self.assumed_duration_secs.is_finite() || self.assumed_duration_secs <= 0.0 {
            return Err(anyhow::anyhow!(
                "assumed_duration_secs must be a positive number"
            ));
        }

        // 100 would claim full buffering with a single segment resident
        if self.first_segment_health == 0 || self.first_segment_health >= 100 {
            return Err(anyhow::anyhow!(
                "first_segment_health must be between 1 and 99"
            ));
        }

        if self.partial_lookahead_segments == 0 {
            return Err(anyhow::anyhow!(
                "partial_lookahead_segments must be greater than 0"
            ));
        }

        if self.max_concurrent_fetches == 0 {
            return Err(anyhow::anyhow!(
                "max_concurrent_fetches must be greater than 0"
            ));
        }

        if self.probe_timeout_ms == 0 || self.first_segment_timeout_ms == 0 {
            return Err(anyhow::anyhow!("timeouts must be greater than 0"));
        }

        Ok(())
    }

    /// Cache budget in bytes (config stores MB for readability)
    pub fn budget_bytes(&self) -> u64 {
        self.max_cache_mb * 1024 * 1024
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn first_segment_timeout(&self) -> Duration {
        Duration::from_millis(self.first_segment_timeout_ms)
    }

    /// Number of per-file segments planned for a video of the given duration
    pub fn segment_count_for(&self, duration_secs: f64) -> usize {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return 1;
        }
        ((duration_secs / self.segment_duration_secs).ceil() as usize).max(1)
    }

    /// Segment count planned before any real duration is known
    pub fn assumed_segment_count(&self) -> usize {
        self.segment_count_for(self.assumed_duration_secs)
    }
}
