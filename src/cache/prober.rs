use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::stats::EngineStats;
use super::transport::MediaTransport;
use crate::utils::locator;

/// How a video can be delivered, resolved once per entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentSource {
    /// Only the original single-file locator is usable
    Monolithic,
    /// The locator names a playlist-based segmented format
    Manifest,
    /// Sibling `_seg{n}` files exist next to the original
    PerFileSegments,
}

impl SegmentSource {
    pub fn is_segmented(&self) -> bool {
        !matches!(self, SegmentSource::Monolithic)
    }
}

impl fmt::Display for SegmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SegmentSource::Monolithic => "monolithic",
            SegmentSource::Manifest => "manifest",
            SegmentSource::PerFileSegments => "per-file segments",
        };
        f.write_str(name)
    }
}

/// Decides, within a bounded time, whether a segmented representation exists
#[derive(Clone)]
pub struct SegmentProber {
    transport: Arc<dyn MediaTransport>,
    timeout: Duration,
    stats: EngineStats,
}

impl SegmentProber {
    pub fn new(transport: Arc<dyn MediaTransport>, timeout: Duration, stats: EngineStats) -> Self {
        Self {
            transport,
            timeout,
            stats,
        }
    }

    /// Resolve the delivery source of `resource`. Never fails: any doubt means monolithic.
    pub async fn resolve_source(&self, resource: &str) -> SegmentSource {
        if locator::is_manifest_locator(resource) {
            debug!("{} is a manifest locator", resource);
            return SegmentSource::Manifest;
        }

        let Some(first_segment) = locator::segment_locator(resource, 0) else {
            debug!("Cannot derive a segment locator from {}", resource);
            return SegmentSource::Monolithic;
        };

        self.stats.increment_probe();
        match timeout(self.timeout, self.transport.head(&first_segment)).await {
            Ok(Ok(status)) if (200..300).contains(&status) => {
                debug!("Segment probe hit for {}", first_segment);
                SegmentSource::PerFileSegments
            }
            Ok(Ok(status)) => {
                debug!("Segment probe for {} answered {}", first_segment, status);
                SegmentSource::Monolithic
            }
            Ok(Err(e)) => {
                warn!("Segment probe for {} failed: {}", first_segment, e);
                SegmentSource::Monolithic
            }
            Err(_) => {
                warn!(
                    "Segment probe for {} timed out after {:?}",
                    first_segment, self.timeout
                );
                SegmentSource::Monolithic
            }
        }
    }

    /// True when segmented delivery is available for `resource`
    pub async fn probe(&self, resource: &str) -> bool {
        self.resolve_source(resource).await.is_segmented()
    }
}
