use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::sync::PoisonError;
use tracing::trace;

use super::segment_cache::SegmentKey;
use super::segment_fetcher::{EntryMap, SegmentFetcher, SharedCache};
use super::stats::EngineStats;
use crate::models::VideoId;
use crate::utils::locator;

/// What the renderer should load for a video at a given position
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayableReference {
    /// Unknown video; renders as the empty string
    NotReady,
    /// The original, always-valid locator
    Original(String),
    /// An inline reference to a resident segment payload
    Cached { segment_index: usize, uri: String },
}

impl PlayableReference {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NotReady => "",
            Self::Original(reference) => reference,
            Self::Cached { uri, .. } => uri,
        }
    }

    pub fn is_ready(&self) -> bool {
        !matches!(self, Self::NotReady)
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached { .. })
    }
}

impl fmt::Display for PlayableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps `(video, position)` to the best playable reference. Read-only.
#[derive(Clone)]
pub struct PlayableResolver {
    entries: EntryMap,
    cache: SharedCache,
    stats: EngineStats,
}

impl PlayableResolver {
    pub fn new(fetcher: &SegmentFetcher, stats: EngineStats) -> Self {
        Self {
            entries: fetcher.entries_handle(),
            cache: fetcher.cache_handle(),
            stats,
        }
    }

    pub fn resolve(&self, video_id: &VideoId, position_secs: f64) -> PlayableReference {
        let (index, resident, original) = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = entries.get(video_id) else {
                return PlayableReference::NotReady;
            };

            if entry.uses_original_fallback() || entry.segments.is_empty() {
                return PlayableReference::Original(entry.original_reference.clone());
            }

            let index = entry.segment_index_at(position_secs);
            let resident = entry
                .segments
                .get(index)
                .filter(|segment| segment.is_loaded())
                .and_then(|segment| {
                    let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
                    cache
                        .get(&SegmentKey::new(video_id.clone(), index))
                        .map(|payload| (locator::mime_for(&segment.reference), payload.clone()))
                });
            (index, resident, entry.original_reference.clone())
        };

        // Encoded outside the locks so writers are not held up
        match resident {
            Some((mime, payload)) => {
                trace!(
                    "Resolved {} @ {:.1}s to cached segment {}",
                    video_id, position_secs, index
                );
                self.stats.increment_resolver_hit();
                PlayableReference::Cached {
                    segment_index: index,
                    uri: format!("data:{};base64,{}", mime, STANDARD.encode(&payload)),
                }
            }
            None => {
                self.stats.increment_resolver_miss();
                PlayableReference::Original(original)
            }
        }
    }
}
