use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cache::{EngineStats, MediaTransport};
use crate::config::ThumbnailConfig;
use crate::models::VideoId;
use crate::utils::StreamError;

/// Solid 9:16 frame shown whenever no poster is available
pub const PLACEHOLDER_IMAGE: &str = "data:image/svg+xml;base64,PHN2ZyB4bWxucz0naHR0cDovL3d3dy53My5vcmcvMjAwMC9zdmcnIHdpZHRoPSc5JyBoZWlnaHQ9JzE2JyB2aWV3Qm94PScwIDAgOSAxNic+PHJlY3Qgd2lkdGg9JzknIGhlaWdodD0nMTYnIGZpbGw9JyMxYzFjMWUnLz48L3N2Zz4=";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThumbnailEntry {
    pub video_id: VideoId,
    pub poster_reference: String,
    pub loaded: bool,
    pub loading: bool,
    pub last_error: Option<String>,
    pub placeholder: &'static str,
}

impl ThumbnailEntry {
    fn new(video_id: VideoId, poster_reference: String) -> Self {
        Self {
            video_id,
            poster_reference,
            loaded: false,
            loading: false,
            last_error: None,
            placeholder: PLACEHOLDER_IMAGE,
        }
    }
}

/// How the renderer should fill the frame before the first video frame arrives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayStrategy {
    pub show_placeholder: bool,
    pub show_poster: bool,
    pub poster_reference: Option<String>,
    pub placeholder_reference: &'static str,
}

struct Slot {
    entry: ThumbnailEntry,
    cancel: CancellationToken,
    generation: u64,
}

/// Best-effort poster pre-warming, independent of the segment pipeline
pub struct ThumbnailPrefetcher {
    transport: Arc<dyn MediaTransport>,
    slots: Mutex<HashMap<VideoId, Slot>>,
    posters: Mutex<LruCache<VideoId, Bytes>>,
    poster_timeout: Duration,
    stats: EngineStats,
    next_generation: AtomicU64,
}

impl ThumbnailPrefetcher {
    pub fn new(
        transport: Arc<dyn MediaTransport>,
        config: &ThumbnailConfig,
        stats: EngineStats,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.poster_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            transport,
            slots: Mutex::new(HashMap::new()),
            posters: Mutex::new(LruCache::new(capacity)),
            poster_timeout: Duration::from_millis(config.poster_timeout_ms),
            stats,
            next_generation: AtomicU64::new(1),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<VideoId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_posters(&self) -> MutexGuard<'_, LruCache<VideoId, Bytes>> {
        self.posters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Warm the poster of `video_id`.
    ///
    /// Returns the current entry straight away when the id is already known,
    /// including while another call is still loading it.
    pub async fn prepare(
        &self,
        video_id: &VideoId,
        poster_reference: &str,
        cancel: &CancellationToken,
    ) -> ThumbnailEntry {
        let (token, generation) = {
            let mut slots = self.lock_slots();
            if let Some(slot) = slots.get(video_id) {
                return slot.entry.clone();
            }

            let mut entry = ThumbnailEntry::new(video_id.clone(), poster_reference.to_string());
            if poster_reference.is_empty() {
                entry.loaded = true;
                slots.insert(
                    video_id.clone(),
                    Slot {
                        entry: entry.clone(),
                        cancel: cancel.child_token(),
                        generation: 0,
                    },
                );
                return entry;
            }

            entry.loading = true;
            let token = cancel.child_token();
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            slots.insert(
                video_id.clone(),
                Slot {
                    entry,
                    cancel: token.clone(),
                    generation,
                },
            );
            (token, generation)
        };

        trace!("Pre-warming poster for {}: {}", video_id, poster_reference);
        let fetch = self.transport.fetch(poster_reference, &token);
        let result = match timeout(self.poster_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::Timeout(self.poster_timeout)),
        };

        let mut slots = self.lock_slots();
        let current = slots
            .get(video_id)
            .map(|slot| slot.generation == generation)
            .unwrap_or(false);

        let mut finished = ThumbnailEntry::new(video_id.clone(), poster_reference.to_string());
        if !current {
            // Cleared while in flight
            finished.last_error = Some(StreamError::Cancelled.to_string());
            return finished;
        }

        match result {
            Ok(bytes) => {
                debug!("Poster for {} warmed ({} bytes)", video_id, bytes.len());
                self.lock_posters().put(video_id.clone(), bytes);
                self.stats.increment_poster_warmed();
                finished.loaded = true;
            }
            Err(StreamError::Cancelled) => {
                slots.remove(video_id);
                finished.last_error = Some(StreamError::Cancelled.to_string());
                return finished;
            }
            Err(e) => {
                warn!("Poster for {} unavailable: {}", video_id, e);
                self.stats.increment_poster_failed();
                finished.loaded = true;
                finished.last_error = Some(e.to_string());
            }
        }

        if let Some(slot) = slots.get_mut(video_id) {
            slot.entry = finished.clone();
        }
        finished
    }

    /// Never fails; unknown ids get the placeholder
    pub fn display_strategy(&self, video_id: &VideoId) -> DisplayStrategy {
        let slots = self.lock_slots();
        let entry = slots.get(video_id).map(|slot| &slot.entry);

        let show_poster = entry
            .map(|e| e.loaded && !e.poster_reference.is_empty() && e.last_error.is_none())
            .unwrap_or(false);

        DisplayStrategy {
            show_placeholder: !show_poster,
            show_poster,
            poster_reference: entry
                .map(|e| e.poster_reference.clone())
                .filter(|reference| !reference.is_empty()),
            placeholder_reference: PLACEHOLDER_IMAGE,
        }
    }

    pub fn entry(&self, video_id: &VideoId) -> Option<ThumbnailEntry> {
        self.lock_slots().get(video_id).map(|slot| slot.entry.clone())
    }

    /// Warmed poster bytes, if still cached
    pub fn poster_bytes(&self, video_id: &VideoId) -> Option<Bytes> {
        self.lock_posters().get(video_id).cloned()
    }

    /// Cancel in-flight warms and forget every entry and poster. Idempotent.
    pub fn cleanup(&self) {
        let mut slots = self.lock_slots();
        for slot in slots.values() {
            slot.cancel.cancel();
        }
        slots.clear();
        self.lock_posters().clear();
    }
}
