use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::thumbnail_prefetcher::ThumbnailPrefetcher;
use crate::cache::{FetchPriority, SegmentFetcher, SegmentLimit};
use crate::models::{FeedItem, VideoId};

/// How much preparation an item gets, by distance from the visible one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchTier {
    /// The visible item
    Active,
    /// The next item: every segment
    FullLookahead,
    /// The item after that: the first few segments
    PartialLookahead,
}

impl PrefetchTier {
    /// Tier for an item `offset` positions after the active one
    pub fn for_offset(offset: usize) -> Option<Self> {
        match offset {
            0 => Some(Self::Active),
            1 => Some(Self::FullLookahead),
            2 => Some(Self::PartialLookahead),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Active => 3,
            Self::FullLookahead => 2,
            Self::PartialLookahead => 1,
        }
    }

    pub fn priority(&self) -> FetchPriority {
        match self {
            Self::Active => FetchPriority::High,
            Self::FullLookahead => FetchPriority::Normal,
            Self::PartialLookahead => FetchPriority::Low,
        }
    }
}

/// Outstanding preparation work for one feed item
struct PrefetchIntent {
    index: usize,
    tier: PrefetchTier,
    /// Strongest tier whose work has been issued
    strongest: PrefetchTier,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Inspection view of an intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentInfo {
    pub video_id: VideoId,
    pub index: usize,
    pub tier: PrefetchTier,
    pub finished: bool,
}

/// Turns viewport changes into tiered prefetch work and cancels work that
/// scrolled out of the lookahead window
pub struct PrefetchOrchestrator {
    fetcher: Arc<SegmentFetcher>,
    thumbnails: Arc<ThumbnailPrefetcher>,
    partial_segments: usize,
    intents: Mutex<HashMap<VideoId, PrefetchIntent>>,
    root: Mutex<CancellationToken>,
}

impl PrefetchOrchestrator {
    pub fn new(fetcher: Arc<SegmentFetcher>, thumbnails: Arc<ThumbnailPrefetcher>) -> Self {
        let partial_segments = fetcher.config().partial_lookahead_segments;
        Self {
            fetcher,
            thumbnails,
            partial_segments,
            intents: Mutex::new(HashMap::new()),
            root: Mutex::new(CancellationToken::new()),
        }
    }

    fn lock_intents(&self) -> MutexGuard<'_, HashMap<VideoId, PrefetchIntent>> {
        self.intents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn root_token(&self) -> CancellationToken {
        self.root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// React to the feed showing `items[active_index]`.
    ///
    /// Never blocks: work is spawned onto the current tokio runtime. Without a
    /// runtime the call is logged and ignored.
    pub fn on_viewport_changed(&self, active_index: usize, items: &[FeedItem]) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Viewport change outside a tokio runtime, prefetch skipped");
            return;
        };

        let mut window: Vec<(usize, &FeedItem, PrefetchTier)> = Vec::with_capacity(3);
        for offset in 0..3 {
            let index = active_index.saturating_add(offset);
            let (Some(item), Some(tier)) = (items.get(index), PrefetchTier::for_offset(offset))
            else {
                continue;
            };
            // A video listed twice keeps its closest slot
            if window.iter().all(|(_, seen, _)| seen.video_id != item.video_id) {
                window.push((index, item, tier));
            }
        }

        let root = self.root_token();
        let mut intents = self.lock_intents();

        intents.retain(|video_id, intent| {
            let keep = window.iter().any(|(_, item, _)| &item.video_id == video_id);
            if !keep {
                debug!(
                    "Cancelling stale {:?} intent for {} (was index {})",
                    intent.tier, video_id, intent.index
                );
                intent.cancel.cancel();
            }
            keep
        });

        for (index, item, tier) in window {
            match intents.get_mut(&item.video_id) {
                Some(intent) => {
                    intent.index = index;
                    intent.tier = tier;
                    intent.handles.retain(|handle| !handle.is_finished());
                    if tier.rank() > intent.strongest.rank() {
                        trace!(
                            "Upgrading {} from {:?} to {:?}",
                            item.video_id, intent.strongest, tier
                        );
                        intent.strongest = tier;
                        let handle = self.spawn_work(&runtime, item, tier, intent.cancel.clone());
                        intent.handles.push(handle);
                    }
                }
                None => {
                    let cancel = root.child_token();
                    let handle = self.spawn_work(&runtime, item, tier, cancel.clone());
                    intents.insert(
                        item.video_id.clone(),
                        PrefetchIntent {
                            index,
                            tier,
                            strongest: tier,
                            cancel,
                            handles: vec![handle],
                        },
                    );
                }
            }
        }

        debug!(
            "Viewport at {}: {} active intents",
            active_index,
            intents.len()
        );
    }

    fn spawn_work(
        &self,
        runtime: &tokio::runtime::Handle,
        item: &FeedItem,
        tier: PrefetchTier,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let fetcher = self.fetcher.clone();
        let thumbnails = self.thumbnails.clone();
        let item = item.clone();
        let limit = match tier {
            PrefetchTier::Active | PrefetchTier::FullLookahead => SegmentLimit::All,
            PrefetchTier::PartialLookahead => SegmentLimit::Count(self.partial_segments),
        };

        runtime.spawn(async move {
            let video = async {
                fetcher
                    .initialize(&item.video_id, &item.video_reference, tier.priority(), &cancel)
                    .await;
                fetcher.continue_loading(&item.video_id, limit, &cancel).await;
            };
            let poster = thumbnails.prepare(&item.video_id, &item.poster_reference, &cancel);
            tokio::join!(video, poster);
            trace!("{:?} work for {} finished", tier, item.video_id);
        })
    }

    /// Cancel every outstanding intent. Idempotent.
    pub fn cancel_all(&self) {
        let mut intents = self.lock_intents();
        for intent in intents.values() {
            intent.cancel.cancel();
        }
        intents.clear();
    }

    /// Cancel everything and start over with a fresh lookahead window
    pub fn reset(&self) {
        {
            let mut root = self.root.lock().unwrap_or_else(PoisonError::into_inner);
            root.cancel();
            *root = CancellationToken::new();
        }
        self.cancel_all();
    }

    pub fn active_intents(&self) -> Vec<IntentInfo> {
        let intents = self.lock_intents();
        let mut infos: Vec<IntentInfo> = intents
            .iter()
            .map(|(video_id, intent)| IntentInfo {
                video_id: video_id.clone(),
                index: intent.index,
                tier: intent.tier,
                finished: intent.handles.iter().all(JoinHandle::is_finished),
            })
            .collect();
        infos.sort_by_key(|info| info.index);
        infos
    }
}
