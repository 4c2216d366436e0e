use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{
    EngineStats, FetchPriority, HttpTransport, MediaTransport, PlayableReference,
    PlayableResolver, SegmentFetcher, SegmentLimit, StatsSnapshot, VideoSnapshot, VideoState,
};
use crate::config::Config;
use crate::models::{FeedItem, VideoId};
use crate::utils::StreamResult;
use crate::workers::{
    DisplayStrategy, IntentInfo, PrefetchOrchestrator, ThumbnailEntry, ThumbnailPrefetcher,
};

/// The delivery layer of one feed screen.
///
/// Owned by the screen that shows the feed and torn down with it; there is no
/// process-wide instance. Every operation degrades to a safe default instead of
/// returning an error.
pub struct StreamingEngine {
    fetcher: Arc<SegmentFetcher>,
    resolver: PlayableResolver,
    thumbnails: Arc<ThumbnailPrefetcher>,
    orchestrator: PrefetchOrchestrator,
    stats: EngineStats,
    stats_interval: Option<Duration>,
    stats_task: Mutex<Option<JoinHandle<()>>>,
    /// Parent of tokens handed to direct (non-viewport) requests
    root: Mutex<CancellationToken>,
}

impl StreamingEngine {
    pub fn new(config: &Config, transport: Arc<dyn MediaTransport>) -> Self {
        let stats = EngineStats::new();
        let fetcher = Arc::new(SegmentFetcher::new(
            transport.clone(),
            config.cache.clone(),
            stats.clone(),
        ));
        let thumbnails = Arc::new(ThumbnailPrefetcher::new(
            transport,
            &config.thumbnails,
            stats.clone(),
        ));
        let resolver = PlayableResolver::new(&fetcher, stats.clone());
        let orchestrator = PrefetchOrchestrator::new(fetcher.clone(), thumbnails.clone());

        info!(
            "Streaming engine created: {} MB cache, {:.1}s segments",
            config.cache.max_cache_mb, config.cache.segment_duration_secs
        );

        Self {
            fetcher,
            resolver,
            thumbnails,
            orchestrator,
            stats,
            stats_interval: config
                .cache
                .enable_stats
                .then(|| Duration::from_secs(config.cache.stats_interval_secs.max(1))),
            stats_task: Mutex::new(None),
            root: Mutex::new(CancellationToken::new()),
        }
    }

    /// Engine talking to the network through reqwest
    pub fn with_http(config: &Config) -> StreamResult<Self> {
        let transport = HttpTransport::new(&config.network)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    fn request_token(&self) -> CancellationToken {
        self.root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token()
    }

    /// Feed scrolled: prepare the visible item and its lookahead. Never blocks.
    pub fn on_viewport_changed(&self, active_index: usize, items: &[FeedItem]) {
        self.orchestrator.on_viewport_changed(active_index, items);
    }

    /// Initialize one video directly, outside viewport handling
    pub async fn initialize(
        &self,
        video_id: &VideoId,
        original_reference: &str,
        priority: FetchPriority,
    ) {
        let cancel = self.request_token();
        self.fetcher
            .initialize(video_id, original_reference, priority, &cancel)
            .await;
    }

    pub async fn continue_loading(&self, video_id: &VideoId, limit: SegmentLimit) {
        let cancel = self.request_token();
        self.fetcher.continue_loading(video_id, limit, &cancel).await;
    }

    /// Best playable reference for `video_id` at `position_secs`
    pub fn resolve(&self, video_id: &VideoId, position_secs: f64) -> PlayableReference {
        self.resolver.resolve(video_id, position_secs)
    }

    pub async fn prepare_thumbnail(
        &self,
        video_id: &VideoId,
        poster_reference: &str,
    ) -> ThumbnailEntry {
        let cancel = self.request_token();
        self.thumbnails
            .prepare(video_id, poster_reference, &cancel)
            .await
    }

    pub fn display_strategy(&self, video_id: &VideoId) -> DisplayStrategy {
        self.thumbnails.display_strategy(video_id)
    }

    pub fn poster_bytes(&self, video_id: &VideoId) -> Option<bytes::Bytes> {
        self.thumbnails.poster_bytes(video_id)
    }

    /// The player learned the real duration of a video
    pub fn report_duration(&self, video_id: &VideoId, duration_secs: f64) {
        self.fetcher.update_duration(video_id, duration_secs);
    }

    /// Stop in-flight fetches for one video; cached segments stay usable
    pub fn cancel_video(&self, video_id: &VideoId) {
        self.fetcher.cancel_video(video_id);
    }

    pub fn video_state(&self, video_id: &VideoId) -> Option<VideoState> {
        self.fetcher.state(video_id)
    }

    pub fn buffer_health(&self, video_id: &VideoId) -> u8 {
        self.fetcher.buffer_health(video_id)
    }

    pub fn video_snapshot(&self, video_id: &VideoId) -> Option<VideoSnapshot> {
        self.fetcher.snapshot(video_id)
    }

    pub fn video_snapshots(&self) -> Vec<VideoSnapshot> {
        self.fetcher.snapshots()
    }

    pub fn active_intents(&self) -> Vec<IntentInfo> {
        self.orchestrator.active_intents()
    }

    pub fn in_flight_count(&self) -> usize {
        self.fetcher.in_flight_count()
    }

    pub fn cache_size(&self) -> u64 {
        self.fetcher.cache_size()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_report(&self) -> String {
        self.stats
            .format_report(self.fetcher.cache_size(), self.fetcher.cache_budget())
    }

    /// Start periodic stats reporting, if enabled in the configuration
    pub fn start_stats_reporting(&self) {
        let Some(interval) = self.stats_interval else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Stats reporting needs a tokio runtime");
            return;
        };

        let mut task = self.stats_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let stats = self.stats.clone();
        let fetcher = self.fetcher.clone();
        *task = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                ticker.tick().await;
                let report = stats.format_report(fetcher.cache_size(), fetcher.cache_budget());
                info!("{}", report);
            }
        }));
    }

    /// Cancel all outstanding work and clear every cache. Idempotent.
    pub fn cleanup(&self) {
        self.orchestrator.reset();
        {
            let mut root = self.root.lock().unwrap_or_else(PoisonError::into_inner);
            root.cancel();
            *root = CancellationToken::new();
        }
        self.fetcher.cleanup();
        self.thumbnails.cleanup();

        if let Some(handle) = self
            .stats_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for StreamingEngine {
    fn drop(&mut self) {
        self.cleanup();
    }
}
