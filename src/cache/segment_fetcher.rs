use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::config::StreamCacheConfig;
use super::manifest::parse_media_playlist;
use super::prober::{SegmentProber, SegmentSource};
use super::segment_cache::{SegmentCache, SegmentKey};
use super::state_machine::{
    FetchPriority, Segment, SegmentStatus, VideoEntry, VideoSnapshot, VideoState,
};
use super::stats::EngineStats;
use super::transport::MediaTransport;
use crate::models::VideoId;
use crate::utils::locator;
use crate::utils::{StreamError, StreamResult};

pub(crate) type EntryMap = Arc<RwLock<HashMap<VideoId, VideoEntry>>>;
pub(crate) type SharedCache = Arc<Mutex<SegmentCache>>;

/// How many segments a background loading pass may claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentLimit {
    All,
    /// Segments whose index is below the given count
    Count(usize),
}

/// A segment plan produced from the resolved source
struct SegmentPlan {
    references: Vec<String>,
    segment_duration_secs: f64,
    /// Segment boundaries when the source lists real durations
    bounds: Option<Vec<f64>>,
    provisional: bool,
}

enum CommitOutcome {
    Stored,
    /// The claim was superseded by cancellation, cleanup or re-planning
    Stale,
    /// The cache refused the payload
    Rejected,
}

/// Ownership of one `Loading` segment.
///
/// Dropping an uncommitted claim returns the segment to `Pending`, provided it
/// is still loading under the same ticket, so aborted tasks never leave a
/// segment stuck in flight.
struct SegmentClaim {
    entries: EntryMap,
    video_id: VideoId,
    index: usize,
    ticket: u64,
    cancel: CancellationToken,
    committed: bool,
}

impl Drop for SegmentClaim {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(segment) = entries
            .get_mut(&self.video_id)
            .and_then(|entry| entry.segments.get_mut(self.index))
        {
            if segment.loading_ticket() == Some(self.ticket) {
                trace!(
                    "Releasing claim on segment {} of {}",
                    self.index, self.video_id
                );
                segment.status = SegmentStatus::Pending;
            }
        }
    }
}

/// Wait until an entry being initialized by someone else settles (or disappears).
/// Returns false when the caller gave up first.
async fn wait_until_settled(
    mut settled: watch::Receiver<bool>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = settled.wait_for(|done| *done) => true,
    }
}

/// Per-video segmented fetch engine.
///
/// Owns every `VideoEntry` and the shared segment cache. State is only touched
/// inside short critical sections; network work happens outside of them.
pub struct SegmentFetcher {
    transport: Arc<dyn MediaTransport>,
    prober: SegmentProber,
    entries: EntryMap,
    cache: SharedCache,
    config: StreamCacheConfig,
    stats: EngineStats,
    next_ticket: AtomicU64,
}

impl SegmentFetcher {
    pub fn new(
        transport: Arc<dyn MediaTransport>,
        config: StreamCacheConfig,
        stats: EngineStats,
    ) -> Self {
        let prober = SegmentProber::new(transport.clone(), config.probe_timeout(), stats.clone());
        let cache = SegmentCache::new(config.budget_bytes());
        Self {
            transport,
            prober,
            entries: Arc::new(RwLock::new(HashMap::new())),
            cache: Arc::new(Mutex::new(cache)),
            config,
            stats,
            next_ticket: AtomicU64::new(1),
        }
    }

    pub(crate) fn entries_handle(&self) -> EntryMap {
        self.entries.clone()
    }

    pub(crate) fn cache_handle(&self) -> SharedCache {
        self.cache.clone()
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<VideoId, VideoEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<VideoId, VideoEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> MutexGuard<'_, SegmentCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    /// Bring a video to a settled state: `Ready` (first segment cached) or `Fallback`.
    ///
    /// Known videos are left alone. If another caller is already initializing the
    /// same id, this waits for that initialization instead of starting a second one.
    pub async fn initialize(
        &self,
        video_id: &VideoId,
        original_reference: &str,
        priority: FetchPriority,
        cancel: &CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let waiter = {
                let mut entries = self.write_entries();
                match entries.get(video_id) {
                    Some(entry) if entry.state().is_settled() => return,
                    Some(entry) => Err(entry.subscribe_settled()),
                    None => {
                        let mut entry = VideoEntry::new(
                            video_id.clone(),
                            original_reference.to_string(),
                            priority,
                            self.config.segment_duration_secs,
                            cancel.child_token(),
                        );
                        entry.generation = self.ticket();
                        entry.transition(VideoState::Probing, Some("initialize".to_string()));
                        let started = (entry.generation, entry.cancel.clone());
                        entries.insert(video_id.clone(), entry);
                        Ok(started)
                    }
                }
            };

            match waiter {
                Ok((generation, token)) => {
                    debug!(
                        "Initializing {} ({:?} priority) from {}",
                        video_id, priority, original_reference
                    );
                    self.run_initialization(video_id, original_reference, generation, &token)
                        .await;
                    return;
                }
                Err(settled) => {
                    trace!("Waiting for in-flight initialization of {}", video_id);
                    if !wait_until_settled(settled, cancel).await {
                        return;
                    }
                }
            }
        }
    }

    async fn run_initialization(
        &self,
        video_id: &VideoId,
        original_reference: &str,
        generation: u64,
        cancel: &CancellationToken,
    ) {
        let source = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.discard(video_id, generation);
                return;
            }
            source = self.prober.resolve_source(original_reference) => source,
        };

        let plan = match source {
            SegmentSource::Monolithic => {
                self.fall_back(video_id, generation, "segmented delivery unavailable");
                return;
            }
            SegmentSource::PerFileSegments => self.plan_per_file(video_id, original_reference),
            SegmentSource::Manifest => self.plan_from_manifest(original_reference, cancel).await,
        };

        let plan = match plan {
            Ok(plan) if plan.references.is_empty() => {
                self.fall_back(video_id, generation, "segment plan is empty");
                return;
            }
            Ok(plan) => plan,
            Err(StreamError::Cancelled) => {
                self.discard(video_id, generation);
                return;
            }
            Err(e) => {
                warn!("Cannot plan segments for {}: {}", video_id, e);
                self.fall_back(video_id, generation, e.to_string());
                return;
            }
        };

        let Some((mut claim, reference)) =
            self.begin_first_segment(video_id, generation, source, plan, cancel)
        else {
            return;
        };

        let limit = self.config.first_segment_timeout();
        let result = match timeout(limit, self.transport.fetch(&reference, &claim.cancel)).await {
            Ok(result) => result,
            Err(_) => {
                claim.cancel.cancel();
                Err(StreamError::Timeout(limit))
            }
        };

        match result {
            Ok(payload) => match self.commit_segment(&mut claim, payload, true) {
                CommitOutcome::Stored => {
                    info!("First segment of {} cached, ready for playback", video_id);
                }
                CommitOutcome::Stale => {
                    // The claim was released under us; the entry must still settle
                    debug!("First segment of {} arrived after release", video_id);
                    drop(claim);
                    if cancel.is_cancelled() {
                        self.discard(video_id, generation);
                    } else {
                        self.fall_back(video_id, generation, "first segment claim lost");
                    }
                }
                CommitOutcome::Rejected => {
                    self.stats.increment_segment_failed();
                    self.fall_back(video_id, generation, "first segment exceeds cache budget");
                }
            },
            Err(_) if cancel.is_cancelled() => {
                self.stats.increment_segment_cancelled();
                drop(claim);
                self.discard(video_id, generation);
            }
            Err(e) => {
                warn!("First segment of {} failed: {}", video_id, e);
                self.stats.increment_segment_failed();
                drop(claim);
                self.fall_back(video_id, generation, format!("first segment: {}", e));
            }
        }
    }

    fn plan_per_file(
        &self,
        video_id: &VideoId,
        original_reference: &str,
    ) -> StreamResult<SegmentPlan> {
        let reported = self
            .read_entries()
            .get(video_id)
            .and_then(|entry| entry.reported_duration_secs);

        let count = match reported {
            Some(duration) => self.config.segment_count_for(duration),
            None => self.config.assumed_segment_count(),
        };
        let references = (0..count)
            .map(|index| locator::segment_locator(original_reference, index))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| StreamError::InvalidLocator(original_reference.to_string()))?;

        Ok(SegmentPlan {
            references,
            segment_duration_secs: self.config.segment_duration_secs,
            bounds: None,
            provisional: reported.is_none(),
        })
    }

    async fn plan_from_manifest(
        &self,
        manifest_reference: &str,
        cancel: &CancellationToken,
    ) -> StreamResult<SegmentPlan> {
        if !locator::is_hls_locator(manifest_reference) {
            return Err(StreamError::Manifest(format!(
                "{} is not an HLS playlist",
                manifest_reference
            )));
        }

        let limit = self.config.first_segment_timeout();
        let body = timeout(limit, self.transport.fetch(manifest_reference, cancel))
            .await
            .map_err(|_| StreamError::Timeout(limit))??;

        let text = String::from_utf8_lossy(&body);
        let playlist = parse_media_playlist(manifest_reference, &text)?;
        let segment_duration_secs = playlist
            .nominal_segment_duration()
            .unwrap_or(self.config.segment_duration_secs);

        debug!(
            "Planned {} segments ({:.1}s total, {:.1}s nominal) from {}",
            playlist.segments.len(),
            playlist.total_duration(),
            segment_duration_secs,
            manifest_reference
        );

        let bounds = playlist.segment_bounds();
        Ok(SegmentPlan {
            references: playlist.segments.into_iter().map(|s| s.uri).collect(),
            segment_duration_secs,
            bounds: Some(bounds),
            provisional: false,
        })
    }

    /// Install the plan and claim segment 0, or return None if the entry is gone
    fn begin_first_segment(
        &self,
        video_id: &VideoId,
        generation: u64,
        source: SegmentSource,
        plan: SegmentPlan,
        cancel: &CancellationToken,
    ) -> Option<(SegmentClaim, String)> {
        let mut entries = self.write_entries();
        let entry = entries
            .get_mut(video_id)
            .filter(|entry| entry.generation == generation)?;

        entry.source = Some(source);
        entry.segment_duration_secs = plan.segment_duration_secs;
        entry.segment_bounds = plan.bounds;
        entry.duration_is_provisional = plan.provisional;
        entry.segments = plan
            .references
            .into_iter()
            .enumerate()
            .map(|(index, reference)| Segment::new(index, reference))
            .collect();
        entry.transition(
            VideoState::LoadingFirstSegment,
            Some(format!("{} segments via {}", entry.segments.len(), source)),
        );

        let ticket = self.ticket();
        let token = cancel.child_token();
        let first = entry.segments.first_mut()?;
        first.status = SegmentStatus::Loading {
            ticket,
            cancel: token.clone(),
        };
        let reference = first.reference.clone();

        Some((
            SegmentClaim {
                entries: self.entries.clone(),
                video_id: video_id.clone(),
                index: 0,
                ticket,
                cancel: token,
                committed: false,
            },
            reference,
        ))
    }

    /// Store a fetched payload if its claim is still current, then settle health and state
    fn commit_segment(
        &self,
        claim: &mut SegmentClaim,
        payload: Bytes,
        first_segment: bool,
    ) -> CommitOutcome {
        let size = payload.len() as u64;
        let mut entries = self.write_entries();

        let current = entries
            .get(&claim.video_id)
            .and_then(|entry| entry.segments.get(claim.index))
            .map(|segment| segment.loading_ticket() == Some(claim.ticket))
            .unwrap_or(false);
        if !current {
            return CommitOutcome::Stale;
        }

        let outcome = self
            .lock_cache()
            .insert(SegmentKey::new(claim.video_id.clone(), claim.index), payload);
        if !outcome.stored {
            // Dropping the claim resets the segment to pending
            return CommitOutcome::Rejected;
        }
        claim.committed = true;

        for key in &outcome.evicted {
            if let Some(evicted_entry) = entries.get_mut(&key.video_id) {
                evicted_entry.mark_evicted(key.index);
            }
        }
        if !outcome.evicted.is_empty() {
            self.stats.add_evictions(outcome.evicted.len() as u64);
        }
        self.stats.record_segment_loaded(size);

        let Some(entry) = entries.get_mut(&claim.video_id) else {
            return CommitOutcome::Stale;
        };
        if let Some(segment) = entry.segments.get_mut(claim.index) {
            segment.status = SegmentStatus::Loaded;
        }

        if first_segment {
            let health = entry.computed_health().max(self.config.first_segment_health);
            entry.raise_health(health);
            entry.transition(VideoState::Ready, Some("first segment cached".to_string()));
        } else {
            let health = entry.computed_health();
            entry.raise_health(health);
        }

        trace!(
            "Segment {} of {} cached ({} bytes), health {}%",
            claim.index,
            claim.video_id,
            size,
            entry.buffer_health()
        );

        if entry.all_loaded() {
            entry.transition(
                VideoState::FullyBuffered,
                Some("all segments cached".to_string()),
            );
        }
        CommitOutcome::Stored
    }

    fn fall_back(&self, video_id: &VideoId, generation: u64, reason: impl Into<String>) {
        let reason = reason.into();
        let mut entries = self.write_entries();
        if let Some(entry) = entries
            .get_mut(video_id)
            .filter(|entry| entry.generation == generation)
        {
            info!("{} falls back to original delivery: {}", video_id, reason);
            entry.fall_back(reason);
            self.stats.increment_fallback();
        }
    }

    /// Forget a half-built entry after its initialization was cancelled
    fn discard(&self, video_id: &VideoId, generation: u64) {
        let mut entries = self.write_entries();
        let owned = entries
            .get(video_id)
            .map(|entry| entry.generation == generation)
            .unwrap_or(false);
        if !owned {
            return;
        }

        if let Some(mut entry) = entries.remove(video_id) {
            entry.abandon_loading();
            self.lock_cache().remove_video(video_id);
            debug!("Initialization of {} cancelled, entry discarded", video_id);
        }
    }

    /// Fetch further segments of a ready video in the background.
    ///
    /// Segments already loaded or in flight are skipped. Failures are logged and
    /// leave the segment pending; they never move the entry to fallback.
    pub async fn continue_loading(
        &self,
        video_id: &VideoId,
        limit: SegmentLimit,
        cancel: &CancellationToken,
    ) {
        let claims = {
            let mut entries = self.write_entries();
            let Some(entry) = entries.get_mut(video_id) else {
                trace!("continue_loading: {} is unknown", video_id);
                return;
            };
            if !entry.state().serves_segments() {
                trace!(
                    "continue_loading: {} is {}, nothing to load",
                    video_id,
                    entry.state()
                );
                return;
            }

            let upper = match limit {
                SegmentLimit::All => entry.segments.len(),
                SegmentLimit::Count(count) => count.min(entry.segments.len()),
            };

            let mut claims = Vec::new();
            for segment in entry.segments.iter_mut().take(upper) {
                if !segment.is_pending() {
                    continue;
                }
                let ticket = self.ticket();
                let token = cancel.child_token();
                segment.status = SegmentStatus::Loading {
                    ticket,
                    cancel: token.clone(),
                };
                claims.push((
                    SegmentClaim {
                        entries: self.entries.clone(),
                        video_id: video_id.clone(),
                        index: segment.index,
                        ticket,
                        cancel: token,
                        committed: false,
                    },
                    segment.reference.clone(),
                ));
            }

            if !claims.is_empty() && entry.state() == VideoState::Ready {
                entry.transition(
                    VideoState::BackgroundLoading,
                    Some(format!("{} segments queued", claims.len())),
                );
            }
            claims
        };

        if claims.is_empty() {
            return;
        }
        debug!(
            "Background loading {} segments of {}",
            claims.len(),
            video_id
        );

        stream::iter(claims)
            .map(|(claim, reference)| async move {
                let result = if claim.cancel.is_cancelled() {
                    Err(StreamError::Cancelled)
                } else {
                    self.transport.fetch(&reference, &claim.cancel).await
                };
                (claim, result)
            })
            .buffer_unordered(self.config.max_concurrent_fetches.max(1))
            .for_each(|(mut claim, result)| {
                match result {
                    Ok(payload) => {
                        if let CommitOutcome::Rejected =
                            self.commit_segment(&mut claim, payload, false)
                        {
                            self.stats.increment_segment_failed();
                        }
                    }
                    Err(StreamError::Cancelled) => {
                        trace!("Segment {} of {} cancelled", claim.index, claim.video_id);
                        self.stats.increment_segment_cancelled();
                    }
                    Err(e) => {
                        warn!(
                            "Background segment {} of {} failed: {}",
                            claim.index, claim.video_id, e
                        );
                        self.stats.increment_segment_failed();
                    }
                }
                futures::future::ready(())
            })
            .await;
    }

    /// Re-plan a provisional per-file segment plan from a measured duration
    pub fn update_duration(&self, video_id: &VideoId, duration_secs: f64) {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return;
        }

        let mut entries = self.write_entries();
        let Some(entry) = entries.get_mut(video_id) else {
            return;
        };

        if entry.segments.is_empty() && !entry.state().is_settled() {
            // Planning has not happened yet; use the real duration when it does
            entry.reported_duration_secs = Some(duration_secs);
            return;
        }

        if !entry.duration_is_provisional
            || entry.source != Some(SegmentSource::PerFileSegments)
            || entry.uses_original_fallback()
        {
            return;
        }
        entry.duration_is_provisional = false;
        entry.reported_duration_secs = Some(duration_secs);

        let count = self.config.segment_count_for(duration_secs);
        if count == entry.segments.len() {
            return;
        }

        let Some(references) = (0..count)
            .map(|index| locator::segment_locator(&entry.original_reference, index))
            .collect::<Option<Vec<_>>>()
        else {
            return;
        };

        info!(
            "Re-planning {} from {} to {} segments ({:.1}s)",
            video_id,
            entry.segments.len(),
            count,
            duration_secs
        );
        let dropped = entry.replan(references);
        if entry.loaded_count() > 0 {
            entry.raise_health(self.config.first_segment_health);
        }

        match entry.state() {
            VideoState::Ready | VideoState::BackgroundLoading if entry.all_loaded() => {
                if entry.state() == VideoState::Ready {
                    entry.transition(VideoState::BackgroundLoading, None);
                }
                entry.transition(
                    VideoState::FullyBuffered,
                    Some("plan shrank to resident segments".to_string()),
                );
                entry.raise_health(100);
            }
            VideoState::FullyBuffered if !entry.all_loaded() => {
                entry.transition(
                    VideoState::BackgroundLoading,
                    Some("plan grew".to_string()),
                );
            }
            _ => {}
        }

        let mut cache = self.lock_cache();
        for index in dropped {
            cache.remove(&SegmentKey::new(video_id.clone(), index));
        }
    }

    /// Stop every in-flight fetch for one video. Resident payloads stay cached.
    pub fn cancel_video(&self, video_id: &VideoId) {
        let mut entries = self.write_entries();
        if let Some(entry) = entries.get_mut(video_id) {
            let abandoned = entry.abandon_loading();
            if !entry.state().is_settled() {
                entry.cancel.cancel();
            }
            if abandoned > 0 {
                debug!("Cancelled {} in-flight segments of {}", abandoned, video_id);
            }
        }
    }

    /// Cancel everything and forget every entry and payload. Idempotent.
    pub fn cleanup(&self) {
        let mut entries = self.write_entries();
        let mut abandoned = 0;
        for entry in entries.values_mut() {
            abandoned += entry.abandon_loading();
            entry.cancel.cancel();
        }
        let count = entries.len();
        entries.clear();
        self.lock_cache().clear();

        if count > 0 {
            info!(
                "Segment fetcher cleaned up: {} entries dropped, {} fetches cancelled",
                count, abandoned
            );
        }
    }

    pub fn state(&self, video_id: &VideoId) -> Option<VideoState> {
        self.read_entries().get(video_id).map(VideoEntry::state)
    }

    /// Buffer health of a video; 0 when unknown
    pub fn buffer_health(&self, video_id: &VideoId) -> u8 {
        self.read_entries()
            .get(video_id)
            .map(VideoEntry::buffer_health)
            .unwrap_or(0)
    }

    pub fn snapshot(&self, video_id: &VideoId) -> Option<VideoSnapshot> {
        self.read_entries().get(video_id).map(VideoEntry::snapshot)
    }

    pub fn snapshots(&self) -> Vec<VideoSnapshot> {
        let mut snapshots: Vec<_> = self
            .read_entries()
            .values()
            .map(VideoEntry::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Segments currently being fetched, across all videos
    pub fn in_flight_count(&self) -> usize {
        self.read_entries()
            .values()
            .map(VideoEntry::loading_count)
            .sum()
    }

    pub fn cache_size(&self) -> u64 {
        self.lock_cache().current_size()
    }

    pub fn cache_budget(&self) -> u64 {
        self.lock_cache().budget()
    }

    pub fn config(&self) -> &StreamCacheConfig {
        &self.config
    }
}
