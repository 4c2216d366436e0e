use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::prober::SegmentSource;
use crate::models::VideoId;

/// Delivery state of one video entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoState {
    /// Known but not yet probed
    Idle,
    /// Availability probe (or manifest fetch) in flight
    Probing,
    /// First segment fetch in flight
    LoadingFirstSegment,
    /// First segment resident, playback can start from cache
    Ready,
    /// Remaining segments are being fetched
    BackgroundLoading,
    /// Every planned segment is resident
    FullyBuffered,
    /// Delivered from the original locator; terminal-ready
    Fallback,
    /// Reserved. Every failure path routes to `Fallback` instead.
    Error,
}

impl VideoState {
    /// True once initialization has reached a resting point
    pub fn is_settled(&self) -> bool {
        !matches!(
            self,
            Self::Idle | Self::Probing | Self::LoadingFirstSegment
        )
    }

    /// True when cached segments may be served
    pub fn serves_segments(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::BackgroundLoading | Self::FullyBuffered
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Probing => "Probing",
            Self::LoadingFirstSegment => "LoadingFirstSegment",
            Self::Ready => "Ready",
            Self::BackgroundLoading => "BackgroundLoading",
            Self::FullyBuffered => "FullyBuffered",
            Self::Fallback => "Fallback",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for VideoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check if a state transition is valid
pub fn is_valid_transition(from: VideoState, to: VideoState) -> bool {
    use VideoState::*;

    match (from, to) {
        (Idle, Probing) => true,
        (Probing, LoadingFirstSegment) => true,
        (LoadingFirstSegment, Ready) => true,
        (Ready, BackgroundLoading) => true,
        // Single-segment plans skip background loading
        (Ready, FullyBuffered) => true,
        (BackgroundLoading, FullyBuffered) => true,
        // Eviction of a resident segment
        (FullyBuffered, BackgroundLoading) => true,
        (Fallback, _) => false,
        (_, Fallback) => true,
        _ => false,
    }
}

/// Priority hint given at initialization. Recorded and logged; it does not reorder work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl FromStr for FetchPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("Unknown priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SegmentStatus {
    Pending,
    /// Fetch in flight; `ticket` identifies the claim that owns it
    Loading {
        ticket: u64,
        cancel: CancellationToken,
    },
    Loaded,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub index: usize,
    pub reference: String,
    pub status: SegmentStatus,
}

impl Segment {
    pub fn new(index: usize, reference: String) -> Self {
        Self {
            index,
            reference,
            status: SegmentStatus::Pending,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.status, SegmentStatus::Loaded)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.status, SegmentStatus::Loading { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, SegmentStatus::Pending)
    }

    pub fn loading_ticket(&self) -> Option<u64> {
        match &self.status {
            SegmentStatus::Loading { ticket, .. } => Some(*ticket),
            _ => None,
        }
    }

    /// Cancel an in-flight fetch and return the segment to pending
    pub fn abandon(&mut self) -> bool {
        if let SegmentStatus::Loading { cancel, .. } = &self.status {
            cancel.cancel();
            self.status = SegmentStatus::Pending;
            true
        } else {
            false
        }
    }
}

/// State transition event
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: VideoState,
    pub to: VideoState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Everything the engine knows about one video
#[derive(Debug)]
pub struct VideoEntry {
    pub id: VideoId,
    pub original_reference: String,
    pub source: Option<SegmentSource>,
    pub segments: Vec<Segment>,
    pub segment_duration_secs: f64,
    /// Start time of every segment followed by the end of the last one, when the
    /// plan lists real durations. `None` means fixed `segment_duration_secs` slots.
    pub segment_bounds: Option<Vec<f64>>,
    pub priority: FetchPriority,
    /// Segment plan derived from the assumed duration rather than a measured one
    pub duration_is_provisional: bool,
    /// Duration reported by the player before the segment plan existed
    pub reported_duration_secs: Option<f64>,
    /// Cancels the initialization that created this entry
    pub cancel: CancellationToken,
    /// Distinguishes this entry from a later one created under the same id
    pub generation: u64,
    state: VideoState,
    uses_original_fallback: bool,
    buffer_health: u8,
    transitions: Vec<StateTransition>,
    settled: watch::Sender<bool>,
}

impl VideoEntry {
    pub fn new(
        id: VideoId,
        original_reference: String,
        priority: FetchPriority,
        segment_duration_secs: f64,
        cancel: CancellationToken,
    ) -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            id,
            original_reference,
            source: None,
            segments: Vec::new(),
            segment_duration_secs,
            segment_bounds: None,
            priority,
            duration_is_provisional: false,
            reported_duration_secs: None,
            cancel,
            generation: 0,
            state: VideoState::Idle,
            uses_original_fallback: false,
            buffer_health: 0,
            transitions: Vec::new(),
            settled,
        }
    }

    pub fn state(&self) -> VideoState {
        self.state
    }

    pub fn buffer_health(&self) -> u8 {
        self.buffer_health
    }

    pub fn uses_original_fallback(&self) -> bool {
        self.uses_original_fallback
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Receiver that flips to `true` once initialization settles
    pub fn subscribe_settled(&self) -> watch::Receiver<bool> {
        self.settled.subscribe()
    }

    /// Apply a transition if it is valid. Invalid transitions are logged and ignored.
    pub fn transition(&mut self, to: VideoState, reason: Option<String>) -> bool {
        let from = self.state;
        if from == to {
            return true;
        }

        if !is_valid_transition(from, to) {
            warn!(
                "Ignoring invalid state transition for {}: {} -> {}",
                self.id, from, to
            );
            return false;
        }

        debug!(
            "State transition for {}: {} -> {} (reason: {:?})",
            self.id, from, to, reason
        );

        self.transitions.push(StateTransition {
            from,
            to,
            timestamp: Utc::now(),
            reason,
        });
        self.state = to;
        self.settled.send_replace(to.is_settled());
        true
    }

    /// Route delivery to the original locator. One-way.
    pub fn fall_back(&mut self, reason: impl Into<String>) {
        if self.uses_original_fallback {
            return;
        }
        for segment in &mut self.segments {
            segment.abandon();
        }
        self.uses_original_fallback = true;
        self.buffer_health = 100;
        self.transition(VideoState::Fallback, Some(reason.into()));
    }

    pub fn loaded_count(&self) -> usize {
        self.segments.iter().filter(|s| s.is_loaded()).count()
    }

    pub fn loading_count(&self) -> usize {
        self.segments.iter().filter(|s| s.is_loading()).count()
    }

    pub fn all_loaded(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(Segment::is_loaded)
    }

    /// Index of the segment covering `position_secs`.
    ///
    /// Positions past the end of the plan map to `segments.len()`. Negative and
    /// non-finite positions count as 0.
    pub fn segment_index_at(&self, position_secs: f64) -> usize {
        let position = if position_secs.is_finite() {
            position_secs.max(0.0)
        } else {
            0.0
        };

        match &self.segment_bounds {
            Some(bounds) if bounds.len() == self.segments.len() + 1 => {
                if bounds.last().is_none_or(|end| position >= *end) {
                    return self.segments.len();
                }
                bounds.partition_point(|start| *start <= position).saturating_sub(1)
            }
            _ => (position / self.segment_duration_secs).floor() as usize,
        }
    }

    /// Health derived purely from resident segments
    pub fn computed_health(&self) -> u8 {
        if self.segments.is_empty() {
            return 0;
        }
        ((self.loaded_count() * 100) / self.segments.len()) as u8
    }

    /// Raise health to at least `value`; never lowers it
    pub fn raise_health(&mut self, value: u8) {
        if self.uses_original_fallback {
            return;
        }
        let value = if self.all_loaded() {
            value.min(100)
        } else {
            value.min(99)
        };
        self.buffer_health = self.buffer_health.max(value);
    }

    /// A resident segment was evicted from the cache store
    pub fn mark_evicted(&mut self, index: usize) {
        let Some(segment) = self.segments.get_mut(index) else {
            return;
        };
        if !segment.is_loaded() {
            return;
        }
        segment.status = SegmentStatus::Pending;
        self.buffer_health = self.computed_health();

        if self.state == VideoState::FullyBuffered {
            self.transition(
                VideoState::BackgroundLoading,
                Some(format!("segment {} evicted", index)),
            );
        }
    }

    /// Replace the segment plan, keeping loaded segments whose index survives
    pub(crate) fn replan(&mut self, references: Vec<String>) -> Vec<usize> {
        let mut dropped = Vec::new();
        for segment in self.segments.iter_mut().skip(references.len()) {
            segment.abandon();
            if segment.is_loaded() {
                dropped.push(segment.index);
            }
        }

        let previous = std::mem::take(&mut self.segments);
        self.segments = references
            .into_iter()
            .enumerate()
            .map(|(index, reference)| {
                let status = match previous.get(index) {
                    Some(old) if old.reference == reference => old.status.clone(),
                    Some(old) => {
                        let mut old = old.clone();
                        old.abandon();
                        if old.is_loaded() {
                            dropped.push(index);
                        }
                        SegmentStatus::Pending
                    }
                    None => SegmentStatus::Pending,
                };
                Segment {
                    index,
                    reference,
                    status,
                }
            })
            .collect();

        self.segment_bounds = None;
        // Stale plan health no longer describes the new segment count
        self.buffer_health = self.computed_health();
        dropped
    }

    /// Cancel every in-flight segment fetch, returning how many were abandoned
    pub fn abandon_loading(&mut self) -> usize {
        self.segments
            .iter_mut()
            .map(|s| s.abandon())
            .filter(|abandoned| *abandoned)
            .count()
    }

    pub fn snapshot(&self) -> VideoSnapshot {
        VideoSnapshot {
            id: self.id.clone(),
            original_reference: self.original_reference.clone(),
            source: self.source,
            state: self.state,
            uses_original_fallback: self.uses_original_fallback,
            buffer_health: self.buffer_health,
            priority: self.priority,
            segment_count: self.segments.len(),
            loaded_segments: self.loaded_count(),
            loading_segments: self.loading_count(),
            segment_duration_secs: self.segment_duration_secs,
            duration_is_provisional: self.duration_is_provisional,
            transitions: self.transitions.clone(),
        }
    }
}

/// Read-only copy of a [`VideoEntry`] for callers outside the engine
#[derive(Debug, Clone, Serialize)]
pub struct VideoSnapshot {
    pub id: VideoId,
    pub original_reference: String,
    pub source: Option<SegmentSource>,
    pub state: VideoState,
    pub uses_original_fallback: bool,
    pub buffer_health: u8,
    pub priority: FetchPriority,
    pub segment_count: usize,
    pub loaded_segments: usize,
    pub loading_segments: usize,
    pub segment_duration_secs: f64,
    pub duration_is_provisional: bool,
    pub transitions: Vec<StateTransition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_segments(count: usize) -> VideoEntry {
        let mut entry = VideoEntry::new(
            VideoId::from("v1"),
            "https://cdn.test/v1.mp4".to_string(),
            FetchPriority::High,
            3.0,
            CancellationToken::new(),
        );
        entry.segments = (0..count)
            .map(|i| Segment::new(i, format!("https://cdn.test/v1_seg{}.mp4", i)))
            .collect();
        entry
    }

    #[test]
    fn test_segment_index_with_fixed_slots() {
        let entry = entry_with_segments(10);
        assert_eq!(entry.segment_index_at(0.0), 0);
        assert_eq!(entry.segment_index_at(2.9), 0);
        assert_eq!(entry.segment_index_at(3.0), 1);
        assert_eq!(entry.segment_index_at(28.0), 9);
        assert_eq!(entry.segment_index_at(-4.0), 0);
        assert_eq!(entry.segment_index_at(f64::NAN), 0);
        assert_eq!(entry.segment_index_at(31.0), 10);
    }

    #[test]
    fn test_segment_index_with_listed_durations() {
        let mut entry = entry_with_segments(12);
        entry.segment_duration_secs = 6.0;
        entry.segment_bounds = Some((0..=12).map(|i| i as f64 * 5.005).collect());

        assert_eq!(entry.segment_index_at(0.0), 0);
        assert_eq!(entry.segment_index_at(5.004), 0);
        assert_eq!(entry.segment_index_at(5.005), 1);
        assert_eq!(entry.segment_index_at(55.5), 11);
        assert_eq!(entry.segment_index_at(61.0), 12);
        assert_eq!(entry.segment_index_at(-1.0), 0);
    }

    #[test]
    fn test_state_transitions() {
        use VideoState::*;

        assert!(is_valid_transition(Idle, Probing));
        assert!(is_valid_transition(Probing, LoadingFirstSegment));
        assert!(is_valid_transition(LoadingFirstSegment, Ready));
        assert!(is_valid_transition(Ready, BackgroundLoading));
        assert!(is_valid_transition(Ready, FullyBuffered));
        assert!(is_valid_transition(BackgroundLoading, FullyBuffered));
        assert!(is_valid_transition(FullyBuffered, BackgroundLoading));
        assert!(is_valid_transition(Probing, Fallback));
        assert!(is_valid_transition(LoadingFirstSegment, Fallback));

        assert!(!is_valid_transition(Fallback, Ready));
        assert!(!is_valid_transition(Fallback, Idle));
        assert!(!is_valid_transition(Ready, Idle));
        assert!(!is_valid_transition(Idle, Ready));
        assert!(!is_valid_transition(Probing, Ready));
    }

    #[test]
    fn test_transition_log_and_settled_signal() {
        let mut entry = entry_with_segments(2);
        let settled = entry.subscribe_settled();

        assert!(entry.transition(VideoState::Probing, None));
        assert!(!*settled.borrow());
        assert!(entry.transition(VideoState::LoadingFirstSegment, None));
        assert!(entry.transition(VideoState::Ready, Some("first segment".into())));
        assert!(*settled.borrow());

        assert!(!entry.transition(VideoState::Idle, None));
        assert_eq!(entry.state(), VideoState::Ready);
        assert_eq!(entry.transitions().len(), 3);
        assert_eq!(entry.transitions()[2].reason.as_deref(), Some("first segment"));
    }

    #[test]
    fn test_fallback_is_one_way() {
        let mut entry = entry_with_segments(3);
        entry.transition(VideoState::Probing, None);
        entry.fall_back("probe denied");

        assert!(entry.uses_original_fallback());
        assert_eq!(entry.buffer_health(), 100);
        assert_eq!(entry.state(), VideoState::Fallback);

        assert!(!entry.transition(VideoState::LoadingFirstSegment, None));
        entry.raise_health(10);
        assert_eq!(entry.buffer_health(), 100);
        assert!(entry.uses_original_fallback());
    }

    #[test]
    fn test_health_is_monotonic_and_capped() {
        let mut entry = entry_with_segments(4);
        entry.segments[0].status = SegmentStatus::Loaded;
        entry.raise_health(25);
        assert_eq!(entry.buffer_health(), 25);

        entry.segments[1].status = SegmentStatus::Loaded;
        assert_eq!(entry.computed_health(), 50);
        entry.raise_health(entry.computed_health());
        entry.raise_health(10);
        assert_eq!(entry.buffer_health(), 50);

        // 100 requires every segment resident
        entry.raise_health(100);
        assert_eq!(entry.buffer_health(), 99);

        for segment in &mut entry.segments {
            segment.status = SegmentStatus::Loaded;
        }
        entry.raise_health(entry.computed_health());
        assert_eq!(entry.buffer_health(), 100);
        assert!(entry.all_loaded());
    }

    #[test]
    fn test_eviction_lowers_health_and_leaves_fully_buffered() {
        let mut entry = entry_with_segments(2);
        entry.transition(VideoState::Probing, None);
        entry.transition(VideoState::LoadingFirstSegment, None);
        entry.transition(VideoState::Ready, None);
        for segment in &mut entry.segments {
            segment.status = SegmentStatus::Loaded;
        }
        entry.raise_health(100);
        entry.transition(VideoState::FullyBuffered, None);

        entry.mark_evicted(0);
        assert!(entry.segments[0].is_pending());
        assert_eq!(entry.buffer_health(), 50);
        assert_eq!(entry.state(), VideoState::BackgroundLoading);
    }

    #[test]
    fn test_abandon_cancels_tokens() {
        let mut entry = entry_with_segments(3);
        let token = entry.cancel.child_token();
        entry.segments[1].status = SegmentStatus::Loading {
            ticket: 7,
            cancel: token.clone(),
        };

        assert_eq!(entry.segments[1].loading_ticket(), Some(7));
        assert_eq!(entry.abandon_loading(), 1);
        assert!(token.is_cancelled());
        assert!(entry.segments.iter().all(Segment::is_pending));
        assert_eq!(entry.abandon_loading(), 0);
    }

    #[test]
    fn test_replan_keeps_surviving_segments() {
        let mut entry = entry_with_segments(10);
        entry.segments[0].status = SegmentStatus::Loaded;
        entry.segments[5].status = SegmentStatus::Loaded;

        let references = (0..4)
            .map(|i| format!("https://cdn.test/v1_seg{}.mp4", i))
            .collect();
        let dropped = entry.replan(references);

        assert_eq!(dropped, vec![5]);
        assert_eq!(entry.segments.len(), 4);
        assert!(entry.segments[0].is_loaded());
        assert_eq!(entry.buffer_health(), 25);
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!("high".parse::<FetchPriority>(), Ok(FetchPriority::High));
        assert_eq!("LOW".parse::<FetchPriority>(), Ok(FetchPriority::Low));
        assert!("urgent".parse::<FetchPriority>().is_err());
        assert!(FetchPriority::High > FetchPriority::Normal);
    }
}
