pub mod config;
pub mod manifest;
pub mod prober;
pub mod resolver;
pub mod segment_cache;
pub mod segment_fetcher;
pub mod state_machine;
pub mod stats;
pub mod transport;

pub use config::StreamCacheConfig;
pub use prober::{SegmentProber, SegmentSource};
pub use resolver::{PlayableReference, PlayableResolver};
pub use segment_cache::{CacheEntry, InsertOutcome, SegmentCache, SegmentKey};
pub use segment_fetcher::{SegmentFetcher, SegmentLimit};
pub use state_machine::{FetchPriority, VideoSnapshot, VideoState};
pub use stats::{EngineStats, StatsSnapshot};
pub use transport::{HttpTransport, MediaTransport};
