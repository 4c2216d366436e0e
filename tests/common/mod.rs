#![allow(dead_code)]

pub mod mocks;

use reelstream::models::FeedItem;
use reelstream::{Config, StreamingEngine};
use std::sync::Arc;
use std::time::Duration;

pub use mocks::MockCdn;

pub fn video_url(index: usize) -> String {
    format!("https://cdn.test/reels/{index}/clip.mp4")
}

pub fn poster_url(index: usize) -> String {
    format!("https://cdn.test/reels/{index}/poster.jpg")
}

/// Feed of `len` items whose ids are `reel-{index}`
pub fn feed(len: usize) -> Vec<FeedItem> {
    (0..len)
        .map(|index| FeedItem::new(format!("reel-{index}"), video_url(index), poster_url(index)))
        .collect()
}

/// CDN serving ten 3-second segments and a poster for every item of `feed(len)`
pub fn segmented_cdn(len: usize, segment_delay: Duration) -> MockCdn {
    let cdn = MockCdn::new();
    for index in 0..len {
        cdn.serve_segments(&video_url(index), 10, 64, segment_delay);
        cdn.serve(&poster_url(index), vec![0xFF, 0xD8, 0xFF], Duration::from_millis(20));
    }
    cdn
}

pub fn quiet_config() -> Config {
    let mut config = Config::default();
    config.cache.enable_stats = false;
    config
}

pub struct TestEngine {
    pub engine: StreamingEngine,
    pub cdn: MockCdn,
}

impl TestEngine {
    pub fn new(cdn: MockCdn) -> Self {
        Self::with_config(cdn, quiet_config())
    }

    pub fn with_config(cdn: MockCdn, config: Config) -> Self {
        let engine = StreamingEngine::new(&config, Arc::new(cdn.clone()));
        Self { engine, cdn }
    }
}

/// Let spawned prefetch work run for `duration` of (paused) time
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}
