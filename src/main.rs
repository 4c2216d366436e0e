use anyhow::{Context, Result, bail};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reelstream::cache::PlayableReference;
use reelstream::models::FeedItem;
use reelstream::{Config, StreamingEngine};

/// How long the demo lets prefetching run before reporting
const SETTLE_TIME: Duration = Duration::from_secs(5);

fn parse_items(args: impl Iterator<Item = String>) -> Vec<FeedItem> {
    args.enumerate()
        .map(|(index, arg)| {
            let (video, poster) = arg.split_once(',').unwrap_or((arg.as_str(), ""));
            FeedItem::new(format!("item-{index}"), video, poster)
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "reelstream=info".into()),
        )
        .init();

    let items = parse_items(std::env::args().skip(1));
    if items.is_empty() {
        bail!("usage: reelstream <video-url[,poster-url]>...");
    }

    let config = Config::load().context("Failed to load configuration")?;
    let engine = StreamingEngine::with_http(&config).context("Failed to build HTTP transport")?;
    engine.start_stats_reporting();

    info!("Preparing {} feed items", items.len());
    engine.on_viewport_changed(0, &items);
    tokio::time::sleep(SETTLE_TIME).await;

    for item in &items {
        let state = engine
            .video_state(&item.video_id)
            .map(|state| state.to_string())
            .unwrap_or_else(|| "untracked".to_string());
        let playable = match engine.resolve(&item.video_id, 0.0) {
            PlayableReference::Cached { segment_index, .. } => {
                format!("cached segment {segment_index}")
            }
            PlayableReference::Original(reference) => format!("original {reference}"),
            PlayableReference::NotReady => "not ready".to_string(),
        };
        println!(
            "{}: {} (health {}%) -> {}",
            item.video_id,
            state,
            engine.buffer_health(&item.video_id),
            playable
        );
    }

    println!("{}", engine.stats_report());
    println!("{}", serde_json::to_string_pretty(&engine.video_snapshots())?);

    engine.cleanup();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_items_splits_poster() {
        let items = parse_items(
            ["https://a/v.mp4,https://a/p.jpg", "https://b/v.m3u8"]
                .into_iter()
                .map(String::from),
        );
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].video_id.as_str(), "item-0");
        assert_eq!(items[0].poster_reference, "https://a/p.jpg");
        assert_eq!(items[1].video_reference, "https://b/v.m3u8");
        assert_eq!(items[1].poster_reference, "");
    }
}
