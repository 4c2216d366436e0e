use serde::{Deserialize, Serialize};

use super::VideoId;

/// One entry of the feed window as seen by the delivery layer.
///
/// Locators are opaque strings; the metadata store that produced them is not consulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub video_id: VideoId,
    pub video_reference: String,
    #[serde(default)]
    pub poster_reference: String,
}

impl FeedItem {
    pub fn new(
        video_id: impl Into<VideoId>,
        video_reference: impl Into<String>,
        poster_reference: impl Into<String>,
    ) -> Self {
        Self {
            video_id: video_id.into(),
            video_reference: video_reference.into(),
            poster_reference: poster_reference.into(),
        }
    }
}
