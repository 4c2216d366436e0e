pub mod feed;
pub mod identifiers;

pub use feed::FeedItem;
pub use identifiers::VideoId;
