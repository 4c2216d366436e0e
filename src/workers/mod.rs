/// Background preparation driven by the feed viewport
pub mod prefetch_orchestrator;
pub mod thumbnail_prefetcher;

pub use prefetch_orchestrator::{IntentInfo, PrefetchOrchestrator, PrefetchTier};
pub use thumbnail_prefetcher::{
    DisplayStrategy, PLACEHOLDER_IMAGE, ThumbnailEntry, ThumbnailPrefetcher,
};
