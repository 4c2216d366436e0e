//! Adaptive delivery layer for a vertical short-video feed.
//!
//! Splits videos into cacheable segments when the host supports it, keeps a
//! bounded in-memory segment cache, and prepares the videos around the
//! visible feed position ahead of the user scrolling to them.

pub mod cache;
pub mod config;
pub mod engine;
pub mod models;
pub mod utils;
pub mod workers;

#[cfg(test)]
mod test_utils;

pub use config::Config;
pub use engine::StreamingEngine;
