use async_trait::async_trait;
use bytes::Bytes;
use reelstream::cache::MediaTransport;
use reelstream::utils::locator::segment_locator;
use reelstream::utils::{StreamError, StreamResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct Asset {
    status: u16,
    body: Bytes,
    delay: Duration,
}

#[derive(Default)]
struct Traffic {
    heads: HashMap<String, usize>,
    fetches: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
}

/// In-memory CDN answering HEAD and GET for registered assets.
///
/// Anything not registered answers 404, which is what a host without
/// per-file segments looks like to the prober.
#[derive(Clone, Default)]
pub struct MockCdn {
    assets: Arc<Mutex<HashMap<String, Asset>>>,
    traffic: Arc<Mutex<Traffic>>,
}

impl MockCdn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: Vec<u8>, delay: Duration) -> &Self {
        self.assets.lock().unwrap().insert(
            url.to_string(),
            Asset {
                status: 200,
                body: Bytes::from(body),
                delay,
            },
        );
        self
    }

    pub fn fail(&self, url: &str, status: u16) -> &Self {
        self.assets.lock().unwrap().insert(
            url.to_string(),
            Asset {
                status,
                body: Bytes::new(),
                delay: Duration::ZERO,
            },
        );
        self
    }

    /// Serve `count` per-file segments next to `original`, segment `i` filled with byte `i`
    pub fn serve_segments(&self, original: &str, count: usize, size: usize, delay: Duration) {
        for index in 0..count {
            let url = segment_locator(original, index).unwrap();
            self.serve(&url, vec![index as u8; size], delay);
        }
    }

    pub fn fetches(&self, url: &str) -> usize {
        self.traffic.lock().unwrap().fetches.get(url).copied().unwrap_or(0)
    }

    pub fn heads(&self, url: &str) -> usize {
        self.traffic.lock().unwrap().heads.get(url).copied().unwrap_or(0)
    }

    /// Requests still on the wire for URLs starting with `prefix`
    pub fn in_flight(&self, prefix: &str) -> usize {
        self.traffic
            .lock()
            .unwrap()
            .in_flight
            .iter()
            .filter(|(url, _)| url.starts_with(prefix))
            .map(|(_, count)| *count)
            .sum()
    }

    fn asset(&self, url: &str) -> Option<Asset> {
        self.assets.lock().unwrap().get(url).cloned()
    }
}

struct InFlight {
    traffic: Arc<Mutex<Traffic>>,
    url: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(count) = self.traffic.lock().unwrap().in_flight.get_mut(&self.url) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl MediaTransport for MockCdn {
    async fn head(&self, url: &str) -> StreamResult<u16> {
        *self.traffic.lock().unwrap().heads.entry(url.to_string()).or_default() += 1;
        Ok(self.asset(url).map(|asset| asset.status).unwrap_or(404))
    }

    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> StreamResult<Bytes> {
        let _guard = {
            let mut traffic = self.traffic.lock().unwrap();
            *traffic.fetches.entry(url.to_string()).or_default() += 1;
            *traffic.in_flight.entry(url.to_string()).or_default() += 1;
            InFlight {
                traffic: self.traffic.clone(),
                url: url.to_string(),
            }
        };

        let Some(asset) = self.asset(url) else {
            return Err(StreamError::Http {
                status: 404,
                url: url.to_string(),
            });
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamError::Cancelled),
            _ = tokio::time::sleep(asset.delay) => {
                if (200..300).contains(&asset.status) {
                    Ok(asset.body)
                } else {
                    Err(StreamError::Http { status: asset.status, url: url.to_string() })
                }
            }
        }
    }
}
