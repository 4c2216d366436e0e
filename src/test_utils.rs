#![cfg(test)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::MediaTransport;
use crate::utils::{StreamError, StreamResult};

/// Canned answer for one URL
#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub body: Bytes,
    /// Applied to body fetches
    pub delay: Duration,
    pub head_delay: Duration,
    /// Overrides `status` for existence checks
    pub head_status: Option<u16>,
    pub network_failure: bool,
    /// Keep going after cancellation, like a body that was already buffered
    pub ignores_cancel: bool,
}

impl Route {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
            head_delay: Duration::ZERO,
            head_status: None,
            network_failure: false,
            ignores_cancel: false,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Bytes::new(),
            delay: Duration::ZERO,
            head_delay: Duration::ZERO,
            head_status: None,
            network_failure: false,
            ignores_cancel: false,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            network_failure: true,
            ..Self::status(0)
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn head_delayed(mut self, delay: Duration) -> Self {
        self.head_delay = delay;
        self
    }

    pub fn with_head_status(mut self, status: u16) -> Self {
        self.head_status = Some(status);
        self
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.ignores_cancel = true;
        self
    }
}

#[derive(Default)]
struct Calls {
    heads: HashMap<String, usize>,
    fetches: HashMap<String, usize>,
    outstanding: HashMap<String, usize>,
}

/// In-memory transport driven by per-URL routes.
///
/// Unknown URLs answer 404. Delays are cancel-aware sleeps, so tests can run
/// under paused time and observe in-flight fetches through `outstanding`.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    routes: Arc<Mutex<HashMap<String, Route>>>,
    calls: Arc<Mutex<Calls>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, url: &str, route: Route) -> &Self {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), route);
        self
    }

    /// Register `count` per-file segments of `payload_size` bytes next to `original`
    pub fn segmented(&self, original: &str, count: usize, payload_size: usize, delay: Duration) {
        for index in 0..count {
            if let Some(url) = crate::utils::locator::segment_locator(original, index) {
                self.route(
                    &url,
                    Route::ok(vec![index as u8; payload_size]).delayed(delay),
                );
            }
        }
    }

    pub fn head_count(&self, url: &str) -> usize {
        let calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.heads.get(url).copied().unwrap_or(0)
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        let calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.fetches.get(url).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        let calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.fetches.values().sum()
    }

    /// Fetches currently in flight for URLs starting with `prefix`
    pub fn outstanding(&self, prefix: &str) -> usize {
        let calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls
            .outstanding
            .iter()
            .filter(|(url, _)| url.starts_with(prefix))
            .map(|(_, count)| *count)
            .sum()
    }

    fn lookup(&self, url: &str) -> Route {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .unwrap_or_else(|| Route::status(404))
    }

    fn answer(route: &Route, url: &str) -> StreamResult<Bytes> {
        if route.network_failure {
            return Err(StreamError::Network(format!("unreachable: {}", url)));
        }
        if !(200..300).contains(&route.status) {
            return Err(StreamError::Http {
                status: route.status,
                url: url.to_string(),
            });
        }
        Ok(route.body.clone())
    }
}

struct Outstanding {
    calls: Arc<Mutex<Calls>>,
    url: String,
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = calls.outstanding.get_mut(&self.url) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl MediaTransport for ScriptedTransport {
    async fn head(&self, url: &str) -> StreamResult<u16> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            *calls.heads.entry(url.to_string()).or_default() += 1;
        }

        let route = self.lookup(url);
        if !route.head_delay.is_zero() {
            tokio::time::sleep(route.head_delay).await;
        }
        if route.network_failure {
            return Err(StreamError::Network(format!("unreachable: {}", url)));
        }
        Ok(route.head_status.unwrap_or(route.status))
    }

    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> StreamResult<Bytes> {
        let _outstanding = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            *calls.fetches.entry(url.to_string()).or_default() += 1;
            *calls.outstanding.entry(url.to_string()).or_default() += 1;
            Outstanding {
                calls: self.calls.clone(),
                url: url.to_string(),
            }
        };

        let route = self.lookup(url);
        if route.ignores_cancel {
            tokio::time::sleep(route.delay).await;
            return Self::answer(&route, url);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamError::Cancelled),
            _ = tokio::time::sleep(route.delay) => Self::answer(&route, url),
        }
    }
}
