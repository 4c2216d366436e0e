use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::NetworkConfig;
use crate::utils::{StreamError, StreamResult};

/// Network seam of the delivery layer.
///
/// Everything that touches the CDN goes through this trait so the fetch pipeline
/// can be driven by scripted transports in tests.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Issue a HEAD request and report the status code
    async fn head(&self, url: &str) -> StreamResult<u16>;

    /// Fetch the whole body of `url`, giving up as soon as `cancel` fires
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> StreamResult<Bytes>;
}

/// reqwest-backed transport with a shared connection pool
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &NetworkConfig) -> StreamResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(StreamError::from_reqwest)?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn fetch_body(&self, url: &str) -> StreamResult<Bytes> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(StreamError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await.map_err(StreamError::from_reqwest)?;
        trace!("Fetched {} bytes from {}", body.len(), url);
        Ok(body)
    }
}

#[async_trait]
impl MediaTransport for HttpTransport {
    async fn head(&self, url: &str) -> StreamResult<u16> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(StreamError::from_reqwest)?;
        let status = response.status().as_u16();
        debug!("HEAD {} -> {}", url, status);
        Ok(status)
    }

    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> StreamResult<Bytes> {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Fetch of {} cancelled", url);
                Err(StreamError::Cancelled)
            }
            result = self.fetch_body(url) => result,
        }
    }
}
