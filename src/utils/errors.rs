use std::time::Duration;
use thiserror::Error;

/// Failure modes of the delivery pipeline's network and planning steps.
///
/// None of these escape the engine's public surface: callers only ever observe
/// the degraded outcome (fallback state, placeholder poster, original reference).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Connection-level failure (DNS, refused, reset, TLS)
    #[error("Network error: {0}")]
    Network(String),

    /// Server answered with a non-success status
    #[error("HTTP status {status} for {url}")]
    Http { status: u16, url: String },

    /// Operation exceeded its time bound
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Cancellation token fired before the operation completed
    #[error("Operation cancelled")]
    Cancelled,

    /// Manifest could not be used to plan segments
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Resource locator cannot be turned into a segment locator
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),
}

impl StreamError {
    /// Classify a reqwest error
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            StreamError::Network(format!("Request timeout: {}", error))
        } else if error.is_connect() {
            StreamError::Network(format!("Connection failed: {}", error))
        } else if let Some(status) = error.status() {
            StreamError::Http {
                status: status.as_u16(),
                url: error
                    .url()
                    .map(|u| u.to_string())
                    .unwrap_or_default(),
            }
        } else {
            StreamError::Network(error.to_string())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = StreamError::Http {
            status: 404,
            url: "https://cdn.test/a.mp4".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP status 404 for https://cdn.test/a.mp4");

        let err = StreamError::Timeout(Duration::from_secs(1));
        assert_eq!(err.to_string(), "Timed out after 1s");
    }

    #[test]
    fn test_is_cancelled() {
        assert!(StreamError::Cancelled.is_cancelled());
        assert!(!StreamError::Network("reset".into()).is_cancelled());
    }
}
