use std::time::Duration;

use thiserror::Error;
use url::Url;

use super::config::FetchLimits;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("import file URL is not a fetchable http(s) URL: {0}")]
    InvalidUrl(String),
    #[error("transport error fetching import file: {0}")]
    Transport(String),
    #[error("import file request timed out after {0:?}")]
    Timeout(Duration),
    #[error("file host returned status {status}")]
    Status { status: u16 },
    #[error("import file exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
}

impl FetchError {
    /// Connection problems, timeouts, throttling and server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout(_) => true,
            FetchError::Status { status } => {
                *status == 408 || *status == 429 || (500..=599).contains(status)
            }
            FetchError::InvalidUrl(_) | FetchError::TooLarge { .. } => false,
        }
    }

    fn from_reqwest(err: reqwest::Error, limits: FetchLimits) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(limits.timeout)
        } else if let Some(status) = err.status() {
            FetchError::Status {
                status: status.as_u16(),
            }
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Retrieves the raw bytes of an uploaded import file.
#[rocket::async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, url: &str, limits: FetchLimits) -> Result<Vec<u8>, FetchError>;
}

/// [`FileFetcher`] over `reqwest`, reading the body chunk by chunk so the size
/// cap holds even when the server omits or lies about `Content-Length`.
#[derive(Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent("import-server/0.1")
            .build()
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        Ok(Self { http })
    }
}

#[rocket::async_trait]
impl FileFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, limits: FetchLimits) -> Result<Vec<u8>, FetchError> {
        let parsed = Url::parse(url).map_err(|err| FetchError::InvalidUrl(err.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        let mut response = self
            .http
            .get(parsed)
            .timeout(limits.timeout)
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(err, limits))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        if let Some(length) = response.content_length() {
            if length > limits.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: limits.max_bytes,
                });
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| FetchError::from_reqwest(err, limits))?
        {
            if body.len() as u64 + chunk.len() as u64 > limits.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: limits.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}
