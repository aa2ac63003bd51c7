//! Streamed HTTP downloads.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{MediaError, MediaResult};
use crate::fs_utils::temp_sibling;

/// Browser User-Agent; some CDNs refuse requests without one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Downloads a remote resource to a local file.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url` into `dest`. `dest` only ever appears complete.
    /// Returns the number of bytes written.
    async fn fetch_to_file(&self, url: &str, dest: &Path) -> MediaResult<u64>;
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl FetchConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            user_agent: std::env::var("FETCH_USER_AGENT").unwrap_or(defaults.user_agent),
            timeout: std::env::var("FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            connect_timeout: defaults.connect_timeout,
        }
    }
}

/// [`Fetcher`] over reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> MediaResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| MediaError::fetch_failed("", format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    async fn stream_to(&self, url: &str, tmp: &Path) -> MediaResult<u64> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| MediaError::fetch_failed(url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MediaError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = fs::File::create(tmp).await?;
        let mut written: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| MediaError::fetch_failed(url, e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        if written == 0 {
            return Err(MediaError::fetch_failed(url, "empty response body"));
        }
        Ok(written)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_to_file(&self, url: &str, dest: &Path) -> MediaResult<u64> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(MediaError::UnsupportedUrl(url.to_string()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = temp_sibling(dest);
        match self.stream_to(url, &tmp).await {
            Ok(bytes) => {
                if let Err(e) = fs::rename(&tmp, dest).await {
                    let _ = fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
                debug!(bytes, "Downloaded {} -> {}", url, dest.display());
                Ok(bytes)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }
}
