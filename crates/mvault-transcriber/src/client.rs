//! Whisper HTTP client.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::error::{TranscribeError, TranscribeResult};
use crate::types::{Transcriber, TranscriptionResult, MAX_UPLOAD_BYTES};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Configuration for the Whisper client.
#[derive(Debug, Clone)]
pub struct WhisperConfig {
    /// API key sent as a bearer token
    pub api_key: String,
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub model: String,
    /// Request timeout
    pub timeout: Duration,
    /// Client-side request budget
    pub requests_per_minute: u32,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "whisper-1".to_string(),
            timeout: Duration::from_secs(600),
            requests_per_minute: 50,
        }
    }
}

impl WhisperConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            model: std::env::var("WHISPER_MODEL").unwrap_or(defaults.model),
            timeout: Duration::from_secs(
                std::env::var("TRANSCRIBE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            requests_per_minute: std::env::var("TRANSCRIBE_REQUESTS_PER_MINUTE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.requests_per_minute),
        }
    }
}

/// Client for an OpenAI-compatible transcription endpoint.
pub struct WhisperClient {
    http: Client,
    config: WhisperConfig,
    limiter: Arc<DirectRateLimiter>,
}

impl WhisperClient {
    pub fn new(config: WhisperConfig) -> TranscribeResult<Self> {
        if config.api_key.is_empty() {
            return Err(TranscribeError::MissingConfig("OPENAI_API_KEY"));
        }

        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(TranscribeError::Network)?;

        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)));

        Ok(Self {
            http,
            config,
            limiter,
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> TranscribeResult<Self> {
        Self::new(WhisperConfig::from_env())
    }

    fn endpoint(&self) -> String {
        format!("{}/audio/transcriptions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Transcriber for WhisperClient {
    async fn transcribe(&self, audio: &Path) -> TranscribeResult<TranscriptionResult> {
        let size = tokio::fs::metadata(audio).await?.len();
        if size > MAX_UPLOAD_BYTES {
            return Err(TranscribeError::FileTooLarge {
                path: audio.to_path_buf(),
                size,
                limit: MAX_UPLOAD_BYTES,
            });
        }

        let bytes = tokio::fs::read(audio).await?;
        let file_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.mp3".to_string());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/mpeg")?;
        let form = Form::new()
            .part("file", part)
            .text("model", self.config.model.clone());

        self.limiter.until_ready().await;

        debug!(bytes = size, "Sending transcription request for {}", audio.display());
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("Transcription service rate limited the request");
            return Err(TranscribeError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TranscribeError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let raw: serde_json::Value = response.json().await?;
        let text = raw
            .get("text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| TranscribeError::InvalidResponse("missing `text` field".to_string()))?
            .to_string();

        Ok(TranscriptionResult { text, raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: String) -> WhisperClient {
        WhisperClient::new(WhisperConfig {
            api_key: "sk-test".to_string(),
            base_url,
            ..WhisperConfig::default()
        })
        .unwrap()
    }

    fn audio_file(dir: &TempDir, len: usize) -> std::path::PathBuf {
        let path = dir.path().join("audio.mp3");
        std::fs::write(&path, vec![1u8; len]).unwrap();
        path
    }

    #[test]
    fn test_config_defaults() {
        let config = WhisperConfig::default();
        assert_eq!(config.model, "whisper-1");
        assert_eq!(config.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn test_missing_api_key_rejected() {
        assert!(matches!(
            WhisperClient::new(WhisperConfig::default()),
            Err(TranscribeError::MissingConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_transcribe_returns_text_and_raw() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/transcriptions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"text": "hello there"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let result = client(format!("{}/v1", server.uri()))
            .transcribe(&audio_file(&dir, 1024))
            .await
            .unwrap();

        assert_eq!(result.text, "hello there");
        assert_eq!(result.raw["text"], "hello there");
    }

    #[tokio::test]
    async fn test_oversized_input_never_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.mp3");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(MAX_UPLOAD_BYTES + 1).unwrap();

        let err = client(server.uri()).transcribe(&path).await.unwrap_err();
        assert!(matches!(err, TranscribeError::FileTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_rate_limited_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let err = client(server.uri())
            .transcribe(&audio_file(&dir, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscribeError::RateLimited));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_error_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad audio"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let err = client(server.uri())
            .transcribe(&audio_file(&dir, 10))
            .await
            .unwrap_err();
        match err {
            TranscribeError::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "bad audio");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
