//! Firestore REST API client.
//!
//! - Token caching with refresh margin
//! - One re-authentication on `ACCESS_TOKEN_EXPIRED`
//! - Exponential backoff with jitter for network, 429 and 5xx failures
//! - Tracing spans and request metrics

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, info_span, Instrument};

use crate::error::{StoreError, StoreResult};
use crate::firestore::metrics::record_request;
use crate::firestore::retry::{with_retry, RetryConfig};
use crate::firestore::token_cache::{TokenCache, TokenSource};
use crate::firestore::types::{Document, RunQueryRequest, RunQueryResponse, StructuredQuery, Value};

/// Firestore client configuration.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    /// GCP project ID
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
    /// `host:port` of a Firestore emulator; disables service account auth.
    pub emulator_host: Option<String>,
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: "(default)".to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            emulator_host: None,
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> StoreResult<Self> {
        let project_id = std::env::var("GCP_PROJECT_ID")
            .or_else(|_| std::env::var("FIREBASE_PROJECT_ID"))
            .map_err(|_| {
                StoreError::Config(
                    "GCP_PROJECT_ID or FIREBASE_PROJECT_ID must be set to access Firestore".to_string(),
                )
            })?;

        if project_id.is_empty() {
            return Err(StoreError::Config(
                "GCP_PROJECT_ID or FIREBASE_PROJECT_ID cannot be empty".to_string(),
            ));
        }

        let connect_timeout_secs: u64 = std::env::var("FIRESTORE_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            project_id,
            database_id: std::env::var("FIRESTORE_DATABASE_ID")
                .unwrap_or_else(|_| "(default)".to_string()),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            retry: RetryConfig::from_env(),
            emulator_host: std::env::var("FIRESTORE_EMULATOR_HOST")
                .ok()
                .filter(|h| !h.is_empty()),
        })
    }

    fn documents_path(&self) -> String {
        format!(
            "v1/projects/{}/databases/{}/documents",
            self.project_id, self.database_id
        )
    }
}

/// Firestore REST API client.
#[derive(Clone)]
pub struct FirestoreClient {
    http: Client,
    config: FirestoreConfig,
    base_url: String,
    token_cache: Arc<TokenCache>,
}

impl FirestoreClient {
    /// Create a client for Google Cloud, or for the emulator when configured.
    pub async fn new(config: FirestoreConfig) -> StoreResult<Self> {
        let (base_url, source) = match &config.emulator_host {
            Some(host) => (
                format!("http://{}/{}", host, config.documents_path()),
                TokenSource::Static("owner".to_string()),
            ),
            None => (
                format!("https://firestore.googleapis.com/{}", config.documents_path()),
                TokenSource::Provider(Self::create_auth_provider()?),
            ),
        };
        Self::with_endpoint(config, base_url, source)
    }

    /// Create a client against an explicit documents root URL.
    pub fn with_endpoint(
        config: FirestoreConfig,
        base_url: impl Into<String>,
        source: TokenSource,
    ) -> StoreResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("mvault-store/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(StoreError::Network)?;

        Ok(Self {
            http,
            config,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token_cache: Arc::new(TokenCache::new(source)),
        })
    }

    fn create_auth_provider() -> StoreResult<Arc<dyn TokenProvider>> {
        let service_account = CustomServiceAccount::from_env()
            .map_err(|e| StoreError::auth_error(format!("Failed to load service account: {}", e)))?;

        match service_account {
            Some(sa) => Ok(Arc::new(sa)),
            None => Err(StoreError::auth_error(
                "GOOGLE_APPLICATION_CREDENTIALS not set. \
                 Set it to the path of your service account JSON file.",
            )),
        }
    }

    /// Create from environment variables.
    pub async fn from_env() -> StoreResult<Self> {
        Self::new(FirestoreConfig::from_env()?).await
    }

    fn is_access_token_expired(body: &str) -> bool {
        body.contains("ACCESS_TOKEN_EXPIRED") || body.contains("\"UNAUTHENTICATED\"")
    }

    fn document_url(&self, collection: &str, doc_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, urlencoding::encode(doc_id))
    }

    // =========================================================================
    // Document operations
    // =========================================================================

    /// Get a document; `None` if it does not exist.
    pub async fn get_document(&self, collection: &str, doc_id: &str) -> StoreResult<Option<Document>> {
        let url = self.document_url(collection, doc_id);
        let response = self
            .send("get_document", collection, Some(doc_id), |http| http.get(&url))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            _ => Ok(Some(response.json().await?)),
        }
    }

    /// Create a document with a caller-chosen id.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the id is taken.
    pub async fn create_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
    ) -> StoreResult<Document> {
        let url = format!(
            "{}/{}?documentId={}",
            self.base_url,
            collection,
            urlencoding::encode(doc_id)
        );
        let body = Document::new(fields);

        let response = self
            .send("create_document", collection, Some(doc_id), |http| {
                http.post(&url).json(&body)
            })
            .await?;

        match response.status() {
            StatusCode::CONFLICT => Err(StoreError::AlreadyExists(format!("{}/{}", collection, doc_id))),
            StatusCode::NOT_FOUND => Err(StoreError::not_found(format!("{}/{}", collection, doc_id))),
            _ => Ok(response.json().await?),
        }
    }

    /// Merge `fields` into a document, creating it if missing.
    pub async fn update_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
        update_mask: &[&str],
    ) -> StoreResult<Document> {
        self.update_document_with_precondition(collection, doc_id, fields, update_mask, None)
            .await
    }

    /// Update guarded by the document's last `updateTime`.
    ///
    /// A concurrent writer makes this fail with an error for which
    /// [`StoreError::is_precondition_failed`] is true.
    pub async fn update_document_with_precondition(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
        update_mask: &[&str],
        update_time: Option<&str>,
    ) -> StoreResult<Document> {
        let mut params: Vec<String> = update_mask
            .iter()
            .map(|f| format!("updateMask.fieldPaths={}", urlencoding::encode(f)))
            .collect();
        if let Some(ts) = update_time {
            params.push(format!("currentDocument.updateTime={}", urlencoding::encode(ts)));
        }

        let mut url = self.document_url(collection, doc_id);
        if !params.is_empty() {
            url = format!("{}?{}", url, params.join("&"));
        }
        let body = Document::new(fields);

        let response = self
            .send("update_document", collection, Some(doc_id), |http| {
                http.patch(&url).json(&body)
            })
            .await?;

        match response.status() {
            StatusCode::CONFLICT => Err(StoreError::PreconditionFailed(format!(
                "{}/{} changed concurrently",
                collection, doc_id
            ))),
            StatusCode::NOT_FOUND => Err(StoreError::not_found(format!("{}/{}", collection, doc_id))),
            _ => Ok(response.json().await?),
        }
    }

    /// Run a structured query against the root collections.
    pub async fn run_query(&self, query: StructuredQuery) -> StoreResult<Vec<Document>> {
        let url = format!("{}:runQuery", self.base_url);
        let collection = query
            .from
            .first()
            .map(|c| c.collection_id.clone())
            .unwrap_or_default();
        let request = RunQueryRequest {
            structured_query: query,
        };

        let response = self
            .send("run_query", &collection, None, |http| http.post(&url).json(&request))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        // runQuery returns a JSON array of RunQueryResponse objects
        let body = response.text().await?;
        let responses: Vec<RunQueryResponse> = serde_json::from_str(&body).map_err(|e| {
            StoreError::invalid_response(format!(
                "Failed to parse runQuery response: {} (body prefix: {})",
                e,
                body.chars().take(200).collect::<String>()
            ))
        })?;

        Ok(responses.into_iter().filter_map(|r| r.document).collect())
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    /// Send a request with auth, retry, tracing and metrics.
    ///
    /// Success, 404 and 409 responses are returned for the caller to
    /// interpret; every other status becomes an error.
    async fn send<F>(
        &self,
        operation: &str,
        collection: &str,
        doc_id: Option<&str>,
        build: F,
    ) -> StoreResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let span = match doc_id {
            Some(id) => info_span!("firestore_request", operation = %operation, collection = %collection, doc_id = %id),
            None => info_span!("firestore_request", operation = %operation, collection = %collection),
        };

        let build = &build;
        let start = Instant::now();
        let result = with_retry(&self.config.retry, operation, || self.send_once(build))
            .instrument(span)
            .await;
        let latency_ms = start.elapsed().as_millis() as f64;

        let status = match &result {
            Ok(response) => response.status().as_u16(),
            Err(e) => e.http_status().unwrap_or(500),
        };
        record_request(operation, status, latency_ms);

        result
    }

    async fn send_once<F>(&self, build: &F) -> StoreResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.token_cache.get_token().await?;
        let mut response = build(&self.http).bearer_auth(&token).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            if !Self::is_access_token_expired(&body) {
                return Err(StoreError::from_http_status(401, body));
            }
            debug!("Access token expired, refreshing");
            self.token_cache.invalidate().await;
            let token = self.token_cache.get_token().await?;
            response = build(&self.http).bearer_auth(&token).send().await?;
        }

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(StoreError::RateLimited(retry_after_ms));
        }

        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::from_http_status(
            status.as_u16(),
            format!("{} failed: {}", url, body),
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use serial_test::serial;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::firestore::types::ToFirestoreValue;

    fn test_config() -> FirestoreConfig {
        FirestoreConfig {
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            ..FirestoreConfig::new("test-project")
        }
    }

    fn client(server: &MockServer) -> FirestoreClient {
        FirestoreClient::with_endpoint(
            test_config(),
            format!("{}/documents", server.uri()),
            TokenSource::Static("test-token".to_string()),
        )
        .unwrap()
    }

    fn doc_json(collection: &str, id: &str) -> serde_json::Value {
        json!({
            "name": format!("projects/test-project/databases/(default)/documents/{}/{}", collection, id),
            "fields": {"username": {"stringValue": "alice"}},
            "updateTime": "2026-01-01T00:00:00Z"
        })
    }

    #[test]
    #[serial]
    fn test_config_from_env_validates_project_id() {
        std::env::remove_var("GCP_PROJECT_ID");
        std::env::remove_var("FIREBASE_PROJECT_ID");
        assert!(matches!(FirestoreConfig::from_env(), Err(StoreError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_config_from_env_reads_emulator_host() {
        std::env::set_var("GCP_PROJECT_ID", "test-project");
        std::env::set_var("FIRESTORE_EMULATOR_HOST", "localhost:8080");
        let config = FirestoreConfig::from_env().unwrap();
        assert_eq!(config.emulator_host.as_deref(), Some("localhost:8080"));
        assert_eq!(config.database_id, "(default)");
        std::env::remove_var("FIRESTORE_EMULATOR_HOST");
        std::env::remove_var("GCP_PROJECT_ID");
    }

    #[tokio::test]
    async fn test_get_missing_document_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/accounts/bob"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        assert!(client(&server).get_document("accounts", "bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_conflict_is_already_exists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/documents/transcripts"))
            .and(query_param("documentId", "media_m1"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .create_document("transcripts", "media_m1", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(doc_json("accounts", "alice")))
            .expect(1)
            .mount(&server)
            .await;

        let doc = client(&server).get_document("accounts", "alice").await.unwrap().unwrap();
        assert_eq!(doc.id(), Some("alice"));
    }

    #[tokio::test]
    async fn test_expired_token_resends_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string(r#"{"error":{"status":"UNAUTHENTICATED","message":"ACCESS_TOKEN_EXPIRED"}}"#),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(doc_json("accounts", "alice")))
            .expect(1)
            .mount(&server)
            .await;

        assert!(client(&server).get_document("accounts", "alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_sends_mask_and_precondition() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/documents/media/m1"))
            .and(query_param("updateMask.fieldPaths", "storageUrl"))
            .and(query_param("currentDocument.updateTime", "2026-01-01T00:00:00Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(doc_json("media", "m1")))
            .expect(1)
            .mount(&server)
            .await;

        let mut fields = HashMap::new();
        fields.insert("storageUrl".to_string(), "/content/a.mp4".to_firestore_value());
        client(&server)
            .update_document_with_precondition(
                "media",
                "m1",
                fields,
                &["storageUrl"],
                Some("2026-01-01T00:00:00Z"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_query_collects_documents() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/documents:runQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"document": doc_json("posts", "p1"), "readTime": "2026-01-01T00:00:00Z"},
                {"document": doc_json("posts", "p2"), "readTime": "2026-01-01T00:00:00Z"},
                {"readTime": "2026-01-01T00:00:00Z"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let docs = client(&server)
            .run_query(StructuredQuery::collection("posts"))
            .await
            .unwrap();
        let ids: Vec<_> = docs.iter().filter_map(|d| d.id()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
    }
}
