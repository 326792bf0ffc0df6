//! Content-generation provider abstraction.
//!
//! The scheduler only needs `generate(request) -> artifact | error`. The
//! [`HttpProvider`] speaks a small JSON protocol; [`MockProvider`] scripts
//! responses for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::request::{AssetKind, GenerationRequest};

/// What the provider produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactContent {
    /// Location to download the artifact from
    Url(String),
    /// Inline artifact bytes
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedArtifact {
    pub content: ArtifactContent,
    /// Charge reported by the provider, when it reports one
    pub cost: Option<Decimal>,
}

impl GeneratedArtifact {
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            content: ArtifactContent::Bytes(bytes.into()),
            cost: None,
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            content: ArtifactContent::Url(url.into()),
            cost: None,
        }
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// A failed provider call. Classification into retry categories happens in
/// [`crate::retry`], from the status and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(format!("request timed out after {after:?}"))
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Generate one artifact. Implementations should respect `timeout`; the
    /// scheduler also enforces it from the outside.
    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<GeneratedArtifact, ProviderError>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

#[derive(Serialize)]
struct GenerateBody<'a> {
    prompt: &'a str,
    asset_kind: AssetKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    parameters: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    url: Option<String>,
    b64: Option<String>,
    cost: Option<Decimal>,
}

/// Provider that POSTs JSON to a single generation endpoint.
///
/// Request: `{"prompt", "asset_kind", "model", "parameters"}` with a bearer token.
/// Response: `{"url": ...}` or `{"b64": ...}`, optionally with `"cost"`.
#[derive(Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpProvider {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    #[tracing::instrument(skip(self, request), fields(model = ?request.model, kind = %request.asset_kind))]
    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<GeneratedArtifact, ProviderError> {
        let body = GenerateBody {
            prompt: &request.prompt,
            asset_kind: request.asset_kind,
            model: request.model.as_deref(),
            parameters: &request.parameters,
        };

        let mut req = self.client.post(&self.url).timeout(timeout).json(&body);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::timeout(timeout)
            } else if e.is_connect() {
                ProviderError::new(format!("provider unavailable: connection failed: {e}"))
            } else {
                ProviderError::new(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), body = %text, "Provider returned error");
            return Err(ProviderError::with_status(status.as_u16(), text));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::new(format!("malformed provider response: {e}")))?;

        let content = match (parsed.url, parsed.b64) {
            (Some(url), _) => ArtifactContent::Url(url),
            (None, Some(b64)) => ArtifactContent::Bytes(
                base64::engine::general_purpose::STANDARD
                    .decode(b64.as_bytes())
                    .map_err(|e| ProviderError::new(format!("malformed provider response: {e}")))?,
            ),
            (None, None) => {
                return Err(ProviderError::new(
                    "malformed provider response: neither url nor b64 present",
                ))
            }
        };

        Ok(GeneratedArtifact {
            content,
            cost: parsed.cost,
        })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

pub type MockResponse = Result<GeneratedArtifact, ProviderError>;

/// Record of a call made to the mock provider.
#[derive(Debug, Clone)]
pub struct MockProviderCall {
    pub prompt: String,
    pub model: Option<String>,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub timeout: Duration,
}

/// Mock provider for testing.
///
/// Responses are scripted per prompt and returned in FIFO order. A prompt with
/// no scripted response left succeeds with a small inline artifact.
///
/// # Example
/// ```ignore
/// let mock = MockProvider::new();
/// mock.add_response("a red fox", Err(ProviderError::with_status(503, "overloaded")));
/// mock.add_response("a red fox", Ok(GeneratedArtifact::bytes(b"png".to_vec())));
/// ```
#[derive(Clone, Default)]
pub struct MockProvider {
    responses: Arc<Mutex<HashMap<String, VecDeque<MockResponse>>>>,
    panics: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<MockProviderCall>>>,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn add_response(&self, prompt: &str, response: MockResponse) {
        self.responses
            .lock()
            .entry(prompt.to_string())
            .or_default()
            .push_back(response);
    }

    /// Make every call for `prompt` panic mid-flight, as a bug in a provider
    /// implementation would.
    pub fn panic_on(&self, prompt: &str) {
        self.panics.lock().insert(prompt.to_string());
    }

    pub fn get_calls(&self) -> Vec<MockProviderCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls made for one prompt.
    pub fn calls_for(&self, prompt: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.prompt == prompt).count()
    }

    /// Highest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<GeneratedArtifact, ProviderError> {
        self.calls.lock().push(MockProviderCall {
            prompt: request.prompt.clone(),
            model: request.model.clone(),
            parameters: request.parameters.clone(),
            timeout,
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = scopeguard::guard(self.in_flight.clone(), |counter| {
            counter.fetch_sub(1, Ordering::SeqCst);
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.panics.lock().contains(&request.prompt) {
            panic!("mock provider panicked for {:?}", request.prompt);
        }

        let scripted = self
            .responses
            .lock()
            .get_mut(&request.prompt)
            .and_then(|queue| queue.pop_front());

        scripted.unwrap_or_else(|| Ok(GeneratedArtifact::bytes(request.prompt.as_bytes().to_vec())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_mock_provider_fifo_then_default() {
        let mock = MockProvider::new();
        mock.add_response("fox", Err(ProviderError::with_status(503, "overloaded")));

        let request = GenerationRequest::new("fox", AssetKind::Image);
        let first = mock.generate(&request, Duration::from_secs(1)).await;
        assert_eq!(first.unwrap_err().status, Some(503));

        let second = mock.generate(&request, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.content, ArtifactContent::Bytes(b"fox".to_vec()));
        assert_eq!(mock.calls_for("fox"), 2);
    }

    #[test]
    fn test_provider_error_display() {
        assert_eq!(
            ProviderError::with_status(429, "slow down").to_string(),
            "HTTP 429: slow down"
        );
        assert_eq!(ProviderError::new("boom").to_string(), "boom");
    }

    #[tokio::test]
    async fn test_http_provider_url_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": "https://cdn.example.com/a.png",
                "cost": "0.15"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(format!("{}/generate", server.uri()), Some("sk-test".into()));
        let artifact = provider
            .generate(
                &GenerationRequest::new("a lighthouse", AssetKind::Image).with_model("flux"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(
            artifact.content,
            ArtifactContent::Url("https://cdn.example.com/a.png".to_string())
        );
        assert_eq!(artifact.cost, Some(Decimal::new(15, 2)));
    }

    #[tokio::test]
    async fn test_http_provider_b64_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "b64": base64::engine::general_purpose::STANDARD.encode(b"PNGDATA")
            })))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(server.uri(), None);
        let artifact = provider
            .generate(&GenerationRequest::new("x", AssetKind::Icon), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(artifact.content, ArtifactContent::Bytes(b"PNGDATA".to_vec()));
        assert_eq!(artifact.cost, None);
    }

    #[tokio::test]
    async fn test_http_provider_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limit exceeded"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(server.uri(), None);
        let err = provider
            .generate(&GenerationRequest::new("x", AssetKind::Icon), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(429));
        assert_eq!(err.message, "rate limit exceeded");
    }

    #[tokio::test]
    async fn test_http_provider_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(serde_json::json!({"url": "https://x"})),
            )
            .mount(&server)
            .await;

        let provider = HttpProvider::new(server.uri(), None);
        let err = provider
            .generate(&GenerationRequest::new("x", AssetKind::Icon), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.message.contains("timed out"));
    }
}
