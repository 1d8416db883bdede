//! HTTP client for a running nourish server, used by the `remote` subcommands.
//!
//! Hosted instances may sleep when idle, so every request is preceded by a
//! wake-up ping to `/health` and then sent under a [`RetryPolicy`].

use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::retry::{RetryPolicy, Retryable};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Request timed out")]
    Timeout,
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("HTTP error: status {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e)
        }
    }
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            Self::Decode(_) => false,
        }
    }
}

pub struct RemoteClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    policy: RetryPolicy,
}

impl RemoteClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("nourish-cli/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(HEALTH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            policy: RetryPolicy::default(),
        })
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// True when `GET /health` answers 2xx within five seconds.
    pub async fn is_online(&self) -> bool {
        match self
            .client
            .get(self.url("/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "health check failed");
                false
            }
        }
    }

    /// Fire-and-forget ping to start a sleeping instance. The outcome is ignored.
    async fn wake(&self) {
        let _ = self
            .client
            .get(self.url("/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
    }

    async fn send_once<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<serde_json::Value, RemoteError> {
        let mut req = self.client.request(method, self.url(path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
            return Err(RemoteError::HttpStatus {
                status: status.as_u16(),
                message,
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(serde_json::Value::Null);
        }
        resp.json().await.map_err(|e| RemoteError::Decode(e.to_string()))
    }

    /// Wake ping, then the request under the retry policy.
    pub async fn execute_with_retry<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.wake().await;
        let value = self
            .policy
            .run(path, || self.send_once(method.clone(), path, body))
            .await?;
        serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        self.execute_with_retry::<T, ()>(Method::GET, path, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;

    #[derive(Default)]
    struct Hits {
        health: AtomicU32,
        data: AtomicU32,
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        }
    }

    /// `/data` fails with 503 `failures` times, then answers.
    fn flaky_app(hits: Arc<Hits>, failures: u32) -> Router {
        Router::new()
            .route(
                "/health",
                get(|State(h): State<Arc<Hits>>| async move {
                    h.health.fetch_add(1, Ordering::SeqCst);
                    "ok"
                }),
            )
            .route(
                "/data",
                get(move |State(h): State<Arc<Hits>>, headers: HeaderMap| async move {
                    let n = h.data.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        return (
                            StatusCode::SERVICE_UNAVAILABLE,
                            axum::Json(serde_json::json!({"error": "waking up"})),
                        );
                    }
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    (
                        StatusCode::OK,
                        axum::Json(serde_json::json!({"value": 42, "auth": auth})),
                    )
                }),
            )
            .with_state(hits)
    }

    #[tokio::test]
    async fn test_is_online() {
        let hits = Arc::new(Hits::default());
        let url = spawn(flaky_app(hits.clone(), 0)).await;
        let client = RemoteClient::new(&url, None).unwrap();
        assert!(client.is_online().await);

        let offline = RemoteClient::new("http://127.0.0.1:1", None).unwrap();
        assert!(!offline.is_online().await);
    }

    #[tokio::test]
    async fn test_wake_ping_then_retry_until_success() {
        let hits = Arc::new(Hits::default());
        let url = spawn(flaky_app(hits.clone(), 2)).await;
        let client = RemoteClient::new(&url, Some("tok".to_string()))
            .unwrap()
            .with_policy(fast_policy());

        let body: serde_json::Value = client.get("/data").await.unwrap();
        assert_eq!(body["value"], 42);
        assert_eq!(body["auth"], "Bearer tok");
        assert_eq!(hits.health.load(Ordering::SeqCst), 1);
        assert_eq!(hits.data.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_two_retries() {
        let hits = Arc::new(Hits::default());
        let url = spawn(flaky_app(hits.clone(), 10)).await;
        let client = RemoteClient::new(&url, None)
            .unwrap()
            .with_policy(fast_policy());

        let err = client.get::<serde_json::Value>("/data").await.unwrap_err();
        match err {
            RemoteError::HttpStatus { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "waking up");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hits.data.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_not_retried() {
        let app = Router::new().route(
            "/missing",
            get(|| async {
                (
                    StatusCode::NOT_FOUND,
                    axum::Json(serde_json::json!({"error": "Not found"})),
                )
            }),
        );
        let url = spawn(app).await;
        let client = RemoteClient::new(&url, None)
            .unwrap()
            .with_policy(fast_policy());
        let err = client.get::<serde_json::Value>("/missing").await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_retry_classification() {
        let status = |s| RemoteError::HttpStatus {
            status: s,
            message: String::new(),
        };
        assert!(status(500).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(RemoteError::Timeout.is_retryable());
        assert!(!RemoteError::Decode("x".to_string()).is_retryable());
    }
}
