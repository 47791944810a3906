//! Telemetry delivery

use crate::report::QueuedError;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use url::Url;
use wardstream_error::{Result, WardstreamError};
use wardstream_resilience::HttpRetryClassifier;

/// Header naming the payload shape
pub const TELEMETRY_TYPE_HEADER: &str = "X-Telemetry-Type";

/// Receives queued errors.
///
/// `Ok` means accepted. Failures use the error taxonomy:
/// [`WardstreamError::RateLimited`] backs the queue off, retryable errors
/// keep items queued, anything else drops them.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Sends a batch
    async fn send_batch(&self, items: &[QueuedError]) -> Result<()>;

    /// Sends one item outside the batch cycle
    async fn send_single(&self, item: &QueuedError) -> Result<()>;
}

#[derive(Serialize)]
struct BatchBody<'a> {
    errors: &'a [QueuedError],
}

/// POSTs JSON to a telemetry endpoint
#[derive(Debug, Clone)]
pub struct HttpTelemetrySink {
    client: Client,
    endpoint: Url,
}

impl HttpTelemetrySink {
    /// Sink for `endpoint` with a 10s request timeout
    pub fn new(endpoint: Url) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(format!("wardstream/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WardstreamError::Config(e.to_string()))?;
        Ok(Self::with_client(client, endpoint))
    }

    /// Reuses an existing client
    pub fn with_client(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    /// Target endpoint
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post<T: Serialize + ?Sized>(&self, kind: &str, body: &T) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(TELEMETRY_TYPE_HEADER, kind)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WardstreamError::Timeout { millis: 10_000 }
                } else {
                    WardstreamError::network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(HttpRetryClassifier::parse_retry_after);
        let body = response.text().await.unwrap_or_default();

        Err(match WardstreamError::from_status(status.as_u16(), body) {
            WardstreamError::RateLimited { .. } => WardstreamError::RateLimited {
                retry_after_secs: retry_after.map(|d| d.as_secs()),
            },
            other => other,
        })
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetrySink {
    async fn send_batch(&self, items: &[QueuedError]) -> Result<()> {
        tracing::debug!(count = items.len(), endpoint = %self.endpoint, "Sending error batch");
        self.post("error-batch", &BatchBody { errors: items }).await
    }

    async fn send_single(&self, item: &QueuedError) -> Result<()> {
        tracing::debug!(id = %item.id, "Sending error");
        self.post("error-single", item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ErrorReport;
    use wardstream_traits::{ConnectionType, EnvironmentSnapshot};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item() -> QueuedError {
        QueuedError::new(
            &ErrorReport::new("boom"),
            EnvironmentSnapshot {
                viewport: None,
                memory: None,
                online: true,
                connection_type: ConnectionType::Wifi,
                platform: "test".to_string(),
            },
            "session",
        )
    }

    async fn sink(server: &MockServer) -> HttpTelemetrySink {
        HttpTelemetrySink::new(Url::parse(&format!("{}/telemetry", server.uri())).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_batch_body_and_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/telemetry"))
            .and(header("x-telemetry-type", "error-batch"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let items = vec![item(), item()];
        sink(&server).await.send_batch(&items).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["errors"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_single_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-telemetry-type", "error-single"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        sink(&server).await.send_single(&item()).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "12"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let sink = sink(&server).await;
        assert_eq!(
            sink.send_single(&item()).await.unwrap_err(),
            WardstreamError::RateLimited {
                retry_after_secs: Some(12)
            }
        );
        let err = sink.send_single(&item()).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert!(!err.is_retryable());
    }
}
