//! HTTP client abstraction for external API communication.
//!
//! This module provides a trait-based abstraction over HTTP clients, enabling
//! dependency injection and easy mocking in tests. Transport failures are
//! classified so providers can tell a dead service from a slow one.

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

/// Status code and body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure to complete an HTTP exchange at all.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// Trait for HTTP communication with external APIs.
///
/// This abstraction allows injecting mock HTTP clients for testing without
/// making real network requests.
///
/// # Example
///
/// ```ignore
/// use aishell::http_client::{HttpClient, ReqwestHttpClient};
///
/// let client = ReqwestHttpClient::new();
/// let response = client.post_json(
///     "https://api.example.com/endpoint",
///     &[("Content-Type", "application/json")],
///     &serde_json::json!({"key": "value"}),
/// ).await?;
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with JSON body and returns status and body text.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if no response was received. Non-2xx
    /// statuses are not errors at this layer.
    async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<HttpResponse, TransportError>;

    /// Sends a GET request and returns status and body text.
    async fn get(&self, url: &str, headers: &[(&str, &str)])
    -> Result<HttpResponse, TransportError>;
}

/// HTTP client implementation using reqwest.
///
/// One instance is shared for the daemon's lifetime so pooled connections
/// stay warm between hotkey presses.
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    /// Creates a new HTTP client with default configuration.
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<HttpResponse, TransportError> {
        let mut request = self.client.post(url);

        for (key, value) in headers {
            request = request.header(*key, *value);
        }

        let response = request.json(body).send().await?;
        let status = response.status().as_u16();
        Ok(HttpResponse::new(status, response.text().await?))
    }

    async fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, TransportError> {
        let mut request = self.client.get(url);

        for (key, value) in headers {
            request = request.header(*key, *value);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        Ok(HttpResponse::new(status, response.text().await?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Recorded outgoing request.
    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub method: &'static str,
        pub url: String,
        pub headers: Vec<(String, String)>,
        pub body: Option<serde_json::Value>,
    }

    /// Mock HTTP client for testing.
    ///
    /// Replays a scripted response (or transport failure) and records every
    /// request it receives.
    pub struct MockHttpClient {
        reply: Mutex<Option<Result<HttpResponse, TransportError>>>,
        delay: Option<Duration>,
        pub requests: Mutex<Vec<RecordedRequest>>,
    }

    impl MockHttpClient {
        /// Creates a mock client that always answers with `status` and `body`.
        pub fn new(status: u16, body: &str) -> Self {
            Self {
                reply: Mutex::new(Some(Ok(HttpResponse::new(status, body)))),
                delay: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Creates a mock client that fails every request at the transport layer.
        pub fn failing(error: TransportError) -> Self {
            Self {
                reply: Mutex::new(Some(Err(error))),
                delay: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Delays every answer, for exercising deadlines.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn last_request(&self) -> Option<RecordedRequest> {
            self.requests.lock().unwrap().last().cloned()
        }

        async fn answer(&self) -> Result<HttpResponse, TransportError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.reply.lock().unwrap().as_ref() {
                Some(Ok(response)) => Ok(response.clone()),
                Some(Err(TransportError::Timeout)) => Err(TransportError::Timeout),
                Some(Err(TransportError::Connect(msg))) => {
                    Err(TransportError::Connect(msg.clone()))
                }
                Some(Err(TransportError::Other(msg))) => Err(TransportError::Other(msg.clone())),
                None => Err(TransportError::Other("no scripted reply".to_string())),
            }
        }

        fn record(
            &self,
            method: &'static str,
            url: &str,
            headers: &[(&str, &str)],
            body: Option<&serde_json::Value>,
        ) {
            self.requests.lock().unwrap().push(RecordedRequest {
                method,
                url: url.to_string(),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                body: body.cloned(),
            });
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn post_json(
            &self,
            url: &str,
            headers: &[(&str, &str)],
            body: &serde_json::Value,
        ) -> Result<HttpResponse, TransportError> {
            self.record("POST", url, headers, Some(body));
            self.answer().await
        }

        async fn get(
            &self,
            url: &str,
            headers: &[(&str, &str)],
        ) -> Result<HttpResponse, TransportError> {
            self.record("GET", url, headers, None);
            self.answer().await
        }
    }

    #[tokio::test]
    async fn test_mock_http_client_returns_response() {
        let client = MockHttpClient::new(200, "test response");
        let response = client
            .post_json("http://localhost/x", &[], &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(response, HttpResponse::new(200, "test response"));
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_http_client_records_headers() {
        let client = MockHttpClient::new(204, "");
        client
            .get("http://localhost/models", &[("Authorization", "Bearer k")])
            .await
            .unwrap();

        let request = client.last_request().unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.headers[0], ("Authorization".to_string(), "Bearer k".to_string()));
        assert!(request.body.is_none());
    }

    #[test]
    fn test_http_response_success_range() {
        assert!(HttpResponse::new(200, "").is_success());
        assert!(HttpResponse::new(299, "").is_success());
        assert!(!HttpResponse::new(301, "").is_success());
        assert!(!HttpResponse::new(429, "").is_success());
    }
}
