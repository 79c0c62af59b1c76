//! Thin REST client with latency measurement.
//!
//! Every call returns an explicit tagged result: either the decoded payload
//! with the elapsed round-trip, or a structured [`TransportError`]. Venue
//! response shapes are never detected by failure-to-parse.

use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum TransportError {
    /// The venue answered with a non-success status.
    #[error("venue returned http {status}: {body}")]
    Status { status: u16, body: String },
    /// The request never completed or the body was not valid JSON.
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// The venue adapter does not implement this call.
    #[error("{call} is not supported by this venue")]
    Unsupported { call: &'static str },
}

impl TransportError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, TransportError::Status { status: 429, .. })
    }
}

#[derive(Debug, Clone)]
pub struct RestReply {
    pub value: Value,
    /// Round-trip time in seconds.
    pub elapsed: f64,
}

pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.is_empty() {
            self.base_url.clone()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        }
    }

    pub async fn query(
        &self,
        method: reqwest::Method,
        path: &str,
        params: Option<&[(String, String)]>,
        body: Option<&Value>,
        headers: Option<reqwest::header::HeaderMap>,
    ) -> Result<RestReply, TransportError> {
        let url = self.resolve(path);
        let mut request = self.client.request(method, &url);
        if let Some(params) = params {
            request = request.query(params);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(headers) = headers {
            request = request.headers(headers);
        }

        let started = Instant::now();
        let response = request.send().await?;
        let elapsed = started.elapsed().as_secs_f64();

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let value = response.json().await?;
        Ok(RestReply { value, elapsed })
    }

    pub async fn get(&self, path: &str) -> Result<RestReply, TransportError> {
        self.query(reqwest::Method::GET, path, None, None, None)
            .await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<RestReply, TransportError> {
        self.query(reqwest::Method::POST, path, None, Some(body), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_and_absolute_paths() {
        let client = RestClient::new("https://venue.test/api/");
        assert_eq!(client.resolve("/v1/ticker"), "https://venue.test/api/v1/ticker");
        assert_eq!(client.resolve(""), "https://venue.test/api/");
        assert_eq!(
            client.resolve("https://other.test/x"),
            "https://other.test/x"
        );
    }

    #[test]
    fn rate_limit_detection() {
        let err = TransportError::Status {
            status: 429,
            body: String::new(),
        };
        assert!(err.is_rate_limit());
        let err = TransportError::Status {
            status: 500,
            body: String::new(),
        };
        assert!(!err.is_rate_limit());
    }
}
