//! HTTP client behind the `http_get` and `http_post` script functions.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};

use crate::config::HttpConfig;
use crate::{BotError, Result};

/// Connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// Per-request options passed by scripts.
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    /// Overrides the client's default timeout.
    pub timeout: Option<Duration>,
    pub headers: Vec<(String, String)>,
}

/// A completed response. Non-2xx statuses are still responses.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    /// Lower-case header names. The first value wins for repeated headers.
    pub headers: BTreeMap<String, String>,
}

/// Shared HTTP client.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    default_timeout: Duration,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let default_timeout = Duration::from_secs(config.default_timeout_secs);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| BotError::Http(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            default_timeout,
        })
    }

    pub async fn get(&self, url: &str, options: &HttpOptions) -> Result<HttpResponse> {
        self.execute(self.client.get(url), options).await
    }

    pub async fn post(&self, url: &str, body: String, options: &HttpOptions) -> Result<HttpResponse> {
        self.execute(self.client.post(url).body(body), options).await
    }

    async fn execute(&self, request: RequestBuilder, options: &HttpOptions) -> Result<HttpResponse> {
        let mut request = request.timeout(options.timeout.unwrap_or(self.default_timeout));
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| BotError::Http(format!("request failed: {}", e)))?;

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_insert_with(|| value.to_string());
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| BotError::Http(format!("failed to read response body: {}", e)))?;

        Ok(HttpResponse {
            status,
            body,
            headers,
        })
    }
}
