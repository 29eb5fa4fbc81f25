//! HTTP client with retry and backoff

use crate::error::{AffinityError, Result};
use reqwest::header::{HeaderValue, RANGE, REFERER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// Network client configuration
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Retries after the first attempt
    pub retry_count: u32,
    /// First backoff delay, doubled on every further retry
    pub backoff_base: Duration,
    pub user_agent: String,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60 * 60),
            connect_timeout: Duration::from_secs(30),
            retry_count: 5,
            backoff_base: Duration::from_millis(1200),
            user_agent: format!("affinity-cli/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// HTTP client shared by every network-facing component
///
/// Proxy (`HTTP(S)_PROXY`, `NO_PROXY`) and system certificate settings are picked up by
/// reqwest itself. Cookies persist for the lifetime of the client so a login carries
/// over to later requests.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    config: NetConfig,
}

impl HttpClient {
    pub fn new(config: NetConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .cookie_store(true)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(NetConfig::default())
    }

    /// GET, optionally resuming from byte `range_from`
    pub async fn get(&self, url: &str, range_from: Option<u64>) -> Result<Response> {
        self.send_with_retry(url, || {
            let request = self.client.get(url);
            match range_from {
                Some(offset) if offset > 0 => request.header(RANGE, format!("bytes={}-", offset)),
                _ => request,
            }
        })
        .await
    }

    /// GET returning the final URL after redirects and the body text
    pub async fn get_text(&self, url: &str) -> Result<(String, String)> {
        let response = self.get(url, None).await?.error_for_status()?;
        let final_url = response.url().to_string();
        let body = response.text().await?;
        Ok((final_url, body))
    }

    pub async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<Response> {
        self.send_with_retry(url, || self.client.post(url).json(body))
            .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
        referer: Option<&str>,
    ) -> Result<Response> {
        self.send_with_retry(url, || {
            let request = self.client.post(url).form(form);
            match referer.and_then(|r| HeaderValue::from_str(r).ok()) {
                Some(value) => request.header(REFERER, value),
                None => request,
            }
        })
        .await
    }

    /// Send, retrying on 429/5xx responses and on transient transport failures
    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0u32;

        loop {
            let outcome = build().send().await;
            let retries_left = attempt < self.config.retry_count;

            match outcome {
                Ok(response) if is_retryable_status(response.status()) => {
                    let status = response.status();
                    if !retries_left {
                        return Err(AffinityError::Transport(format!(
                            "{} returned {} after {} attempts",
                            url,
                            status,
                            attempt + 1
                        )));
                    }
                    warn!("{} returned {}, retrying", url, status);
                }
                Ok(response) => return Ok(response),
                Err(e) if is_retryable_error(&e) => {
                    if !retries_left {
                        return Err(AffinityError::Transport(format!(
                            "{} failed after {} attempts: {}",
                            url,
                            attempt + 1,
                            e
                        )));
                    }
                    warn!("Request to {} failed ({}), retrying", url, e);
                }
                Err(e) => return Err(e.into()),
            }

            let delay = self.config.backoff_base * 2u32.saturating_pow(attempt);
            debug!("Backing off {:?} before attempt {}", delay, attempt + 2);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || matches!(status.as_u16(), 500 | 502 | 503 | 504)
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[cfg(test)]
pub(crate) fn test_client() -> HttpClient {
    HttpClient::new(NetConfig {
        timeout: Duration::from_secs(10),
        connect_timeout: Duration::from_secs(5),
        retry_count: 2,
        backoff_base: Duration::from_millis(10),
        user_agent: "affinity-cli-tests".to_string(),
    })
    .unwrap()
}
