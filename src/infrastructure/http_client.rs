//! Rate limited HTTP client used by the HTML page extractor
//!
//! Every request waits on a shared quota first, and every await point is
//! raced against the caller's cancellation token.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use reqwest::{
    Client,
    header::{ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT},
};
use tokio_util::sync::CancellationToken;

use crate::crawling::extractor::ExtractError;
use crate::infrastructure::config::ExtractorConfig;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub max_requests_per_second: u32,
    pub follow_redirects: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self::from(&ExtractorConfig::default())
    }
}

impl From<&ExtractorConfig> for HttpClientConfig {
    fn from(config: &ExtractorConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
            max_requests_per_second: config.max_requests_per_second,
            follow_redirects: true,
        }
    }
}

pub struct HttpClient {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("Invalid user agent")?,
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("fa-IR,fa;q=0.9,en;q=0.8"));

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            })
            .build()
            .context("Failed to create HTTP client")?;

        let quota = Quota::per_second(
            NonZeroU32::new(config.max_requests_per_second).context("Rate limit must be greater than 0")?,
        );

        Ok(Self {
            client,
            rate_limiter: RateLimiter::direct(quota),
            config,
        })
    }

    /// Fetch `url` as text. Non-2xx answers become [`ExtractError::Http`].
    pub async fn get_text(&self, url: &str, cancel: &CancellationToken) -> Result<String, ExtractError> {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        tokio::select! {
            () = self.rate_limiter.until_ready() => {}
            () = cancel.cancelled() => return Err(ExtractError::Cancelled),
        }

        tracing::debug!("Fetching {}", url);

        let response = tokio::select! {
            result = self.client.get(url).send() => result.map_err(|e| request_error(url, &e))?,
            () = cancel.cancelled() => {
                tracing::warn!("HTTP request cancelled for {}", url);
                return Err(ExtractError::Cancelled);
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let text = tokio::select! {
            result = response.text() => result.map_err(|e| request_error(url, &e))?,
            () = cancel.cancelled() => return Err(ExtractError::Cancelled),
        };

        tracing::debug!("Fetched {} ({} bytes)", url, text.len());
        Ok(text)
    }

    #[must_use]
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}

// Request timeouts stay navigation failures; `Timeout` is reserved for the run scope.
fn request_error(url: &str, error: &reqwest::Error) -> ExtractError {
    if error.is_timeout() {
        ExtractError::navigation(url, "request timed out")
    } else {
        ExtractError::navigation(url, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_from_extractor_config() {
        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        assert_eq!(client.config().timeout, Duration::from_secs(30));
        assert!(client.config().user_agent.starts_with("listing-crawler/"));
    }

    #[tokio::test]
    async fn zero_rate_is_rejected() {
        let config = HttpClientConfig {
            max_requests_per_second: 0,
            ..Default::default()
        };
        assert!(HttpClient::new(config).is_err());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client.get_text("http://127.0.0.1:9/", &cancel).await;
        assert_eq!(result, Err(ExtractError::Cancelled));
    }
}
