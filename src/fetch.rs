use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, info};

use crate::error::FetchError;

/// Markup for one page, as returned by a [`Fetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMarkup {
    pub url: String,
    pub body: String,
}

impl RawMarkup {
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: body.into(),
        }
    }
}

/// Source of page markup. `render` asks for JavaScript-rendered output.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, render: bool) -> Result<RawMarkup, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub user_agent: String,
}

/// Plain HTTP fetches via reqwest; rendered fetches via spider.cloud.
pub struct PageFetcher {
    client: reqwest::Client,
    spider: Option<Spider>,
}

impl PageFetcher {
    /// Build the fetcher. A rendering client is only set up when `render`
    /// is wanted, and then `SPIDER_API_KEY` must be present.
    pub fn new(settings: &FetchSettings, render: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;

        let spider = if render {
            let api_key = std::env::var("SPIDER_API_KEY")
                .context("SPIDER_API_KEY must be set for rendered fetches (or pass --no-render)")?;
            let spider = Spider::new(Some(api_key))
                .map_err(|e| anyhow::anyhow!("Failed to create Spider client: {}", e))?;
            Some(spider)
        } else {
            None
        };

        Ok(Self { client, spider })
    }

    async fn fetch_plain(&self, url: &str) -> Result<RawMarkup, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| classify(url, &e))?;
        let status = response.status();
        if is_blocking_status(status.as_u16()) {
            return Err(FetchError::Blocked {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Network {
                url: url.to_string(),
                reason: format!("HTTP {}", status),
            });
        }
        let body = response.text().await.map_err(|e| classify(url, &e))?;
        Ok(RawMarkup::new(url, body))
    }

    async fn fetch_rendered(&self, spider: &Spider, url: &str) -> Result<RawMarkup, FetchError> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };

        let response = spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| FetchError::Network {
                url: url.to_string(),
                reason: format!("spider scrape failed: {}", e),
            })?;

        let parsed: serde_json::Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };
        let first = parsed.as_array().and_then(|arr| arr.first());

        let status = first
            .and_then(|obj| obj.get("status"))
            .and_then(|s| s.as_u64())
            .map(|s| s as u16);
        if let Some(status) = status.filter(|s| is_blocking_status(*s)) {
            return Err(FetchError::Blocked {
                url: url.to_string(),
                status,
            });
        }

        first
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str())
            .map(|body| RawMarkup::new(url, body))
            .ok_or_else(|| FetchError::Network {
                url: url.to_string(),
                reason: "no content in rendering response".to_string(),
            })
    }
}

#[async_trait]
impl Fetcher for PageFetcher {
    async fn fetch(&self, url: &str, render: bool) -> Result<RawMarkup, FetchError> {
        let start = Instant::now();
        let result = match (&self.spider, render) {
            (Some(spider), true) => self.fetch_rendered(spider, url).await,
            (None, true) => {
                debug!(url, "no rendering client configured, fetching plain HTML");
                self.fetch_plain(url).await
            }
            (_, false) => self.fetch_plain(url).await,
        };
        #[allow(clippy::cast_possible_truncation)]
        let latency_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(page) => info!(url, latency_ms, bytes = page.body.len(), "fetched"),
            Err(e) => debug!(url, latency_ms, error = %e, "fetch failed"),
        }
        result
    }
}

/// 403 and 429 mean the source is refusing us, not that the network failed.
fn is_blocking_status(status: u16) -> bool {
    matches!(status, 403 | 429)
}

fn classify(url: &str, err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout { url: url.to_string() };
    }
    if let Some(status) = err.status().map(|s| s.as_u16()).filter(|s| is_blocking_status(*s)) {
        return FetchError::Blocked {
            url: url.to_string(),
            status,
        };
    }
    FetchError::Network {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_statuses() {
        assert!(is_blocking_status(403));
        assert!(is_blocking_status(429));
        assert!(!is_blocking_status(500));
        assert!(!is_blocking_status(200));
    }

    #[test]
    fn plain_fetcher_needs_no_api_key() {
        let settings = FetchSettings {
            timeout: Duration::from_secs(5),
            user_agent: "test-agent".into(),
        };
        let fetcher = PageFetcher::new(&settings, false).unwrap();
        assert!(fetcher.spider.is_none());
    }
}
