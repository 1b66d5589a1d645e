use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;

use super::{pick_user_agent, Fetch};
use crate::config::BrowserSettings;
use crate::error::StepError;

/// Plain HTTP fetcher for pages that render without JavaScript.
/// Waits are meaningless here: the document is complete once downloaded.
pub struct HttpSession {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSession {
    pub fn new(settings: &BrowserSettings) -> Result<Self> {
        let timeout = Duration::from_millis(settings.nav_timeout_ms);
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers());
        if let Some(ua) = pick_user_agent(&settings.user_agents) {
            builder = builder.user_agent(ua.to_string());
        }
        let client = builder.build().context("Failed to build HTTP client")?;
        Ok(HttpSession { client, timeout })
    }
}

fn default_headers() -> reqwest::header::HeaderMap {
    use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
    let mut h = HeaderMap::new();
    h.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    h.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("cs-CZ,cs;q=0.9,en;q=0.8"));
    h
}

impl Fetch for HttpSession {
    async fn load(&mut self, url: &str, _ready: &str, _wait: Duration) -> Result<String, StepError> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                StepError::Timeout(self.timeout)
            } else {
                StepError::navigation(url, e)
            }
        })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
            return Err(StepError::Blocked(url.to_string()));
        }
        if status.is_server_error() {
            return Err(StepError::navigation(url, format!("HTTP {}", status)));
        }
        // 404 and friends still carry a document; it just lacks the markup we want.
        resp.text().await.map_err(|e| StepError::navigation(url, e))
    }

    async fn dismiss(&mut self, _selectors: &[String]) -> Result<bool, StepError> {
        Ok(false)
    }
}
