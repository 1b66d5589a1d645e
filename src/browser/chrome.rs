use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{pick_user_agent, Fetch};
use crate::config::BrowserSettings;
use crate::error::StepError;

/// One headless Chromium with a single tab, reused for every item of an
/// invocation so consent cookies stick.
pub struct ChromeSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    nav_timeout: Duration,
    poll: Duration,
}

impl ChromeSession {
    pub async fn launch(settings: &BrowserSettings) -> Result<Self> {
        let nav_timeout = Duration::from_millis(settings.nav_timeout_ms);

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1920, 1080)
            .request_timeout(nav_timeout)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--lang=cs-CZ");
        if !settings.headless {
            builder = builder.with_head();
        }
        if let Some(exe) = &settings.chrome_executable {
            builder = builder.chrome_executable(exe);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Invalid browser config: {}", e))?;

        let (browser, mut events) = Browser::launch(config)
            .await
            .context("Failed to launch Chromium")?;

        // The CDP connection only makes progress while its handler is polled.
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(e) = event {
                    debug!("CDP handler: {}", e);
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open browser tab")?;
        if let Some(ua) = pick_user_agent(&settings.user_agents) {
            page.set_user_agent(ua)
                .await
                .context("Failed to set user agent")?;
        }

        info!(headless = settings.headless, "Browser session started");
        Ok(ChromeSession {
            browser,
            page,
            handler,
            nav_timeout,
            poll: Duration::from_millis(settings.poll_interval_ms.max(50)),
        })
    }

    /// Poll for `selector` until it matches or `wait` runs out.
    async fn wait_for(&self, selector: &str, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let found = tokio::time::timeout(remaining.max(self.poll), self.page.find_element(selector));
            if let Ok(Ok(_)) = found.await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

impl Fetch for ChromeSession {
    async fn load(&mut self, url: &str, ready: &str, wait: Duration) -> Result<String, StepError> {
        match tokio::time::timeout(self.nav_timeout, self.page.goto(url)).await {
            Err(_) => return Err(StepError::Timeout(self.nav_timeout)),
            Ok(Err(e)) => return Err(StepError::navigation(url, e)),
            Ok(Ok(_)) => {}
        }

        if !self.wait_for(ready, wait).await {
            debug!(url, ready, "Ready selector did not appear within {:?}", wait);
        }

        match tokio::time::timeout(self.nav_timeout, self.page.content()).await {
            Err(_) => Err(StepError::Timeout(self.nav_timeout)),
            Ok(Err(e)) => Err(StepError::Browser(e.to_string())),
            Ok(Ok(html)) => Ok(html),
        }
    }

    async fn dismiss(&mut self, selectors: &[String]) -> Result<bool, StepError> {
        for selector in selectors {
            let Ok(element) = self.page.find_element(selector.as_str()).await else {
                continue;
            };
            match element.click().await {
                Ok(_) => {
                    debug!(selector = %selector, "Dismissed consent dialog");
                    return Ok(true);
                }
                Err(e) => debug!(selector = %selector, "Consent control not clickable: {}", e),
            }
        }
        Ok(false)
    }
}
