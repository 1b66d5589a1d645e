use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use url::Url;

use crate::config::{RetrySettings, ThrottleSettings};
use crate::error::StepError;
use crate::rows::{ExtractedRow, VideoRow};
use crate::site::SourceSite;

/// How one row ended. Persisted rows only show a snippet or `N/A`; this is
/// what the logs and run summary use to tell "absent" from "blocked".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Found,
    /// Search worked, nothing on the target site.
    NoMatch,
    /// Article found, credit element missing or empty.
    MissingSnippet,
    /// Every attempt of a step hit an interstitial.
    Blocked,
    /// Every attempt of a step timed out or errored.
    Failed,
}

impl Outcome {
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Found => "found",
            Outcome::NoMatch => "no match",
            Outcome::MissingSnippet => "missing snippet",
            Outcome::Blocked => "blocked",
            Outcome::Failed => "failed",
        }
    }

    fn from_error(e: &StepError) -> Self {
        match e {
            StepError::Blocked(_) => Outcome::Blocked,
            _ => Outcome::Failed,
        }
    }
}

pub struct Processed {
    pub row: ExtractedRow,
    pub outcome: Outcome,
}

/// Turns one input row into one output row. Never fails: step errors are
/// retried, then downgraded to `N/A`.
pub struct ItemProcessor<S> {
    site: S,
    retry: RetrySettings,
    throttle: ThrottleSettings,
}

impl<S: SourceSite> ItemProcessor<S> {
    pub fn new(site: S, retry: RetrySettings, throttle: ThrottleSettings) -> Self {
        ItemProcessor { site, retry, throttle }
    }

    pub fn into_site(self) -> S {
        self.site
    }

    pub fn throttle(&self) -> &ThrottleSettings {
        &self.throttle
    }

    pub async fn process(&mut self, row: &VideoRow) -> Processed {
        sleep(self.throttle.jitter()).await;

        let url = match self.resolve_with_retry(&row.title).await {
            Ok(Some(url)) => url,
            Ok(None) => return self.finish(row, None, None, Outcome::NoMatch),
            Err(e) => return self.finish(row, None, None, Outcome::from_error(&e)),
        };

        sleep(self.throttle.jitter()).await;

        match self.extract_with_retry(&url).await {
            Ok(Some(text)) => self.finish(row, Some(text), Some(url), Outcome::Found),
            Ok(None) => self.finish(row, None, Some(url), Outcome::MissingSnippet),
            Err(e) => self.finish(row, None, Some(url), Outcome::from_error(&e)),
        }
    }

    fn finish(&self, row: &VideoRow, text: Option<String>, url: Option<Url>, outcome: Outcome) -> Processed {
        match outcome {
            Outcome::Found => info!(title = %row.title, "Source: {}", text.as_deref().unwrap_or_default()),
            Outcome::Blocked => warn!(title = %row.title, "Blocked on every attempt; recording N/A"),
            Outcome::Failed => warn!(title = %row.title, "Failed on every attempt; recording N/A"),
            _ => info!(title = %row.title, "No source ({})", outcome.label()),
        }
        Processed {
            row: ExtractedRow::new(row, text, url.map(String::from)),
            outcome,
        }
    }

    async fn resolve_with_retry(&mut self, title: &str) -> Result<Option<Url>, StepError> {
        let limit = self.retry.step_timeout();
        let mut attempt = 0;
        loop {
            let result = match timeout(limit, self.site.resolve(title)).await {
                Ok(r) => r,
                Err(_) => Err(StepError::Timeout(limit)),
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) => match self.backoff_for("search", title, attempt, &e) {
                    Some(delay) => sleep(delay).await,
                    None => return Err(e),
                },
            }
            attempt += 1;
        }
    }

    async fn extract_with_retry(&mut self, url: &Url) -> Result<Option<String>, StepError> {
        let limit = self.retry.step_timeout();
        let mut attempt = 0;
        loop {
            let result = match timeout(limit, self.site.extract(url)).await {
                Ok(r) => r,
                Err(_) => Err(StepError::Timeout(limit)),
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) => match self.backoff_for("extract", url.as_str(), attempt, &e) {
                    Some(delay) => sleep(delay).await,
                    None => return Err(e),
                },
            }
            attempt += 1;
        }
    }

    /// Delay before the next attempt, or `None` when the step is out of tries.
    fn backoff_for(&self, step: &str, subject: &str, attempt: u32, err: &StepError) -> Option<Duration> {
        let attempts = self.retry.attempts.max(1);
        if !err.is_retryable() || attempt + 1 >= attempts {
            warn!(step, subject, tries = attempt + 1, "Giving up: {}", err);
            return None;
        }
        let delay = self.retry.backoff(attempt);
        warn!(
            step,
            subject,
            "Attempt {}/{} failed: {}; backing off {:.1}s",
            attempt + 1,
            attempts,
            err,
            delay.as_secs_f64()
        );
        Some(delay)
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::FakeFetch;
    use crate::config::Settings;
    use crate::rows::NOT_FOUND;
    use crate::site::fake::FakeSite;
    use crate::site::NewsSite;

    fn row(title: &str) -> VideoRow {
        VideoRow {
            category: "Zahraniční".into(),
            title: title.into(),
            views: 4200,
            completion25: 70.0,
            completion50: 50.0,
            completion75: 30.0,
            completion100: 10.0,
        }
    }

    fn retry() -> RetrySettings {
        RetrySettings {
            attempts: 3,
            base_backoff_ms: 1_000,
            step_timeout_ms: 5_000,
        }
    }

    fn processor(site: FakeSite) -> ItemProcessor<FakeSite> {
        ItemProcessor::new(site, retry(), ThrottleSettings::none())
    }

    #[tokio::test(start_paused = true)]
    async fn found_row_carries_snippet_and_url() {
        let site = FakeSite::knowing(&[("Summit v Bruselu", Some("Reuters, Jan Novák"))]);
        let mut p = processor(site);

        let out = p.process(&row("Summit v Bruselu")).await;
        assert_eq!(out.outcome, Outcome::Found);
        assert_eq!(out.row.source_text, "Reuters, Jan Novák");
        assert_eq!(out.row.source_url, "https://www.novinky.cz/clanek/video-0");
        assert_eq!(out.row.views, 4200);
        assert_eq!(out.row.completion75, 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_search_hit_skips_extraction() {
        let mut p = processor(FakeSite::default());
        let out = p.process(&row("Neznámé video")).await;
        assert_eq!(out.outcome, Outcome::NoMatch);
        assert_eq!(out.row.source_text, NOT_FOUND);
        assert_eq!(out.row.source_url, NOT_FOUND);
        assert!(p.into_site().extracted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn off_site_result_is_not_found() {
        let html = r#"<div class="result"><a href="https://www.idnes.cz/zpravy/pozar-skladu">iDNES</a></div>"#;
        let fetch = FakeFetch::new().page("https://search.seznam.cz/", html);
        let site = NewsSite::new(fetch, &Settings::default()).unwrap();

        let out = ItemProcessor::new(site, retry(), ThrottleSettings::none())
            .process(&row("Požár skladu"))
            .await;
        assert_eq!(out.outcome, Outcome::NoMatch);
        assert_eq!(out.row.source_text, NOT_FOUND);
        assert_eq!(out.row.source_url, NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_snippet_keeps_url() {
        let site = FakeSite::knowing(&[("Bez zdroje", None)]);
        let out = processor(site).process(&row("Bez zdroje")).await;
        assert_eq!(out.outcome, Outcome::MissingSnippet);
        assert_eq!(out.row.source_text, NOT_FOUND);
        assert_eq!(out.row.source_url, "https://www.novinky.cz/clanek/video-0");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let mut site = FakeSite::knowing(&[("Nehoda na D1", Some("ČTK"))]);
        site.resolve_script.push_back(Err(StepError::Timeout(Duration::from_secs(1))));
        site.resolve_script.push_back(Err(StepError::navigation("https://search.seznam.cz", "reset")));

        let mut p = processor(site);
        let out = p.process(&row("Nehoda na D1")).await;
        assert_eq!(out.outcome, Outcome::Found);
        assert_eq!(out.row.source_text, "ČTK");
        assert_eq!(p.into_site().resolved.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_block_degrades_to_not_found() {
        let mut site = FakeSite::knowing(&[("Blokováno", Some("never seen"))]);
        for _ in 0..3 {
            site.resolve_script
                .push_back(Err(StepError::Blocked("https://search.seznam.cz".into())));
        }

        let mut p = processor(site);
        let out = p.process(&row("Blokováno")).await;
        assert_eq!(out.outcome, Outcome::Blocked);
        assert_eq!(out.row.source_text, NOT_FOUND);
        assert_eq!(out.row.source_url, NOT_FOUND);
        assert_eq!(p.into_site().resolved.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn browser_errors_are_not_retried() {
        let mut site = FakeSite::default();
        site.resolve_script
            .push_back(Err(StepError::Browser("connection closed".into())));

        let mut p = processor(site);
        let out = p.process(&row("Pád prohlížeče")).await;
        assert_eq!(out.outcome, Outcome::Failed);
        assert_eq!(p.into_site().resolved.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_page_is_bounded_by_step_timeout() {
        let mut site = FakeSite::knowing(&[("Zaseknutá stránka", Some("x"))]);
        site.hang_extract = true;
        let mut p = processor(site);

        // 3 attempts x 5s timeout + 1s + 2s backoff
        let bound = Duration::from_secs(3 * 5 + 1 + 2 + 1);
        let started = tokio::time::Instant::now();
        let out = timeout(bound, p.process(&row("Zaseknutá stránka")))
            .await
            .expect("process must terminate");

        assert_eq!(out.outcome, Outcome::Failed);
        assert_eq!(out.row.source_text, NOT_FOUND);
        assert_eq!(out.row.source_url, "https://www.novinky.cz/clanek/video-0");
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(p.into_site().extracted.len(), 3);
    }
}
