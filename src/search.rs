use anyhow::{anyhow, Result};
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::Fetch;
use crate::config::SearchSettings;
use crate::error::StepError;

/// What a results page said about one query.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Match(Url),
    /// Results rendered, none on the target host.
    NoMatch,
    /// No result markup and no sign of an interstitial.
    NoResults,
    /// No result markup, but the page looks like a CAPTCHA or block notice.
    Blocked,
}

/// Build the engine URL for `"<title>" site:<domain>`.
/// Double quotes inside the title would end the phrase early, so they are dropped.
pub fn query_url(template: &str, title: &str, domain: &str) -> String {
    let phrase: String = title.chars().filter(|c| *c != '"').collect();
    let query = format!("\"{}\" site:{}", phrase.trim(), domain);
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    template.replace("{query}", &encoded)
}

/// Exact host or any subdomain of `domain`.
pub fn host_matches(host: &str, domain: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{}", domain))
}

/// Engines wrap outbound links in their own redirectors; pull the target out.
fn unwrap_redirect(link: Url, domain: &str) -> Url {
    if link.host_str().is_some_and(|h| host_matches(h, domain)) {
        return link;
    }
    for (key, value) in link.query_pairs() {
        if !matches!(key.as_ref(), "q" | "url" | "uddg" | "u") {
            continue;
        }
        if let Ok(inner) = Url::parse(&value) {
            if matches!(inner.scheme(), "http" | "https") {
                return inner;
            }
        }
    }
    link
}

// ── Resolver ──

pub struct SearchResolver {
    settings: SearchSettings,
    results: Selector,
    links: Selector,
    consent_done: bool,
}

impl SearchResolver {
    pub fn new(settings: SearchSettings) -> Result<Self> {
        let results = Selector::parse(&settings.result_selector)
            .map_err(|e| anyhow!("Invalid search.result_selector: {:?}", e))?;
        let links = Selector::parse("a[href]").map_err(|e| anyhow!("{:?}", e))?;
        Ok(SearchResolver {
            settings,
            results,
            links,
            consent_done: false,
        })
    }

    /// Read a results page. Only links inside result markup count, so the
    /// engine's own navigation never produces a false match.
    pub fn pick_result(&self, html: &str, page_url: &Url) -> Lookup {
        let doc = Html::parse_document(html);
        let mut saw_results = false;

        for block in doc.select(&self.results) {
            saw_results = true;
            for a in block.select(&self.links) {
                let Some(href) = a.value().attr("href") else { continue };
                let Ok(link) = page_url.join(href.trim()) else { continue };
                let link = unwrap_redirect(link, &self.settings.domain);
                if self.accepts(&link) {
                    return Lookup::Match(link);
                }
            }
        }

        if saw_results {
            return Lookup::NoMatch;
        }
        let text = doc.root_element().text().collect::<String>().to_lowercase();
        if self
            .settings
            .block_markers
            .iter()
            .any(|m| text.contains(&m.to_lowercase()))
        {
            Lookup::Blocked
        } else {
            Lookup::NoResults
        }
    }

    fn accepts(&self, link: &Url) -> bool {
        let Some(host) = link.host_str() else { return false };
        if !host_matches(host, &self.settings.domain) {
            return false;
        }
        let path = link.path();
        if path.is_empty() || path == "/" {
            return false;
        }
        !self
            .settings
            .exclude_paths
            .iter()
            .any(|p| path.contains(p.as_str()))
    }

    /// Search for `title` restricted to the target site.
    ///
    /// `Ok(None)` is a valid answer (no matching result). An interstitial is
    /// returned as `StepError::Blocked` so the caller can back off and retry.
    pub async fn resolve<F: Fetch>(&mut self, fetch: &mut F, title: &str) -> Result<Option<Url>, StepError> {
        let url = query_url(&self.settings.url_template, title, &self.settings.domain);
        let page_url = Url::parse(&url).map_err(|e| StepError::navigation(&url, e))?;
        let wait = Duration::from_millis(self.settings.wait_ms);

        debug!(title, url = %url, "Searching");
        let mut html = fetch.load(&url, &self.settings.result_selector, wait).await?;

        if !self.consent_done {
            self.consent_done = true;
            if fetch.dismiss(&self.settings.consent_selectors).await? {
                html = fetch.load(&url, &self.settings.result_selector, wait).await?;
            }
        }

        match self.pick_result(&html, &page_url) {
            Lookup::Match(link) => {
                debug!(title, link = %link, "Search match");
                Ok(Some(link))
            }
            Lookup::NoMatch => {
                info!(title, "No result on {}", self.settings.domain);
                Ok(None)
            }
            Lookup::NoResults => {
                info!(title, "Search returned no results");
                Ok(None)
            }
            Lookup::Blocked => {
                warn!(title, "Search engine served an interstitial");
                Err(StepError::Blocked(url))
            }
        }
    }
}

// ── Tests ──
