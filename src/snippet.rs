use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info};
use url::Url;

use crate::browser::Fetch;
use crate::config::SnippetSettings;
use crate::error::StepError;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Pulls the source credit out of an article page.
pub struct SnippetExtractor {
    settings: SnippetSettings,
    container: Selector,
    text: Selector,
    consent_done: bool,
}

impl SnippetExtractor {
    pub fn new(settings: SnippetSettings) -> Result<Self> {
        let container = Selector::parse(&settings.container_selector)
            .map_err(|e| anyhow!("Invalid snippet.container_selector: {:?}", e))?;
        let text = Selector::parse(&settings.text_selector)
            .map_err(|e| anyhow!("Invalid snippet.text_selector: {:?}", e))?;
        Ok(SnippetExtractor {
            settings,
            container,
            text,
            consent_done: false,
        })
    }

    /// First non-empty text element nested in the container, cleaned.
    /// Missing markup is `None`, never an error.
    pub fn find_snippet(&self, html: &str) -> Option<String> {
        let doc = Html::parse_document(html);
        doc.select(&self.container)
            .flat_map(|c| c.select(&self.text))
            .find_map(|el| self.clean(&el.text().collect::<String>()))
    }

    fn clean(&self, raw: &str) -> Option<String> {
        let stripped = TAG_RE.replace_all(raw, " ");
        let mut text = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

        if let Some(prefix) = self
            .settings
            .strip_prefixes
            .iter()
            .find(|p| text.starts_with(p.as_str()))
        {
            text = text[prefix.len()..].trim().to_string();
        }

        if text.is_empty() {
            return None;
        }
        if text.chars().count() > self.settings.max_chars {
            let cut: String = text.chars().take(self.settings.max_chars).collect();
            text = format!("{}...", cut.trim_end());
        }
        Some(text)
    }

    pub async fn extract<F: Fetch>(&mut self, fetch: &mut F, url: &Url) -> Result<Option<String>, StepError> {
        let wait = Duration::from_millis(self.settings.wait_ms);
        let ready = self.settings.container_selector.as_str();

        let mut html = fetch.load(url.as_str(), ready, wait).await?;
        if !self.consent_done {
            self.consent_done = true;
            if fetch.dismiss(&self.settings.consent_selectors).await? {
                html = fetch.load(url.as_str(), ready, wait).await?;
            }
        }

        let snippet = self.find_snippet(&html);
        match &snippet {
            Some(s) => debug!(url = %url, snippet = %s, "Snippet found"),
            None => info!(url = %url, "No snippet in page markup"),
        }
        Ok(snippet)
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::FakeFetch;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    fn extractor() -> SnippetExtractor {
        SnippetExtractor::new(SnippetSettings::default()).unwrap()
    }

    #[test]
    fn finds_text_in_container() {
        assert_eq!(
            extractor().find_snippet(&fixture("article")).as_deref(),
            Some("Reuters, Jan Novák")
        );
    }

    #[test]
    fn missing_element_is_none() {
        assert_eq!(extractor().find_snippet(&fixture("article_no_source")), None);
        assert_eq!(extractor().find_snippet("<html><body></body></html>"), None);
    }

    #[test]
    fn empty_text_is_none() {
        let html = r#"<div class="ogm-main-media__container"><span class="f_bJ">  </span></div>"#;
        assert_eq!(extractor().find_snippet(html), None);
    }

    #[test]
    fn element_outside_container_does_not_count() {
        let html = r#"<span class="f_bJ">Wrong place</span><div class="ogm-main-media__container"></div>"#;
        assert_eq!(extractor().find_snippet(html), None);
    }

    #[test]
    fn credit_label_is_stripped_and_whitespace_collapsed() {
        let html = r#"<div class="ogm-main-media__container"><span class="f_bJ">Video:
            ČT24,   Novinky</span></div>"#;
        assert_eq!(extractor().find_snippet(html).as_deref(), Some("ČT24, Novinky"));
    }

    #[test]
    fn long_text_is_capped() {
        let long = "Ř".repeat(300);
        let html = format!(
            r#"<div class="ogm-main-media__container"><span class="f_bJ">{}</span></div>"#,
            long
        );
        let s = extractor().find_snippet(&html).unwrap();
        assert_eq!(s.chars().count(), 203);
        assert!(s.ends_with("..."));
    }

    #[tokio::test]
    async fn extract_round_trip() {
        let url = Url::parse("https://www.novinky.cz/clanek/domaci-pozar-skladu-v-brne-40400001").unwrap();

        let mut fetch = FakeFetch::new().page("https://www.novinky.cz/", &fixture("article"));
        let got = extractor().extract(&mut fetch, &url).await.unwrap();
        assert_eq!(got.as_deref(), Some("Reuters, Jan Novák"));

        let mut fetch = FakeFetch::new().page("https://www.novinky.cz/", &fixture("article_no_source"));
        assert_eq!(extractor().extract(&mut fetch, &url).await.unwrap(), None);
    }
}
