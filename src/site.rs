use anyhow::Result;
use url::Url;

use crate::browser::Fetch;
use crate::config::Settings;
use crate::error::StepError;
use crate::search::SearchResolver;
use crate::snippet::SnippetExtractor;

/// The two site-specific capabilities the pipeline needs. Swapping the
/// destination site means another implementation of this trait; the item
/// processor and batch runner stay untouched.
#[allow(async_fn_in_trait)]
pub trait SourceSite {
    /// Candidate article for a title, or `None` when the search has no hit.
    async fn resolve(&mut self, title: &str) -> Result<Option<Url>, StepError>;

    /// Source credit on the article page, or `None` when the markup lacks it.
    async fn extract(&mut self, url: &Url) -> Result<Option<String>, StepError>;
}

/// Search engine + article markup rules driven over one page session.
pub struct NewsSite<F> {
    fetch: F,
    search: SearchResolver,
    snippet: SnippetExtractor,
}

impl<F: Fetch> NewsSite<F> {
    pub fn new(fetch: F, settings: &Settings) -> Result<Self> {
        let search = SearchResolver::new(settings.search.clone())?;
        let snippet = SnippetExtractor::new(settings.snippet.clone())?;
        Ok(Self::with_parts(fetch, search, snippet))
    }

    pub fn with_parts(fetch: F, search: SearchResolver, snippet: SnippetExtractor) -> Self {
        NewsSite { fetch, search, snippet }
    }

    pub fn into_fetch(self) -> F {
        self.fetch
    }
}

impl<F: Fetch> SourceSite for NewsSite<F> {
    async fn resolve(&mut self, title: &str) -> Result<Option<Url>, StepError> {
        self.search.resolve(&mut self.fetch, title).await
    }

    async fn extract(&mut self, url: &Url) -> Result<Option<String>, StepError> {
        self.snippet.extract(&mut self.fetch, url).await
    }
}
