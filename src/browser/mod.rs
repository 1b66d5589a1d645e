pub mod chrome;
pub mod http;

#[cfg(test)]
pub mod fake;

use std::time::Duration;

use rand::seq::SliceRandom;

use crate::error::StepError;

pub use chrome::ChromeSession;
pub use http::HttpSession;

/// Page loading, the only thing the resolver and extractor need from a browser.
///
/// Every call is bounded: navigation by the session's own timeout, element
/// waits by `wait`.
#[allow(async_fn_in_trait)]
pub trait Fetch {
    /// Navigate to `url`, wait up to `wait` for `ready` to match, and return
    /// the document HTML. A `ready` selector that never shows up is not an
    /// error; the caller decides what the markup means.
    async fn load(&mut self, url: &str, ready: &str, wait: Duration) -> Result<String, StepError>;

    /// Click the first element matching any of `selectors`.
    /// `Ok(false)` when none is present.
    async fn dismiss(&mut self, selectors: &[String]) -> Result<bool, StepError>;
}

pub fn pick_user_agent(agents: &[String]) -> Option<&str> {
    agents.choose(&mut rand::thread_rng()).map(String::as_str)
}
