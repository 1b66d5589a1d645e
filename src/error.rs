use std::time::Duration;

/// Failure of one network-bound step (search or page load).
///
/// These never leave the item processor: after the retry budget is spent
/// they are downgraded to a not-found outcome for the row.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("blocked by interstitial at {0}")]
    Blocked(String),

    #[error("browser error: {0}")]
    Browser(String),
}

impl StepError {
    pub fn navigation(url: impl Into<String>, reason: impl ToString) -> Self {
        StepError::Navigation {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Blocks and timeouts are worth another attempt after backing off;
    /// a dead browser connection is not going to heal within the item.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StepError::Browser(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_errors_are_not_retried() {
        assert!(!StepError::Browser("connection closed".into()).is_retryable());
        assert!(StepError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(StepError::Blocked("https://search.seznam.cz".into()).is_retryable());
        assert!(StepError::navigation("https://x.cz", "dns").is_retryable());
    }

    #[test]
    fn navigation_message_names_url() {
        let e = StepError::navigation("https://www.novinky.cz/clanek/1", "reset");
        assert_eq!(
            e.to_string(),
            "navigation to https://www.novinky.cz/clanek/1 failed: reset"
        );
    }
}
