//! Scripted `Fetch` for tests: canned documents keyed by URL prefix.

use std::collections::VecDeque;
use std::time::Duration;

use super::Fetch;
use crate::error::StepError;

pub enum Reply {
    Html(String),
    Timeout,
    Blocked,
    /// Never resolves; only the caller's timeout ends it.
    Hang,
}

struct Route {
    prefix: String,
    replies: VecDeque<Reply>,
    fallback: Option<String>,
}

#[derive(Default)]
pub struct FakeFetch {
    routes: Vec<Route>,
    pub visited: Vec<String>,
    pub consent_present: bool,
    pub dismissed: usize,
}

impl FakeFetch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `html` for URLs starting with `prefix`.
    pub fn page(mut self, prefix: &str, html: &str) -> Self {
        self.routes.push(Route {
            prefix: prefix.to_string(),
            replies: VecDeque::new(),
            fallback: Some(html.to_string()),
        });
        self
    }

    /// Answer with `replies` in order, then fail with a timeout.
    pub fn script(mut self, prefix: &str, replies: Vec<Reply>) -> Self {
        self.routes.push(Route {
            prefix: prefix.to_string(),
            replies: replies.into(),
            fallback: None,
        });
        self
    }

    pub fn with_consent(mut self) -> Self {
        self.consent_present = true;
        self
    }
}

impl Fetch for FakeFetch {
    async fn load(&mut self, url: &str, _ready: &str, _wait: Duration) -> Result<String, StepError> {
        self.visited.push(url.to_string());
        let Some(route) = self.routes.iter_mut().find(|r| url.starts_with(&r.prefix)) else {
            return Err(StepError::navigation(url, "no route"));
        };
        let reply = match route.replies.pop_front() {
            Some(r) => r,
            None => match &route.fallback {
                Some(html) => Reply::Html(html.clone()),
                None => Reply::Timeout,
            },
        };
        match reply {
            Reply::Html(html) => Ok(html),
            Reply::Timeout => Err(StepError::Timeout(Duration::from_secs(1))),
            Reply::Blocked => Err(StepError::Blocked(url.to_string())),
            Reply::Hang => std::future::pending().await,
        }
    }

    async fn dismiss(&mut self, _selectors: &[String]) -> Result<bool, StepError> {
        if self.consent_present {
            self.consent_present = false;
            self.dismissed += 1;
            return Ok(true);
        }
        Ok(false)
    }
}
