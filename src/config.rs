use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_FILE: &str = "vidsource.toml";
const ENV_PREFIX: &str = "VIDSOURCE";

/// All tunables, layered as defaults <- `vidsource.toml` <- `VIDSOURCE__*` env vars.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub search: SearchSettings,
    pub snippet: SnippetSettings,
    pub browser: BrowserSettings,
    pub retry: RetrySettings,
    pub throttle: ThrottleSettings,
    pub orchestrator: OrchestratorSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Result page URL; `{query}` is replaced by the encoded query.
    pub url_template: String,
    pub domain: String,
    /// Markup that is present whenever the engine rendered a result list.
    pub result_selector: String,
    pub exclude_paths: Vec<String>,
    pub block_markers: Vec<String>,
    pub consent_selectors: Vec<String>,
    pub wait_ms: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            url_template: "https://search.seznam.cz/?q={query}".into(),
            domain: "novinky.cz".into(),
            result_selector: "[data-dot='results'], [data-dot='result'], [data-dot='organic'], .result"
                .into(),
            exclude_paths: vec!["/diskuze".into(), "/forum".into()],
            block_markers: vec!["captcha".into(), "unusual traffic".into(), "robot".into()],
            consent_selectors: default_consent_selectors(),
            wait_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnippetSettings {
    pub container_selector: String,
    pub text_selector: String,
    pub strip_prefixes: Vec<String>,
    pub consent_selectors: Vec<String>,
    pub max_chars: usize,
    pub wait_ms: u64,
}

impl Default for SnippetSettings {
    fn default() -> Self {
        Self {
            container_selector: "div.ogm-main-media__container".into(),
            text_selector: "span.f_bJ".into(),
            strip_prefixes: ["Video:", "Foto:", "Zdroj:", "Autor:"]
                .into_iter()
                .map(String::from)
                .collect(),
            consent_selectors: default_consent_selectors(),
            max_chars: 200,
            wait_ms: 10_000,
        }
    }
}

fn default_consent_selectors() -> Vec<String> {
    vec![
        "button[data-testid='cw-button-agree-with-ads']".into(),
        "[data-testid*='consent'] button".into(),
        "div[role='dialog'] button".into(),
    ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub nav_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub user_agents: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_executable: None,
            nav_timeout_ms: 15_000,
            poll_interval_ms: 250,
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15".into(),
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: u32,
    pub base_backoff_ms: u64,
    pub step_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff_ms: 2_000,
            step_timeout_ms: 45_000,
        }
    }
}

impl RetrySettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_backoff_ms.saturating_mul(2u64.saturating_pow(attempt)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub batch_pause_min_ms: u64,
    pub batch_pause_max_ms: u64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            jitter_min_ms: 2_000,
            jitter_max_ms: 5_000,
            batch_pause_min_ms: 10_000,
            batch_pause_max_ms: 20_000,
        }
    }
}

impl ThrottleSettings {
    /// No delays at all; used by tests and `lookup`.
    pub fn none() -> Self {
        Self {
            jitter_min_ms: 0,
            jitter_max_ms: 0,
            batch_pause_min_ms: 0,
            batch_pause_max_ms: 0,
        }
    }

    pub fn jitter(&self) -> Duration {
        random_between(self.jitter_min_ms, self.jitter_max_ms)
    }

    pub fn batch_pause(&self) -> Duration {
        random_between(self.batch_pause_min_ms, self.batch_pause_max_ms)
    }
}

fn random_between(min_ms: u64, max_ms: u64) -> Duration {
    use rand::Rng;
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub max_runs: u32,
    pub max_items_per_run: usize,
    pub batch_size: usize,
    pub run_timeout_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_runs: 50,
            max_items_per_run: 15,
            batch_size: 15,
            run_timeout_secs: 25 * 60,
            cooldown_secs: 5,
        }
    }
}

/// Load settings from `path` (required) or `./vidsource.toml` (optional),
/// then apply `VIDSOURCE__SECTION__KEY` environment overrides.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let file = match path {
        Some(p) => config::File::from(p).required(true),
        None => config::File::with_name(DEFAULT_FILE).required(false),
    };

    config::Config::builder()
        .add_source(file)
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Invalid configuration")
}
