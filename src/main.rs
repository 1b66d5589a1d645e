mod batch;
mod browser;
mod config;
mod error;
mod orchestrator;
mod processor;
mod progress;
mod rows;
mod search;
mod site;
mod snippet;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::batch::{run_batch, BatchEnd, BatchLimits, BatchStats};
use crate::browser::{ChromeSession, Fetch, HttpSession};
use crate::config::{Settings, ThrottleSettings};
use crate::orchestrator::{ChildLauncher, Dataset, RunEnd};
use crate::processor::ItemProcessor;
use crate::progress::{read_snapshot, report_failure, JsonFileReporter, ProgressReporter, Reporters, StdoutReporter};
use crate::rows::{count_extracted, input_delimiter, read_clean, read_extracted, rewrite_row, CheckpointWriter, VideoRow};
use crate::search::SearchResolver;
use crate::site::NewsSite;
use crate::snippet::SnippetExtractor;

#[derive(Parser)]
#[command(name = "vidsource", about = "Find the source credit of news videos by title")]
struct Cli {
    /// Settings file (default: ./vidsource.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Engine {
    /// Headless Chromium (pages that need JavaScript)
    Chrome,
    /// Plain HTTP client
    Http,
}

impl Engine {
    fn as_str(self) -> &'static str {
        match self {
            Engine::Chrome => "chrome",
            Engine::Http => "http",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Process one bounded batch of pending rows
    Extract {
        /// Cleaned input table
        input: PathBuf,
        /// Output table (appended to, created if missing)
        output: PathBuf,
        /// Max rows this run (default: all pending)
        max_items: Option<usize>,
        /// Rows per chunk; chunks are separated by a cooldown
        #[arg(default_value_t = 15)]
        batch_size: usize,
        /// Progress file, overwritten after every row
        #[arg(long)]
        progress: Option<PathBuf>,
        /// Also print progress snapshots as JSON lines on stdout
        #[arg(long)]
        json: bool,
        #[arg(long, value_enum, default_value = "chrome")]
        engine: Engine,
    },
    /// Re-run `extract` on a dataset directory until it is complete or stuck
    Run {
        /// Directory holding clean.csv, extracted.csv and progress.json
        dataset: PathBuf,
        #[arg(long)]
        max_items: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        max_runs: Option<u32>,
        #[arg(long, value_enum, default_value = "chrome")]
        engine: Engine,
    },
    /// Look up a single title and print the resulting row
    Lookup {
        title: String,
        #[arg(long, value_enum, default_value = "chrome")]
        engine: Engine,
    },
    /// Show dataset progress
    Stats {
        dataset: PathBuf,
    },
    /// Manually fix the source of an already extracted row
    Correct {
        output: PathBuf,
        title: String,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = config::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Extract {
            input,
            output,
            max_items,
            batch_size,
            progress,
            json,
            engine,
        } => {
            let mut reporters = Reporters::default();
            if let Some(p) = &progress {
                reporters.0.push(Box::new(JsonFileReporter::new(p)));
            }
            if json {
                reporters.0.push(Box::new(StdoutReporter));
            }
            let limits = BatchLimits {
                max_items,
                chunk_size: batch_size,
            };

            match extract(&settings, engine, &input, &output, limits, &mut reporters).await {
                Ok(stats) => {
                    print_batch(&stats);
                    Ok(())
                }
                Err(e) => {
                    report_failure(&mut reporters, progress.as_deref(), &e);
                    Err(e)
                }
            }
        }
        Commands::Run {
            dataset,
            max_items,
            batch_size,
            max_runs,
            engine,
        } => {
            let mut orch = settings.orchestrator.clone();
            if let Some(n) = max_items {
                orch.max_items_per_run = n;
            }
            if let Some(n) = batch_size {
                orch.batch_size = n;
            }
            if let Some(n) = max_runs {
                orch.max_runs = n;
            }

            let ds = Dataset::new(&dataset);
            let mut args = vec!["--engine".into(), engine.as_str().into()];
            if let Some(c) = &cli.config {
                args.push("--config".into());
                args.push(c.clone().into_os_string());
            }
            let mut launcher =
                ChildLauncher::current(Duration::from_secs(orch.run_timeout_secs))?.with_args(args);
            let mut reporter = JsonFileReporter::new(ds.progress());

            let summary = orchestrator::run_dataset(&mut launcher, &ds, &orch, &mut reporter).await?;
            println!(
                "{} runs: {} -> {} of {} processed ({})",
                summary.runs,
                summary.processed_before,
                summary.processed_after,
                summary.total,
                match summary.end {
                    RunEnd::Completed => "completed",
                    RunEnd::Stalled => "stalled",
                    RunEnd::RunCap => "run cap reached",
                    RunEnd::Failed => "failed",
                }
            );
            if summary.end == RunEnd::Failed {
                bail!("Dataset {} ended in error", dataset.display());
            }
            Ok(())
        }
        Commands::Lookup { title, engine } => lookup(&settings, engine, &title).await,
        Commands::Stats { dataset } => stats(&Dataset::new(dataset)),
        Commands::Correct {
            output,
            title,
            text,
            url,
        } => {
            if text.is_none() && url.is_none() {
                bail!("Nothing to correct: pass --text and/or --url");
            }
            let n = rewrite_row(&output, &title, text.as_deref(), url.as_deref())?;
            if n == 0 {
                bail!("No row titled \"{}\" in {}", truncate(&title, 60), output.display());
            }
            println!("Updated {} row(s) for \"{}\"", n, truncate(&title, 60));
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        eprintln!("Done in {}", format_duration(elapsed));
    }

    result
}

// ── Extract ──

async fn extract<R: ProgressReporter + ?Sized>(
    settings: &Settings,
    engine: Engine,
    input: &Path,
    output: &Path,
    limits: BatchLimits,
    reporter: &mut R,
) -> Result<BatchStats> {
    let rows = read_clean(input)?;
    let (mut writer, done) = CheckpointWriter::resume(output, input_delimiter(input)?)?;
    let search = SearchResolver::new(settings.search.clone())?;
    let snippet = SnippetExtractor::new(settings.snippet.clone())?;

    match engine {
        Engine::Chrome => {
            let session = ChromeSession::launch(&settings.browser).await?;
            let site = NewsSite::with_parts(session, search, snippet);
            let (site, stats) = drive(site, settings, &rows, &done, limits, &mut writer, reporter).await;
            site.into_fetch().close().await;
            stats
        }
        Engine::Http => {
            let site = NewsSite::with_parts(HttpSession::new(&settings.browser)?, search, snippet);
            drive(site, settings, &rows, &done, limits, &mut writer, reporter).await.1
        }
    }
}

/// Run one batch, handing the site back so its browser can be closed
/// whatever the outcome.
async fn drive<F: Fetch, R: ProgressReporter + ?Sized>(
    site: NewsSite<F>,
    settings: &Settings,
    rows: &[VideoRow],
    done: &HashSet<String>,
    limits: BatchLimits,
    writer: &mut CheckpointWriter,
    reporter: &mut R,
) -> (NewsSite<F>, Result<BatchStats>) {
    let mut processor = ItemProcessor::new(site, settings.retry.clone(), settings.throttle.clone());
    let stats = run_batch(&mut processor, rows, done, limits, writer, reporter).await;
    (processor.into_site(), stats)
}

fn print_batch(stats: &BatchStats) {
    println!(
        "Processed {} rows: {} found, {} not found, {} blocked, {} failed.",
        stats.processed, stats.found, stats.not_found, stats.blocked, stats.failed
    );
    match stats.end {
        BatchEnd::Completed => println!("All rows processed."),
        BatchEnd::Exhausted => println!("{} rows remaining.", stats.remaining),
        BatchEnd::Stalled => println!("Nothing processed; {} rows remaining.", stats.remaining),
    }
}

// ── Lookup / stats ──

async fn lookup(settings: &Settings, engine: Engine, title: &str) -> Result<()> {
    let row = VideoRow {
        category: String::new(),
        title: title.to_string(),
        views: 0,
        completion25: 0.0,
        completion50: 0.0,
        completion75: 0.0,
        completion100: 0.0,
    };

    let processed = match engine {
        Engine::Chrome => {
            let session = ChromeSession::launch(&settings.browser).await?;
            let site = NewsSite::new(session, settings)?;
            let mut p = ItemProcessor::new(site, settings.retry.clone(), ThrottleSettings::none());
            let out = p.process(&row).await;
            p.into_site().into_fetch().close().await;
            out
        }
        Engine::Http => {
            let site = NewsSite::new(HttpSession::new(&settings.browser)?, settings)?;
            ItemProcessor::new(site, settings.retry.clone(), ThrottleSettings::none())
                .process(&row)
                .await
        }
    };

    println!("Title:   {}", truncate(title, 80));
    println!("Outcome: {}", processed.outcome.label());
    println!("Source:  {}", processed.row.source_text);
    println!("URL:     {}", processed.row.source_url);
    Ok(())
}

fn stats(ds: &Dataset) -> Result<()> {
    let (total, processed) = orchestrator::counts(ds)?;
    let rows = count_extracted(&ds.output())?;
    let with_snippet = read_extracted(&ds.output())?
        .iter()
        .filter(|r| r.has_snippet())
        .count();

    println!("Total:        {}", total);
    println!("Processed:    {}", processed);
    println!("Output rows:  {}", rows);
    println!("With source:  {}", with_snippet);
    println!("N/A:          {}", rows.saturating_sub(with_snippet));
    println!("Remaining:    {}", total.saturating_sub(processed));

    match read_snapshot(&ds.progress())? {
        Some(s) => println!(
            "Last status:  {:?} {}% ({}/{}) {} [{}]",
            s.status,
            s.percentage,
            s.current,
            s.total,
            truncate(&s.message, 60),
            s.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("Last status:  none"),
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
