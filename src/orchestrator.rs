use std::collections::HashSet;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::config::OrchestratorSettings;
use crate::progress::{ProgressReporter, ProgressSnapshot, Status};
use crate::rows::{read_clean, read_processed_titles};

pub const INPUT_FILE: &str = "clean.csv";
pub const OUTPUT_FILE: &str = "extracted.csv";
pub const PROGRESS_FILE: &str = "progress.json";

/// A dataset directory: cleaned input, extracted output, progress cell.
#[derive(Debug, Clone)]
pub struct Dataset {
    dir: PathBuf,
}

impl Dataset {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Dataset { dir: dir.into() }
    }

    pub fn input(&self) -> PathBuf {
        self.dir.join(INPUT_FILE)
    }

    pub fn output(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE)
    }

    pub fn progress(&self) -> PathBuf {
        self.dir.join(PROGRESS_FILE)
    }

    /// Input titles in file order, duplicates included.
    pub fn titles(&self) -> Result<Vec<String>> {
        Ok(read_clean(&self.input())?.into_iter().map(|r| r.title).collect())
    }

    /// Input rows whose title already appears in the output.
    pub fn processed(&self, titles: &[String]) -> Result<usize> {
        let done: HashSet<String> = read_processed_titles(&self.output())?;
        Ok(titles.iter().filter(|t| done.contains(*t)).count())
    }
}

// ── Policy ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Completed,
    /// The last invocation made no progress.
    Stalled,
    /// Work remains but the invocation cap is reached.
    RunCap,
}

/// What to do after invocation number `run` (1-based) moved the processed
/// count from `before` to `after`.
pub fn decide(total: usize, before: usize, after: usize, run: u32, max_runs: u32) -> Decision {
    if after >= total {
        Decision::Completed
    } else if after <= before {
        Decision::Stalled
    } else if run >= max_runs {
        Decision::RunCap
    } else {
        Decision::Continue
    }
}

// ── Launching ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    Success,
    /// Non-zero exit: the invocation hit an infrastructure error.
    Failed(String),
    /// Killed after the wall-clock limit.
    TimedOut,
}

/// Runs one bounded batch invocation against a dataset.
#[allow(async_fn_in_trait)]
pub trait Launcher {
    async fn launch(&mut self, dataset: &Dataset, max_items: usize, batch_size: usize) -> Result<RunExit>;
}

/// Spawns `<this executable> extract ...` in its own process group and
/// kills the whole group when it outlives the wall-clock limit.
pub struct ChildLauncher {
    program: PathBuf,
    leading_args: Vec<OsString>,
    limit: Duration,
    extra_args: Vec<OsString>,
}

impl ChildLauncher {
    pub fn new(program: impl Into<PathBuf>, limit: Duration) -> Self {
        ChildLauncher {
            program: program.into(),
            leading_args: Vec::new(),
            limit,
            extra_args: Vec::new(),
        }
    }

    pub fn current(limit: Duration) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate own executable")?;
        Ok(Self::new(exe, limit))
    }

    /// Arguments placed before the `extract` subcommand.
    #[cfg(test)]
    pub fn with_leading_args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Arguments appended after the positional ones (engine, config file).
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Launcher for ChildLauncher {
    async fn launch(&mut self, dataset: &Dataset, max_items: usize, batch_size: usize) -> Result<RunExit> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg("extract")
            .arg(dataset.input())
            .arg(dataset.output())
            .arg(max_items.to_string())
            .arg(batch_size.to_string())
            .arg("--progress")
            .arg(dataset.progress())
            .args(&self.extra_args)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;

        match timeout(self.limit, child.wait()).await {
            Ok(status) => {
                let status = status.context("Failed to wait for extract")?;
                if status.success() {
                    Ok(RunExit::Success)
                } else {
                    Ok(RunExit::Failed(format!("extract exited with {}", status)))
                }
            }
            Err(_) => {
                warn!(limit_secs = self.limit.as_secs(), "Extract run exceeded its time limit; killing it");
                kill_tree(&mut child).await;
                Ok(RunExit::TimedOut)
            }
        }
    }
}

/// SIGKILL the child's process group (the browser it launched included),
/// then reap the child itself.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let group = format!("-{}", pid);
        match Command::new("kill").args(["-KILL", "--", group.as_str()]).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(pid, "kill of process group exited with {}", status),
            Err(e) => warn!(pid, "Failed to kill process group: {}", e),
        }
    }
    if let Err(e) = child.kill().await {
        warn!("Failed to kill extract run: {}", e);
    }
}

// ── Run loop ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    Completed,
    Stalled,
    RunCap,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub runs: u32,
    pub total: usize,
    pub processed_before: usize,
    pub processed_after: usize,
    pub end: RunEnd,
}

/// Invoke batches until the dataset is complete, a run stalls, a run fails
/// or the invocation cap is hit. Never runs two invocations at once.
pub async fn run_dataset<L, R>(
    launcher: &mut L,
    dataset: &Dataset,
    settings: &OrchestratorSettings,
    reporter: &mut R,
) -> Result<RunSummary>
where
    L: Launcher,
    R: ProgressReporter + ?Sized,
{
    let titles = dataset.titles()?;
    let total = titles.len();
    let start = dataset.processed(&titles)?;
    let mut summary = RunSummary {
        runs: 0,
        total,
        processed_before: start,
        processed_after: start,
        end: RunEnd::Completed,
    };

    if start >= total {
        info!(total, "Dataset already complete");
        reporter.report(&ProgressSnapshot::new(
            start,
            total,
            Status::Completed,
            format!("Done: all {} videos processed", total),
        ))?;
        return Ok(summary);
    }

    let max_runs = settings.max_runs.max(1);
    let mut before = start;
    for run in 1..=max_runs {
        info!(run, max_runs, processed = before, total, "Starting extract run");
        let exit = match launcher
            .launch(dataset, settings.max_items_per_run, settings.batch_size)
            .await
        {
            Ok(exit) => exit,
            Err(e) => {
                let now = dataset.processed(&titles).unwrap_or(before);
                warn!(run, "Extract run could not complete: {:#}", e);
                let snapshot = ProgressSnapshot::new(now, total, Status::Error, format!("Run {} aborted: {:#}", run, e));
                if let Err(re) = reporter.report(&snapshot) {
                    warn!("Failed to record error in progress: {}", re);
                }
                return Err(e);
            }
        };
        let after = dataset.processed(&titles)?;
        summary.runs = run;
        summary.processed_after = after;
        info!(run, gained = after.saturating_sub(before), processed = after, total, "Extract run finished ({:?})", exit);

        if let RunExit::Failed(reason) = exit {
            warn!(run, "Extract run failed: {}", reason);
            summary.end = RunEnd::Failed;
            reporter.report(&ProgressSnapshot::new(
                after,
                total,
                Status::Error,
                format!("Run {} failed: {}", run, reason),
            ))?;
            return Ok(summary);
        }

        match decide(total, before, after, run, max_runs) {
            Decision::Completed => {
                summary.end = RunEnd::Completed;
                reporter.report(&ProgressSnapshot::new(
                    after,
                    total,
                    Status::Completed,
                    format!("Done: all {} videos processed", total),
                ))?;
                return Ok(summary);
            }
            Decision::Stalled => {
                warn!(run, "No progress in the last run; stopping");
                summary.end = RunEnd::Stalled;
                reporter.report(&ProgressSnapshot::new(
                    after,
                    total,
                    Status::Idle,
                    format!("Stalled: run {} made no progress; {} videos remaining", run, total - after),
                ))?;
                return Ok(summary);
            }
            Decision::RunCap => {
                warn!(runs = run, "Run cap reached with work remaining");
                summary.end = RunEnd::RunCap;
                reporter.report(&ProgressSnapshot::new(
                    after,
                    total,
                    Status::Idle,
                    format!("Stopped after {} runs; {} videos remaining", run, total - after),
                ))?;
                return Ok(summary);
            }
            Decision::Continue => {
                before = after;
                sleep(Duration::from_secs(settings.cooldown_secs)).await;
            }
        }
    }
    Ok(summary)
}

/// Row counts of a dataset, for `stats`.
pub fn counts(dataset: &Dataset) -> Result<(usize, usize)> {
    let titles = dataset.titles()?;
    let processed = dataset.processed(&titles)?;
    Ok((titles.len(), processed))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::MemoryReporter;
    use crate::rows::{CheckpointWriter, ExtractedRow, VideoRow};

    #[test]
    fn decision_policy() {
        assert_eq!(decide(50, 0, 15, 1, 10), Decision::Continue);
        assert_eq!(decide(50, 45, 50, 4, 10), Decision::Completed);
        assert_eq!(decide(50, 15, 15, 2, 10), Decision::Stalled);
        assert_eq!(decide(50, 15, 30, 2, 2), Decision::RunCap);
        // a finishing run wins over the cap
        assert_eq!(decide(50, 45, 50, 2, 2), Decision::Completed);
    }

    fn dataset(rows: usize) -> (tempfile::TempDir, Dataset) {
        let dir = tempfile::tempdir().unwrap();
        let mut csv = String::from("category;title;views\n");
        for i in 0..rows {
            csv.push_str(&format!("Domácí;Video {};{}\n", i, 1000 - i));
        }
        std::fs::write(dir.path().join(INPUT_FILE), csv).unwrap();
        let ds = Dataset::new(dir.path());
        (dir, ds)
    }

    /// Appends `per_run[i]` unprocessed rows on invocation `i`.
    struct FakeLauncher {
        per_run: Vec<usize>,
        exits: Vec<RunExit>,
        /// Invocation (0-based) that errors before the child runs.
        broken: Option<usize>,
        calls: usize,
    }

    impl FakeLauncher {
        fn adding(per_run: &[usize]) -> Self {
            FakeLauncher {
                per_run: per_run.to_vec(),
                exits: Vec::new(),
                broken: None,
                calls: 0,
            }
        }
    }

    impl Launcher for FakeLauncher {
        async fn launch(&mut self, dataset: &Dataset, max_items: usize, _batch_size: usize) -> Result<RunExit> {
            let n = self.per_run.get(self.calls).copied().unwrap_or(0).min(max_items);
            let exit = self.exits.get(self.calls).cloned().unwrap_or(RunExit::Success);
            if self.broken == Some(self.calls) {
                self.calls += 1;
                anyhow::bail!("Failed to spawn vidsource: No such file or directory");
            }
            self.calls += 1;

            let done = read_processed_titles(&dataset.output())?;
            let mut w = CheckpointWriter::open(&dataset.output())?;
            for row in read_clean(&dataset.input())?
                .into_iter()
                .filter(|r: &VideoRow| !done.contains(&r.title))
                .take(n)
            {
                w.append(&ExtractedRow::new(&row, None, None))?;
            }
            Ok(exit)
        }
    }

    fn settings(max_runs: u32) -> OrchestratorSettings {
        OrchestratorSettings {
            max_runs,
            max_items_per_run: 15,
            batch_size: 15,
            run_timeout_secs: 60,
            cooldown_secs: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fifty_rows_complete_on_fourth_run() {
        let (_dir, ds) = dataset(50);
        let mut launcher = FakeLauncher::adding(&[15; 10]);
        let mut reporter = MemoryReporter::default();

        let summary = run_dataset(&mut launcher, &ds, &settings(10), &mut reporter).await.unwrap();
        assert_eq!(summary.end, RunEnd::Completed);
        assert_eq!(summary.runs, 4);
        assert_eq!(summary.processed_after, 50);
        assert_eq!(launcher.calls, 4);
        assert_eq!(reporter.snapshots.last().unwrap().status, Status::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_progress_stops_the_loop() {
        let (_dir, ds) = dataset(20);
        let mut launcher = FakeLauncher::adding(&[15, 0, 5]);
        let mut reporter = MemoryReporter::default();

        let summary = run_dataset(&mut launcher, &ds, &settings(10), &mut reporter).await.unwrap();
        assert_eq!(summary.end, RunEnd::Stalled);
        assert_eq!(summary.runs, 2);
        assert_eq!(summary.processed_after, 15);
        let last = reporter.snapshots.last().unwrap();
        assert_eq!(last.status, Status::Idle);
        assert!(last.message.starts_with("Stalled"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_cap_is_honoured() {
        let (_dir, ds) = dataset(50);
        let mut launcher = FakeLauncher::adding(&[15; 10]);
        let summary = run_dataset(&mut launcher, &ds, &settings(2), &mut MemoryReporter::default())
            .await
            .unwrap();
        assert_eq!(summary.end, RunEnd::RunCap);
        assert_eq!(launcher.calls, 2);
        assert_eq!(summary.processed_after, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_marks_error() {
        let (_dir, ds) = dataset(50);
        let mut launcher = FakeLauncher::adding(&[15, 0]);
        launcher.exits = vec![RunExit::Success, RunExit::Failed("exit status: 1".into())];
        let mut reporter = MemoryReporter::default();

        let summary = run_dataset(&mut launcher, &ds, &settings(10), &mut reporter).await.unwrap();
        assert_eq!(summary.end, RunEnd::Failed);
        assert_eq!(summary.runs, 2);
        assert_eq!(reporter.snapshots.last().unwrap().status, Status::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_run_with_progress_continues() {
        let (_dir, ds) = dataset(20);
        let mut launcher = FakeLauncher::adding(&[10, 10]);
        launcher.exits = vec![RunExit::TimedOut];

        let summary = run_dataset(&mut launcher, &ds, &settings(10), &mut MemoryReporter::default())
            .await
            .unwrap();
        assert_eq!(summary.end, RunEnd::Completed);
        assert_eq!(summary.runs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn complete_dataset_launches_nothing() {
        let (_dir, ds) = dataset(3);
        let mut w = CheckpointWriter::open(&ds.output()).unwrap();
        for row in read_clean(&ds.input()).unwrap() {
            w.append(&ExtractedRow::new(&row, Some("ČTK".into()), None)).unwrap();
        }
        drop(w);

        let mut launcher = FakeLauncher::adding(&[15]);
        let summary = run_dataset(&mut launcher, &ds, &settings(10), &mut MemoryReporter::default())
            .await
            .unwrap();
        assert_eq!(summary.runs, 0);
        assert_eq!(launcher.calls, 0);
        assert_eq!(counts(&ds).unwrap(), (3, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn launch_error_marks_error_with_last_counts() {
        let (_dir, ds) = dataset(50);
        let mut launcher = FakeLauncher::adding(&[15, 15]);
        launcher.broken = Some(1);
        let mut reporter = MemoryReporter::default();

        let err = run_dataset(&mut launcher, &ds, &settings(10), &mut reporter)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
        assert_eq!(launcher.calls, 2);

        let last = reporter.snapshots.last().unwrap();
        assert_eq!(last.status, Status::Error);
        assert_eq!((last.current, last.total), (15, 50));
        assert!(last.message.starts_with("Run 2 aborted"));
    }

    #[tokio::test(start_paused = true)]
    async fn torn_output_row_is_not_counted() {
        use std::io::Write as _;

        let (_dir, ds) = dataset(5);
        let mut w = CheckpointWriter::open(&ds.output()).unwrap();
        for row in read_clean(&ds.input()).unwrap().iter().take(2) {
            w.append(&ExtractedRow::new(row, Some("ČTK".into()), None)).unwrap();
        }
        drop(w);
        let mut f = std::fs::OpenOptions::new().append(true).open(ds.output()).unwrap();
        f.write_all("Domácí;Video 2;998".as_bytes()).unwrap();
        drop(f);

        assert_eq!(counts(&ds).unwrap(), (5, 2));

        let mut launcher = FakeLauncher::adding(&[15]);
        let summary = run_dataset(&mut launcher, &ds, &settings(10), &mut MemoryReporter::default())
            .await
            .unwrap();
        assert_eq!(launcher.calls, 1);
        assert_eq!(summary.processed_before, 2);
        assert_eq!(summary.processed_after, 5);
        assert_eq!(summary.end, RunEnd::Completed);
        assert_eq!(counts(&ds).unwrap(), (5, 5));
    }

    /// Whether `pid` is gone or only a zombie left for its new parent to reap.
    #[cfg(target_os = "linux")]
    fn is_dead(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_grandchildren_too() {
        let (dir, ds) = dataset(1);
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > '{}'; wait", pid_file.display());
        let mut launcher = ChildLauncher::new("/bin/sh", Duration::from_secs(1))
            .with_leading_args(["-c", script.as_str(), "sh"]);

        let exit = launcher.launch(&ds, 1, 1).await.unwrap();
        assert_eq!(exit, RunExit::TimedOut);

        let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let mut dead = false;
        for _ in 0..20 {
            if is_dead(pid) {
                dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(dead, "sleep {} outlived its timed-out parent", pid);
    }
}
