use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::rows::replace_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Idle,
    Processing,
    Completed,
    Error,
}

/// Current position of a dataset's extraction. A single overwritten value,
/// not a log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub current: usize,
    pub total: usize,
    pub status: Status,
    pub message: String,
    pub percentage: u8,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(current: usize, total: usize, status: Status, message: impl Into<String>) -> Self {
        ProgressSnapshot {
            current,
            total,
            status,
            message: message.into(),
            percentage: percentage(current, total),
            updated_at: Utc::now(),
        }
    }
}

/// round(current / total * 100), clamped to 0..=100. Empty datasets read as 0.
pub fn percentage(current: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (current as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Where progress snapshots go. The batch runner only decides *when* a
/// snapshot changes; implementations decide how it is persisted.
pub trait ProgressReporter {
    fn report(&mut self, snapshot: &ProgressSnapshot) -> Result<()>;
}

/// Overwrites a JSON file with each snapshot (temp file + rename).
pub struct JsonFileReporter {
    path: PathBuf,
}

impl JsonFileReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileReporter { path: path.into() }
    }
}

impl ProgressReporter for JsonFileReporter {
    fn report(&mut self, snapshot: &ProgressSnapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        replace_file(&self.path, &json)
            .with_context(|| format!("Failed to write progress to {}", self.path.display()))
    }
}

/// One JSON object per line on stdout, for parent processes to parse.
pub struct StdoutReporter;

impl ProgressReporter for StdoutReporter {
    fn report(&mut self, snapshot: &ProgressSnapshot) -> Result<()> {
        let line = serde_json::to_string(snapshot)?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

/// Keeps every snapshot in memory.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryReporter {
    pub snapshots: Vec<ProgressSnapshot>,
}

#[cfg(test)]
impl ProgressReporter for MemoryReporter {
    fn report(&mut self, snapshot: &ProgressSnapshot) -> Result<()> {
        self.snapshots.push(snapshot.clone());
        Ok(())
    }
}

/// Fan-out to several reporters.
#[derive(Default)]
pub struct Reporters(pub Vec<Box<dyn ProgressReporter>>);

impl ProgressReporter for Reporters {
    fn report(&mut self, snapshot: &ProgressSnapshot) -> Result<()> {
        for r in &mut self.0 {
            r.report(snapshot)?;
        }
        Ok(())
    }
}

/// Last snapshot written to `path`, if any.
pub fn read_snapshot(path: &Path) -> Result<Option<ProgressSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Some(serde_json::from_str(&text)?))
}

/// Leave the progress cell at `error` after an infrastructure failure,
/// keeping the counts of the last snapshot in `last` when there is one.
pub fn report_failure<R: ProgressReporter + ?Sized>(reporter: &mut R, last: Option<&Path>, err: &anyhow::Error) {
    let (current, total) = last
        .and_then(|p| read_snapshot(p).ok().flatten())
        .map(|s| (s.current, s.total))
        .unwrap_or((0, 0));
    let snapshot = ProgressSnapshot::new(current, total, Status::Error, format!("{:#}", err));
    if let Err(e) = reporter.report(&snapshot) {
        warn!("Failed to record error in progress: {}", e);
    }
}
