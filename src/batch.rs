use std::collections::HashSet;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::time::sleep;
use tracing::info;

use crate::processor::{ItemProcessor, Outcome};
use crate::progress::{ProgressReporter, ProgressSnapshot, Status};
use crate::rows::{CheckpointWriter, ExtractedRow, VideoRow};
use crate::site::SourceSite;

/// Where finished rows go. Must persist each row before returning.
pub trait RowSink {
    fn append(&mut self, row: &ExtractedRow) -> Result<()>;
}

impl RowSink for CheckpointWriter {
    fn append(&mut self, row: &ExtractedRow) -> Result<()> {
        CheckpointWriter::append(self, row)
    }
}

impl RowSink for Vec<ExtractedRow> {
    fn append(&mut self, row: &ExtractedRow) -> Result<()> {
        self.push(row.clone());
        Ok(())
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEnd {
    /// No pending rows left.
    Completed,
    /// Item budget used up, rows remain for the next invocation.
    Exhausted,
    /// Rows are pending but none were processed.
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStats {
    pub processed: usize,
    pub found: usize,
    pub not_found: usize,
    pub blocked: usize,
    pub failed: usize,
    pub remaining: usize,
    pub end: BatchEnd,
}

impl BatchStats {
    fn new() -> Self {
        BatchStats {
            processed: 0,
            found: 0,
            not_found: 0,
            blocked: 0,
            failed: 0,
            remaining: 0,
            end: BatchEnd::Stalled,
        }
    }

    fn record(&mut self, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Found => self.found += 1,
            Outcome::NoMatch | Outcome::MissingSnippet => self.not_found += 1,
            Outcome::Blocked => self.blocked += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

/// Rows whose title is not in the output yet, in input order.
pub fn pending_rows<'a>(rows: &'a [VideoRow], processed: &HashSet<String>) -> Vec<&'a VideoRow> {
    rows.iter().filter(|r| !processed.contains(&r.title)).collect()
}

/// Batch size and item budget for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    /// `None` processes every pending row.
    pub max_items: Option<usize>,
    /// Rows per internal chunk; a cooldown separates chunks.
    pub chunk_size: usize,
}

/// Process up to `max_items` pending rows, appending each result to `sink`
/// before starting the next one and reporting progress after every row.
///
/// Only sink and reporter failures abort the batch; item-level problems end
/// up as `N/A` rows.
pub async fn run_batch<S, W, R>(
    processor: &mut ItemProcessor<S>,
    rows: &[VideoRow],
    processed: &HashSet<String>,
    limits: BatchLimits,
    sink: &mut W,
    reporter: &mut R,
) -> Result<BatchStats>
where
    S: SourceSite,
    W: RowSink + ?Sized,
    R: ProgressReporter + ?Sized,
{
    let total = rows.len();
    let pending = pending_rows(rows, processed);
    let mut current = total - pending.len();
    let take = limits.max_items.unwrap_or(pending.len()).min(pending.len());
    let mut stats = BatchStats::new();

    info!(total, done = current, pending = pending.len(), take, "Starting batch");
    reporter.report(&ProgressSnapshot::new(
        current,
        total,
        Status::Processing,
        format!("Processing {} of {} pending videos", take, pending.len()),
    ))?;

    if pending.is_empty() {
        stats.end = BatchEnd::Completed;
        reporter.report(&ProgressSnapshot::new(
            current,
            total,
            Status::Completed,
            format!("Done: all {} videos processed", total),
        ))?;
        return Ok(stats);
    }
    if take == 0 {
        stats.remaining = pending.len();
        reporter.report(&ProgressSnapshot::new(
            current,
            total,
            Status::Idle,
            "No videos processed in this run",
        ))?;
        return Ok(stats);
    }

    let pb = ProgressBar::new(take as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("#>-"),
    );

    let chunk = limits.chunk_size.max(1);
    let chunks = take.div_ceil(chunk);

    for (i, row) in pending.iter().take(take).enumerate() {
        if i > 0 && i % chunk == 0 {
            let pause = processor.throttle().batch_pause();
            reporter.report(&ProgressSnapshot::new(
                current,
                total,
                Status::Processing,
                format!("Finished chunk {}/{}; pausing {:.0}s", i / chunk, chunks, pause.as_secs_f64()),
            ))?;
            sleep(pause).await;
        }

        let result = processor.process(row).await;
        sink.append(&result.row)?;
        stats.record(result.outcome);
        current += 1;

        reporter.report(&ProgressSnapshot::new(
            current,
            total,
            Status::Processing,
            format!("Processed {} of {} videos", current, total),
        ))?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    stats.remaining = pending.len() - take;
    let snapshot = if stats.remaining == 0 {
        stats.end = BatchEnd::Completed;
        ProgressSnapshot::new(current, total, Status::Completed, format!("Done: all {} videos processed", total))
    } else {
        stats.end = BatchEnd::Exhausted;
        ProgressSnapshot::new(
            current,
            total,
            Status::Idle,
            format!("Run finished; {} videos remaining", stats.remaining),
        )
    };
    reporter.report(&snapshot)?;

    info!(
        processed = stats.processed,
        found = stats.found,
        not_found = stats.not_found,
        blocked = stats.blocked,
        failed = stats.failed,
        remaining = stats.remaining,
        "Batch finished ({:?})",
        stats.end
    );
    Ok(stats)
}

// ── Tests ──
