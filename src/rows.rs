//! Input and output tables. The output file doubles as the checkpoint:
//! whatever titles it holds are done, everything else is pending.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

/// Written in place of a missing snippet or URL.
pub const NOT_FOUND: &str = "N/A";

/// Output delimiter when nothing else decides it.
const DEFAULT_DELIMITER: u8 = b';';
const TITLE_HEADERS: &[&str] = &["title", "Název článku/videa"];

// ── Row types ──

/// One video from the cleaned report.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VideoRow {
    #[serde(alias = "Jméno rubriky")]
    pub category: String,
    #[serde(alias = "Název článku/videa")]
    pub title: String,
    #[serde(alias = "Views", deserialize_with = "lenient_views")]
    pub views: u64,
    #[serde(default, alias = "Dokoukanost do 25 %", deserialize_with = "lenient_rate")]
    pub completion25: f64,
    #[serde(default, alias = "Dokoukanost do 50 %", deserialize_with = "lenient_rate")]
    pub completion50: f64,
    #[serde(default, alias = "Dokoukanost do 75 %", deserialize_with = "lenient_rate")]
    pub completion75: f64,
    #[serde(default, alias = "Dokoukanost do 100 %", deserialize_with = "lenient_rate")]
    pub completion100: f64,
}

/// One processed video. Created once per title and never touched again by
/// the pipeline; `rewrite_row` is the only way to change it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRow {
    pub category: String,
    pub title: String,
    pub views: u64,
    pub completion25: f64,
    pub completion50: f64,
    pub completion75: f64,
    pub completion100: f64,
    #[serde(rename = "sourceText")]
    pub source_text: String,
    #[serde(rename = "sourceUrl")]
    pub source_url: String,
}

impl ExtractedRow {
    pub fn new(row: &VideoRow, source_text: Option<String>, source_url: Option<String>) -> Self {
        ExtractedRow {
            category: row.category.clone(),
            title: row.title.clone(),
            views: row.views,
            completion25: row.completion25,
            completion50: row.completion50,
            completion75: row.completion75,
            completion100: row.completion100,
            source_text: source_text.unwrap_or_else(|| NOT_FOUND.to_string()),
            source_url: source_url.unwrap_or_else(|| NOT_FOUND.to_string()),
        }
    }

    pub fn has_snippet(&self) -> bool {
        self.source_text != NOT_FOUND
    }
}

fn lenient_views<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let raw = String::deserialize(d)?;
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = cleaned.replace(',', ".");
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.round() as u64)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid views value {:?}", raw)))
}

fn lenient_rate<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let raw = String::deserialize(d)?;
    let cleaned = raw.trim().trim_end_matches('%').trim().replace(',', ".");
    if cleaned.is_empty() {
        return Ok(0.0);
    }
    Ok(cleaned.parse::<f64>().unwrap_or(0.0))
}

// ── Input ──

/// Pick the delimiter that splits the header line into the most columns.
pub fn sniff_delimiter(header: &str) -> u8 {
    [b';', b',', b'\t']
        .into_iter()
        .max_by_key(|d| header.bytes().filter(|b| b == d).count())
        .filter(|d| header.as_bytes().contains(d))
        .unwrap_or(b',')
}

fn first_line(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut line = String::new();
    BufReader::new(file).read_line(&mut line)?;
    Ok(line)
}

/// Read the cleaned input table in file order.
///
/// Malformed rows and rows without a title are skipped with a warning.
/// Duplicate titles are kept but reported, since titles are the join key
/// against the output file.
pub fn read_clean(path: &Path) -> Result<Vec<VideoRow>> {
    let header = first_line(path)?;
    let delimiter = sniff_delimiter(&header);

    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open input {}", path.display()))?;

    let headers = rdr.headers()?.clone();
    if !headers.iter().any(|h| TITLE_HEADERS.contains(&h)) {
        bail!(
            "Input {} has no title column (found: {})",
            path.display(),
            headers.iter().collect::<Vec<_>>().join(", ")
        );
    }

    let mut rows = Vec::new();
    let mut seen = HashSet::new();
    for (i, result) in rdr.deserialize::<VideoRow>().enumerate() {
        let line = i + 2;
        let row = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(line, "Skipping malformed input row: {}", e);
                continue;
            }
        };
        if row.title.is_empty() {
            warn!(line, "Skipping input row without a title");
            continue;
        }
        if !seen.insert(row.title.clone()) {
            warn!(line, title = %row.title, "Duplicate title in input; rows will share one checkpoint key");
        }
        rows.push(row);
    }
    Ok(rows)
}

// ── Output / checkpoint ──

fn first_line_of(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == b'\n').unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Length of `bytes` up to the end of the last complete record.
///
/// A record is complete when it ends in a newline and has as many fields as
/// the header. A crash mid-append leaves a tail that fails one of the two,
/// including a quoted title cut right after an embedded newline.
fn complete_len(bytes: &[u8]) -> usize {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(&first_line_of(bytes)))
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut record = csv::ByteRecord::new();
    let mut header_width = None;
    let mut keep = 0;
    while let Ok(true) = rdr.read_byte_record(&mut record) {
        let end = rdr.position().byte() as usize;
        let terminated = end > 0 && bytes.get(end - 1) == Some(&b'\n');
        let expected = *header_width.get_or_insert(record.len());
        if terminated && record.len() == expected {
            keep = end;
        }
    }
    keep
}

/// Output bytes without a torn trailing record, or `None` when the file
/// does not exist yet.
fn load_output(path: &Path) -> Result<Option<Vec<u8>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut bytes = fs::read(path).with_context(|| format!("Failed to read output {}", path.display()))?;
    let keep = complete_len(&bytes);
    if keep < bytes.len() {
        debug!(path = %path.display(), dropped = bytes.len() - keep, "Ignoring incomplete trailing record");
        bytes.truncate(keep);
    }
    Ok(Some(bytes))
}

fn output_reader(bytes: &[u8]) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(&first_line_of(bytes)))
        .flexible(true)
        .from_reader(bytes)
}

/// Delimiter of the input table, which the output mirrors.
pub fn input_delimiter(path: &Path) -> Result<u8> {
    Ok(sniff_delimiter(&first_line(path)?))
}

/// Titles already present in the output file. A missing file means nothing
/// has been processed yet. This is a full linear scan on every call.
pub fn read_processed_titles(path: &Path) -> Result<HashSet<String>> {
    let Some(bytes) = load_output(path)? else {
        return Ok(HashSet::new());
    };
    let mut rdr = output_reader(&bytes);
    let Some(title_idx) = rdr.headers()?.iter().position(|h| h == "title") else {
        return Ok(HashSet::new());
    };

    let mut titles = HashSet::new();
    for record in rdr.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping unreadable output row: {}", e);
                continue;
            }
        };
        if let Some(title) = record.get(title_idx) {
            titles.insert(title.to_string());
        }
    }
    Ok(titles)
}

/// Every well-formed row of the output file, in file order.
pub fn read_extracted(path: &Path) -> Result<Vec<ExtractedRow>> {
    let Some(bytes) = load_output(path)? else {
        return Ok(Vec::new());
    };
    let mut rows = Vec::new();
    for result in output_reader(&bytes).deserialize::<ExtractedRow>() {
        match result {
            Ok(r) => rows.push(r),
            Err(e) => warn!("Skipping unreadable output row: {}", e),
        }
    }
    Ok(rows)
}

/// Number of complete data rows in the output file (0 when it does not exist).
pub fn count_extracted(path: &Path) -> Result<usize> {
    let Some(bytes) = load_output(path)? else {
        return Ok(0);
    };
    Ok(output_reader(&bytes).records().filter(|r| r.is_ok()).count())
}

/// Cut a trailing partial record left by a crash mid-write, so the file
/// ends on a complete record. Returns the number of bytes dropped.
fn repair_torn_tail(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let keep = complete_len(&bytes);
    if keep == bytes.len() {
        return Ok(0);
    }
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_all()?;
    let dropped = (bytes.len() - keep) as u64;
    warn!(path = %path.display(), dropped, "Dropped torn trailing record from checkpoint");
    Ok(dropped)
}

/// Append-only writer for the output file. Each row is flushed and synced
/// before `append` returns, so a crash after row k keeps rows 1..k.
pub struct CheckpointWriter {
    writer: csv::Writer<File>,
}

impl CheckpointWriter {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_delimited(path, DEFAULT_DELIMITER)
    }

    /// Open for append, writing new files with `delimiter`. An existing
    /// file keeps the delimiter its header was written with.
    pub fn open_delimited(path: &Path, delimiter: u8) -> Result<Self> {
        repair_torn_tail(path)?;
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let delimiter = if size == 0 {
            delimiter
        } else {
            sniff_delimiter(&first_line(path)?)
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open checkpoint {}", path.display()))?;
        let writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .has_headers(size == 0)
            .from_writer(file);
        Ok(CheckpointWriter { writer })
    }

    /// Open for append and return the titles the file already holds. The
    /// torn tail is repaired before the scan, so a half-written row is
    /// pending again rather than counted as done.
    pub fn resume(path: &Path, delimiter: u8) -> Result<(Self, HashSet<String>)> {
        let writer = Self::open_delimited(path, delimiter)?;
        let done = read_processed_titles(path)?;
        Ok((writer, done))
    }

    pub fn append(&mut self, row: &ExtractedRow) -> Result<()> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

/// Replace `path` with `contents` via a sibling temp file and rename.
pub fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Manually correct every output row whose title matches. Fields left as
/// `None` are kept. Returns the number of rows changed.
pub fn rewrite_row(
    path: &Path,
    title: &str,
    source_text: Option<&str>,
    source_url: Option<&str>,
) -> Result<usize> {
    let mut rows = read_extracted(path)?;
    let mut changed = 0;
    for row in rows.iter_mut().filter(|r| r.title == title) {
        if let Some(t) = source_text {
            row.source_text = t.to_string();
        }
        if let Some(u) = source_url {
            row.source_url = u.to_string();
        }
        changed += 1;
    }
    if changed == 0 {
        return Ok(0);
    }

    let mut w = csv::WriterBuilder::new()
        .delimiter(sniff_delimiter(&first_line(path)?))
        .from_writer(Vec::new());
    for row in &rows {
        w.serialize(row)?;
    }
    let buf = w.into_inner().map_err(|e| anyhow::anyhow!("{}", e))?;
    replace_file(path, &buf)?;
    Ok(changed)
}

// ── Tests ──
