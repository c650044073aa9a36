use crate::config::BatchColumnNames;
use crate::extract::Extractor;
use crate::logging::redact_url_for_log;
use crate::pipeline::{ClipPolicy, DownloadRequest, Pipeline};
use crate::timecode::{parse_timecode, ClipRange};
use crate::trim::Trimmer;
use crate::{EngineError, Result};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const URL_HEADERS: &[&str] = &["url", "link", "links"];
const FILENAME_HEADERS: &[&str] = &["file name", "filename", "file_name", "name"];
const START_HEADERS: &[&str] = &["clip start time", "start", "start time", "clip start"];
const END_HEADERS: &[&str] = &["clip end time", "end", "end time", "clip end"];
const TYPE_HEADERS: &[&str] = &["download type", "type", "media type"];
const SKIP_HEADERS: &[&str] = &["skip"];
const SKIP_TRUTHY: &[&str] = &["1", "true", "yes", "skip"];

pub const DETAIL_ALREADY_DOWNLOADED: &str = "Already marked as downloaded.";
pub const DETAIL_MARKED_SKIP: &str = "Marked to skip.";
pub const DETAIL_MISSING_URL: &str = "Missing URL value.";
pub const DETAIL_DOWNLOAD_FAILED: &str = "Download failed.";
const NO_FFMPEG_FOR_CLIP: &str = "clipping was requested but ffmpeg is not available";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    Downloaded,
    Failed,
    Skipped,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Pending => "pending",
            RowStatus::Downloaded => "downloaded",
            RowStatus::Failed => "failed",
            RowStatus::Skipped => "skipped",
        }
    }

    /// Lenient reader for the status column of a previously written CSV.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "downloaded" | "success" | "succeeded" => RowStatus::Downloaded,
            "failed" => RowStatus::Failed,
            "skipped" => RowStatus::Skipped,
            _ => RowStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ColumnMap {
    url: usize,
    filename: Option<usize>,
    start: Option<usize>,
    end: Option<usize>,
    media_type: Option<usize>,
    skip: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    /// 1-based position among the data rows.
    pub index: usize,
    /// Input cells, aligned with `BatchTable::headers`.
    pub values: Vec<String>,
    pub status: RowStatus,
    pub detail: String,
    pub output_path: Option<PathBuf>,
    pub processed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BatchTable {
    /// Input headers with any earlier bookkeeping columns removed.
    pub headers: Vec<String>,
    pub rows: Vec<BatchRow>,
    columns: ColumnMap,
    names: BatchColumnNames,
}

fn normalize_header(value: &str) -> String {
    value.trim().trim_start_matches('\u{feff}').trim().to_ascii_lowercase()
}

fn find_column(headers: &[String], variants: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| variants.contains(&normalize_header(h).as_str()))
}

/// UTF-8 (BOM stripped) when valid, otherwise Windows-1252.
fn decode_csv_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => encoding_rs::WINDOWS_1252
            .decode_without_bom_handling(bytes)
            .0
            .into_owned(),
    }
}

pub fn load_batch_csv(bytes: &[u8], names: &BatchColumnNames) -> Result<BatchTable> {
    if bytes.is_empty() {
        return Err(EngineError::validation("uploaded CSV file is empty"));
    }
    let text = decode_csv_bytes(bytes);
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let raw_headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
    if raw_headers.iter().all(|h| h.trim().is_empty()) {
        return Err(EngineError::validation(
            "CSV file has no header row to identify columns",
        ));
    }

    let bookkeeping: Vec<Option<usize>> = names
        .as_array()
        .iter()
        .map(|name| {
            let wanted = normalize_header(name);
            raw_headers.iter().position(|h| normalize_header(h) == wanted)
        })
        .collect();
    let keep: Vec<usize> = (0..raw_headers.len())
        .filter(|i| !bookkeeping.contains(&Some(*i)))
        .collect();
    let headers: Vec<String> = keep.iter().map(|&i| raw_headers[i].clone()).collect();

    let url = find_column(&headers, URL_HEADERS).ok_or_else(|| {
        EngineError::validation("no column named URL, Link, or Links was found in the CSV header")
    })?;
    let columns = ColumnMap {
        url,
        filename: find_column(&headers, FILENAME_HEADERS),
        start: find_column(&headers, START_HEADERS),
        end: find_column(&headers, END_HEADERS),
        media_type: find_column(&headers, TYPE_HEADERS),
        skip: find_column(&headers, SKIP_HEADERS),
    };

    let mut rows = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record?;
        let cell = |idx: Option<usize>| -> String {
            idx.and_then(|idx| record.get(idx))
                .unwrap_or_default()
                .to_string()
        };
        let values: Vec<String> = keep.iter().map(|&idx| cell(Some(idx))).collect();
        let status = RowStatus::parse(&cell(bookkeeping[0]));
        let detail = cell(bookkeeping[1]);
        let output_path = Some(cell(bookkeeping[2]))
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let processed_at = Some(cell(bookkeeping[3])).filter(|v| !v.trim().is_empty());

        rows.push(BatchRow {
            index: i + 1,
            values,
            status,
            detail,
            output_path,
            processed_at,
        });
    }

    if rows.is_empty() {
        return Err(EngineError::validation("CSV did not contain any data rows"));
    }

    Ok(BatchTable {
        headers,
        rows,
        columns,
        names: names.clone(),
    })
}

impl BatchTable {
    fn value(&self, row: &BatchRow, column: Option<usize>) -> String {
        column
            .and_then(|idx| row.values.get(idx))
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    }

    pub fn url(&self, row: &BatchRow) -> String {
        self.value(row, Some(self.columns.url))
    }

    pub fn filename(&self, row: &BatchRow) -> Option<String> {
        Some(self.value(row, self.columns.filename)).filter(|v| !v.is_empty())
    }

    pub fn clip_text(&self, row: &BatchRow) -> (String, String) {
        (
            self.value(row, self.columns.start),
            self.value(row, self.columns.end),
        )
    }

    pub fn audio_only(&self, row: &BatchRow) -> bool {
        self.value(row, self.columns.media_type).eq_ignore_ascii_case("audio")
    }

    pub fn skip_flag(&self, row: &BatchRow) -> bool {
        let value = self.value(row, self.columns.skip).to_ascii_lowercase();
        SKIP_TRUTHY.contains(&value.as_str())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchCursor {
    /// 0-based index of the next row to process.
    pub next_row: usize,
    /// Rows per call; 0 processes everything that is left.
    pub pause_after: usize,
    pub skip_completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BatchCounts {
    pub downloaded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowResult {
    pub row: usize,
    pub url: String,
    pub status: RowStatus,
    pub detail: String,
    pub start: String,
    pub end: String,
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub cursor: BatchCursor,
    pub processed: usize,
    pub remaining: usize,
    pub paused: bool,
    pub counts: BatchCounts,
    pub results: Vec<RowResult>,
}

/// What processing one row decided.
enum RowDecision {
    /// Reported as skipped; the stored download is left untouched.
    AlreadyDownloaded,
    Record {
        status: RowStatus,
        detail: String,
        output_path: Option<PathBuf>,
    },
}

pub fn now_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Processes rows from `cursor.next_row` until `cursor.pause_after` rows have
/// been handled in this call or the table is exhausted. Row failures are
/// recorded on the row and never abort the remaining rows.
pub fn process_batch<E: Extractor, T: Trimmer>(
    table: &mut BatchTable,
    cursor: BatchCursor,
    pipeline: &Pipeline<E, T>,
    cookies: Option<&Path>,
) -> BatchOutcome {
    let total = table.len();
    let mut next = cursor;
    let mut counts = BatchCounts::default();
    let mut results = Vec::new();
    let mut processed = 0_usize;

    while next.next_row < total {
        if cursor.pause_after > 0 && processed >= cursor.pause_after {
            break;
        }
        let idx = next.next_row;
        let decision = process_row(table, idx, cursor.skip_completed, pipeline, cookies);
        let (status, detail) = match &decision {
            RowDecision::AlreadyDownloaded => {
                (RowStatus::Skipped, DETAIL_ALREADY_DOWNLOADED.to_string())
            }
            RowDecision::Record { status, detail, .. } => (*status, detail.clone()),
        };

        let row_snapshot = table.rows[idx].clone();
        let (start, end) = table.clip_text(&row_snapshot);
        let media_type = if table.audio_only(&row_snapshot) { "audio" } else { "video" };
        results.push(RowResult {
            row: row_snapshot.index,
            url: table.url(&row_snapshot),
            status,
            detail,
            start,
            end,
            media_type: media_type.to_string(),
        });

        let row = &mut table.rows[idx];
        if let RowDecision::Record {
            status,
            detail,
            output_path,
        } = decision
        {
            row.status = status;
            row.detail = detail;
            row.output_path = output_path;
        }
        row.processed_at = Some(now_timestamp());

        match status {
            RowStatus::Downloaded => counts.downloaded += 1,
            RowStatus::Failed => counts.failed += 1,
            RowStatus::Skipped => counts.skipped += 1,
            RowStatus::Pending => {}
        }
        processed += 1;
        next.next_row += 1;
        tracing::info!("processed {}/{}", next.next_row, total);
    }

    let remaining = total.saturating_sub(next.next_row);
    BatchOutcome {
        cursor: next,
        processed,
        remaining,
        paused: remaining > 0,
        counts,
        results,
    }
}

fn process_row<E: Extractor, T: Trimmer>(
    table: &BatchTable,
    idx: usize,
    skip_completed: bool,
    pipeline: &Pipeline<E, T>,
    cookies: Option<&Path>,
) -> RowDecision {
    let row = &table.rows[idx];
    let has_path = row
        .output_path
        .as_ref()
        .is_some_and(|p| !p.as_os_str().is_empty());

    if skip_completed && row.status == RowStatus::Downloaded && has_path {
        tracing::info!(row = row.index, "already downloaded; skipping");
        return RowDecision::AlreadyDownloaded;
    }
    if table.skip_flag(row) {
        tracing::info!(row = row.index, "row marked to skip");
        return record(RowStatus::Skipped, DETAIL_MARKED_SKIP, None);
    }

    let url = table.url(row);
    if url.is_empty() {
        tracing::warn!(row = row.index, "row has an empty URL; skipping");
        return record(RowStatus::Skipped, DETAIL_MISSING_URL, None);
    }

    let audio_only = table.audio_only(row);
    let (start_text, end_text) = table.clip_text(row);
    let mut problems: Vec<String> = Vec::new();
    let start = parse_timecode(&start_text).unwrap_or_else(|e| {
        problems.push(format!("clip start: {e}"));
        None
    });
    let end = parse_timecode(&end_text).unwrap_or_else(|e| {
        problems.push(format!("clip end: {e}"));
        None
    });
    problems.extend(ClipRange::validate_all(start, end).into_iter().map(str::to_string));
    let wants_ffmpeg = start.is_some() || end.is_some() || audio_only;
    if wants_ffmpeg && !pipeline.trim_available() {
        problems.push(NO_FFMPEG_FOR_CLIP.to_string());
    }
    if !problems.is_empty() {
        let detail = problems.join("; ");
        tracing::warn!(row = row.index, "invalid clip settings: {detail}");
        return record(RowStatus::Failed, detail, None);
    }

    let request = DownloadRequest::new(url.clone(), pipeline.settings().output_dir.clone())
        .filename(table.filename(row))
        .cookies(cookies.map(Path::to_path_buf))
        .clip(start, end)
        .audio_only(audio_only);

    match pipeline.attempt_download(&request, ClipPolicy::Require) {
        Ok(path) => {
            let path = std::fs::canonicalize(&path).unwrap_or(path);
            let detail = path.to_string_lossy().to_string();
            record(RowStatus::Downloaded, detail, Some(path))
        }
        Err(err) => {
            tracing::error!(
                row = row.index,
                kind = err.kind().as_str(),
                url = %redact_url_for_log(&url),
                "row download failed: {err}"
            );
            record(RowStatus::Failed, DETAIL_DOWNLOAD_FAILED, None)
        }
    }
}

fn record(status: RowStatus, detail: impl Into<String>, output_path: Option<PathBuf>) -> RowDecision {
    RowDecision::Record {
        status,
        detail: detail.into(),
        output_path,
    }
}

/// The table as CSV: input columns in their original order followed by the
/// four bookkeeping columns.
pub fn write_batch_csv(table: &BatchTable) -> Result<Vec<u8>> {
    let mut wtr = WriterBuilder::new().from_writer(Vec::new());

    let mut header: Vec<&str> = table.headers.iter().map(String::as_str).collect();
    header.extend(table.names.as_array());
    wtr.write_record(&header)?;

    for row in &table.rows {
        let mut record: Vec<String> = table
            .headers
            .iter()
            .enumerate()
            .map(|(i, _)| row.values.get(i).cloned().unwrap_or_default())
            .collect();
        record.push(row.status.as_str().to_string());
        record.push(row.detail.clone());
        record.push(
            row.output_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
        );
        record.push(row.processed_at.clone().unwrap_or_default());
        wtr.write_record(&record)?;
    }

    wtr.into_inner().map_err(|e| EngineError::Io(e.into_error()))
}

/// Cursor sidecar that lets the command-line batch resume across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub source: String,
    pub row_count: usize,
    pub cursor: BatchCursor,
    pub updated_at: String,
}

impl BatchState {
    /// The stored cursor position, if it was saved for this same row set.
    pub fn resume_position(&self, source: &str, row_count: usize) -> Option<usize> {
        if self.source == source && self.row_count == row_count && self.cursor.next_row <= row_count {
            Some(self.cursor.next_row)
        } else {
            None
        }
    }
}

pub fn load_batch_state(path: &Path) -> Result<Option<BatchState>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    let state: BatchState = serde_json::from_slice(&bytes)?;
    Ok(Some(state))
}

pub fn save_batch_state(path: &Path, state: &BatchState) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(state)?;
    std::fs::write(&tmp_path, format!("{json}\n"))?;
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
