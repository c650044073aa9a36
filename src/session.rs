use crate::archive::{write_downloads_archive, ArchiveSummary};
use crate::batch::{
    load_batch_csv, process_batch, write_batch_csv, BatchCursor, BatchOutcome, BatchTable,
};
use crate::extract::Extractor;
use crate::logging::{LogCapture, LogLevel};
use crate::pipeline::{DownloadRequest, Pipeline};
use crate::timecode::parse_timecode;
use crate::trim::Trimmer;
use crate::{EngineError, Result};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const MSG_URL_REQUIRED: &str = "Please enter a video URL.";
const MSG_DOWNLOAD_FAILED: &str = "Download failed. Check the log output for details.";

/// Inputs of the single-download form.
#[derive(Debug, Clone, Default)]
pub struct SingleForm {
    pub url: String,
    pub filename: String,
    pub username: String,
    pub password: String,
    pub clip_start: String,
    pub clip_end: String,
    pub audio_only: bool,
    /// Raw bytes of an uploaded cookies.txt.
    pub cookies: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SingleResult {
    pub path: Option<PathBuf>,
    pub mime: Option<&'static str>,
    pub log_output: String,
    pub error: Option<String>,
}

pub struct BatchSession {
    pub table: BatchTable,
    pub cursor: BatchCursor,
    pub last_outcome: Option<BatchOutcome>,
    pub log_output: String,
    // Written to a fresh temp file for each chunk.
    cookies: Option<Vec<u8>>,
}

impl BatchSession {
    pub fn is_finished(&self) -> bool {
        self.cursor.next_row >= self.table.len()
    }
}

/// Per-user state of the presentation shell. Each handler takes the session
/// explicitly; nothing is kept in globals.
pub struct Session<E, T> {
    pipeline: Pipeline<E, T>,
    log_level: LogLevel,
    pub last_single: Option<SingleResult>,
    pub batch: Option<BatchSession>,
}

impl<E: Extractor, T: Trimmer> Session<E, T> {
    pub fn new(pipeline: Pipeline<E, T>, log_level: LogLevel) -> Self {
        Self {
            pipeline,
            log_level,
            last_single: None,
            batch: None,
        }
    }

    pub fn pipeline(&self) -> &Pipeline<E, T> {
        &self.pipeline
    }

    pub fn submit_single(&mut self, form: &SingleForm) -> &SingleResult {
        let result = self.run_single(form);
        self.last_single.insert(result)
    }

    fn run_single(&self, form: &SingleForm) -> SingleResult {
        let url = form.url.trim();
        if url.is_empty() {
            return SingleResult {
                error: Some(MSG_URL_REQUIRED.to_string()),
                ..SingleResult::default()
            };
        }

        let (start, end) = match (parse_timecode(&form.clip_start), parse_timecode(&form.clip_end)) {
            (Ok(start), Ok(end)) => (start, end),
            (Err(err), _) | (_, Err(err)) => {
                return SingleResult {
                    error: Some(err.to_string()),
                    ..SingleResult::default()
                };
            }
        };

        // Dropped (and deleted) when this function returns.
        let cookie_file = match form.cookies.as_deref().map(write_temp_cookies).transpose() {
            Ok(file) => file,
            Err(err) => {
                return SingleResult {
                    error: Some(format!("could not store the uploaded cookie file: {err}")),
                    ..SingleResult::default()
                };
            }
        };

        let request = DownloadRequest::new(url, self.pipeline.settings().output_dir.clone())
            .filename(Some(form.filename.clone()))
            .cookies(cookie_file.as_ref().map(|f| f.path().to_path_buf()))
            .credentials(Some(form.username.clone()), Some(form.password.clone()))
            .clip(start, end)
            .audio_only(form.audio_only);

        let capture = LogCapture::new();
        let path = capture.scope(self.log_level, || self.pipeline.download_video(&request));
        let log_output = capture.contents();

        match path {
            Some(path) => SingleResult {
                mime: Some(mime_for_path(&path)),
                path: Some(path),
                log_output,
                error: None,
            },
            None => SingleResult {
                path: None,
                mime: None,
                log_output,
                error: Some(MSG_DOWNLOAD_FAILED.to_string()),
            },
        }
    }

    /// Loads a new batch, replacing any batch in progress, and runs the first
    /// chunk.
    pub fn submit_batch(
        &mut self,
        csv_bytes: &[u8],
        cookie_bytes: Option<&[u8]>,
        pause_after: usize,
        skip_completed: bool,
    ) -> Result<BatchOutcome> {
        let table = load_batch_csv(csv_bytes, &self.pipeline.settings().batch_columns)?;
        let cookies = cookie_bytes.map(<[u8]>::to_vec);
        self.batch = Some(BatchSession {
            table,
            cursor: BatchCursor {
                next_row: 0,
                pause_after,
                skip_completed,
            },
            last_outcome: None,
            log_output: String::new(),
            cookies,
        });
        self.resume_batch()
    }

    /// Runs the next chunk of the batch in progress. An uploaded cookie file
    /// exists on disk only while the chunk runs.
    pub fn resume_batch(&mut self) -> Result<BatchOutcome> {
        let batch = self
            .batch
            .as_mut()
            .ok_or_else(|| EngineError::validation("no batch is in progress"))?;

        let cookie_file = batch.cookies.as_deref().map(write_temp_cookies).transpose()?;
        let cookies = cookie_file.as_ref().map(|f| f.path().to_path_buf());
        let capture = LogCapture::new();
        let pipeline = &self.pipeline;
        let outcome = capture.scope(self.log_level, || {
            process_batch(&mut batch.table, batch.cursor, pipeline, cookies.as_deref())
        });
        drop(cookie_file);

        batch.cursor = outcome.cursor;
        batch.log_output = capture.contents();
        batch.last_outcome = Some(outcome.clone());
        Ok(outcome)
    }

    /// The batch CSV with bookkeeping columns, if a batch was submitted.
    pub fn batch_csv(&self) -> Result<Option<Vec<u8>>> {
        self.batch
            .as_ref()
            .map(|batch| write_batch_csv(&batch.table))
            .transpose()
    }

    pub fn batch_archive(&self, out_path: &Path) -> Result<Option<ArchiveSummary>> {
        self.batch
            .as_ref()
            .map(|batch| write_downloads_archive(&batch.table.rows, out_path))
            .transpose()
    }

    pub fn clear_batch(&mut self) {
        self.batch = None;
    }
}

fn write_temp_cookies(bytes: &[u8]) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("vidfetch-cookies-")
        .suffix(".txt")
        .tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}
