use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_OUTPUT_DIR: &str = "downloads";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_FALLBACK_RETRIES: u32 = 10;
pub const DEFAULT_FALLBACK_HTTP_CHUNK_SIZE: &str = "10M";
pub const DEFAULT_MERGE_OUTPUT_FORMAT: &str = "mp4";
pub const DEFAULT_MERGED_FORMAT: &str = "bv*+ba/b";
pub const DEFAULT_SINGLE_FORMAT: &str = "b";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchColumnNames {
    pub status: String,
    pub detail: String,
    pub path: String,
    pub processed_at: String,
}

impl Default for BatchColumnNames {
    fn default() -> Self {
        Self {
            status: "Download Status".to_string(),
            detail: "Download Detail".to_string(),
            path: "Download Path".to_string(),
            processed_at: "Processed At".to_string(),
        }
    }
}

impl BatchColumnNames {
    pub fn as_array(&self) -> [&str; 4] {
        [
            self.status.as_str(),
            self.detail.as_str(),
            self.path.as_str(),
            self.processed_at.as_str(),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub output_dir: PathBuf,
    pub user_agent: String,
    /// Whole-item and fragment-level retry count for the initial attempt.
    pub retries: u32,
    pub fallback_retries: u32,
    pub fallback_http_chunk_size: String,
    pub merge_output_format: String,
    /// Format selector used when ffmpeg is present to merge streams.
    pub merged_format: String,
    /// Format selector used in degraded mode (no ffmpeg).
    pub single_format: String,
    pub headers: BTreeMap<String, String>,
    pub ytdlp_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub batch_columns: BatchColumnNames,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retries: DEFAULT_RETRIES,
            fallback_retries: DEFAULT_FALLBACK_RETRIES,
            fallback_http_chunk_size: DEFAULT_FALLBACK_HTTP_CHUNK_SIZE.to_string(),
            merge_output_format: DEFAULT_MERGE_OUTPUT_FORMAT.to_string(),
            merged_format: DEFAULT_MERGED_FORMAT.to_string(),
            single_format: DEFAULT_SINGLE_FORMAT.to_string(),
            headers: BTreeMap::new(),
            ytdlp_path: None,
            ffmpeg_path: None,
            batch_columns: BatchColumnNames::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.retries == 0 || self.fallback_retries == 0 {
            return Err(EngineError::validation("retry counts must be at least 1"));
        }
        for (label, value) in [
            ("merged_format", &self.merged_format),
            ("single_format", &self.single_format),
            ("merge_output_format", &self.merge_output_format),
            ("user_agent", &self.user_agent),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::validation(format!("{label} must not be empty")));
            }
        }
        let columns = self.batch_columns.as_array();
        for (i, name) in columns.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(EngineError::validation("batch column names must not be empty"));
            }
            if columns[..i].iter().any(|other| other.eq_ignore_ascii_case(name)) {
                return Err(EngineError::validation(format!(
                    "batch column name is used twice: {name}"
                )));
            }
        }
        Ok(())
    }
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let bytes = std::fs::read(path)?;
    let parsed: Settings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Validation(format!(
            "failed to parse settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, format!("{json}\n"))?;
    Ok(())
}
