use crate::cmd;
use crate::config::Settings;
use crate::logging::redact_url_for_log;
use crate::tools::YtDlpCommand;
use crate::{EngineError, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const DEFAULT_TITLE_TEMPLATE: &str = "%(title)s.%(ext)s";
pub const EXT_PLACEHOLDER: &str = "%(ext)s";

/// What kind of extraction failure a free-text message describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    EmptyFile,
    FfmpegMissing,
    Other,
}

static EMPTY_FILE_RE: OnceLock<Regex> = OnceLock::new();
static FFMPEG_RE: OnceLock<Regex> = OnceLock::new();

/// The only place that pattern-matches yt-dlp's error text.
pub fn classify_failure(message: &str) -> FailureClass {
    let empty_re =
        EMPTY_FILE_RE.get_or_init(|| Regex::new(r"(?i)downloaded file is empty").unwrap());
    if empty_re.is_match(message) {
        return FailureClass::EmptyFile;
    }
    let ffmpeg_re = FFMPEG_RE.get_or_init(|| Regex::new(r"(?i)\bffmpeg\b").unwrap());
    if ffmpeg_re.is_match(message) {
        return FailureClass::FfmpegMissing;
    }
    FailureClass::Other
}

/// Typed replacement for the extractor's option map.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractOptions {
    pub format: String,
    pub merge_output_format: Option<String>,
    pub ffmpeg_location: Option<PathBuf>,
    pub retries: u32,
    pub fragment_retries: u32,
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub force_ipv4: bool,
    pub http_chunk_size: Option<String>,
}

impl ExtractOptions {
    /// Options for the initial attempt. With ffmpeg present the best video and
    /// audio streams are merged into `merge_output_format`; without it a single
    /// pre-muxed stream is requested and merging is skipped.
    pub fn initial(settings: &Settings, ffmpeg: Option<&Path>) -> Self {
        let (format, merge_output_format, ffmpeg_location) = match ffmpeg {
            Some(path) => (
                settings.merged_format.clone(),
                Some(settings.merge_output_format.clone()),
                Some(path.to_path_buf()),
            ),
            None => (settings.single_format.clone(), None, None),
        };
        Self {
            format,
            merge_output_format,
            ffmpeg_location,
            retries: settings.retries,
            fragment_retries: settings.retries,
            user_agent: settings.user_agent.clone(),
            headers: settings.headers.clone(),
            cookies: None,
            username: None,
            password: None,
            force_ipv4: false,
            http_chunk_size: None,
        }
    }

    /// Network-forcing variant used for the single empty-file retry.
    pub fn with_network_fallback(&self, settings: &Settings) -> Self {
        let mut next = self.clone();
        next.force_ipv4 = true;
        next.http_chunk_size = Some(settings.fallback_http_chunk_size.clone());
        next.retries = settings.fallback_retries;
        next.fragment_retries = settings.fallback_retries;
        next
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--force-overwrites".to_string(),
            "--no-progress".to_string(),
            "--no-warnings".to_string(),
            "--retries".to_string(),
            self.retries.to_string(),
            "--fragment-retries".to_string(),
            self.fragment_retries.to_string(),
            "--user-agent".to_string(),
            self.user_agent.clone(),
            "-f".to_string(),
            self.format.clone(),
        ];

        if let Some(container) = &self.merge_output_format {
            args.push("--merge-output-format".to_string());
            args.push(container.clone());
        }
        if let Some(location) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(location.to_string_lossy().to_string());
        }
        for (name, value) in &self.headers {
            args.push("--add-header".to_string());
            args.push(format!("{name}:{value}"));
        }
        if let Some(cookies) = &self.cookies {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().to_string());
        }
        if let Some(username) = &self.username {
            args.push("--username".to_string());
            args.push(username.clone());
            if let Some(password) = &self.password {
                args.push("--password".to_string());
                args.push(password.clone());
            }
        }
        if self.force_ipv4 {
            args.push("--force-ipv4".to_string());
        }
        if let Some(size) = &self.http_chunk_size {
            args.push("--http-chunk-size".to_string());
            args.push(size.clone());
        }
        args
    }
}

#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub url: String,
    pub output_template: String,
    pub options: ExtractOptions,
}

pub trait Extractor {
    /// Downloads `request.url` and returns the path of the produced file.
    fn extract(&self, request: &ExtractRequest) -> Result<PathBuf>;
}

/// Output template for yt-dlp inside `output_dir`.
///
/// A user filename without an `%(ext)s` placeholder and without a suffix gets
/// `.%(ext)s` appended so the real container extension is filled in.
pub fn output_template(output_dir: &Path, filename: Option<&str>) -> String {
    let name = match filename.map(str::trim).filter(|v| !v.is_empty()) {
        None => DEFAULT_TITLE_TEMPLATE.to_string(),
        Some(name) if name.contains(EXT_PLACEHOLDER) => name.to_string(),
        Some(name) if Path::new(name).extension().is_some() => name.to_string(),
        Some(name) => format!("{name}.{EXT_PLACEHOLDER}"),
    };
    output_dir.join(name).to_string_lossy().to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct InfoJson {
    requested_downloads: Option<Vec<RequestedDownload>>,
    #[serde(rename = "_filename")]
    filename: Option<String>,
    ext: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RequestedDownload {
    filepath: Option<String>,
}

/// Final path from the info JSON: the explicit requested-download path when
/// present, otherwise the template filename with the reported extension.
fn reported_path(info: &InfoJson) -> Option<PathBuf> {
    let requested = info
        .requested_downloads
        .as_deref()
        .and_then(|items| items.first())
        .and_then(|item| item.filepath.as_deref())
        .filter(|v| !v.trim().is_empty());
    if let Some(path) = requested {
        return Some(PathBuf::from(path));
    }

    let mut path = PathBuf::from(info.filename.as_deref()?);
    if let Some(ext) = info.ext.as_deref().filter(|v| !v.is_empty()) {
        path.set_extension(ext);
    }
    Some(path)
}

fn parse_info_json(stdout: &[u8]) -> Option<InfoJson> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .last()
        .and_then(|line| serde_json::from_str(line).ok())
}

/// Pulls the most useful line out of yt-dlp's stderr.
fn error_summary(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("ERROR"))
        .last()
        .or_else(|| stderr.lines().map(str::trim).filter(|l| !l.is_empty()).last())
        .unwrap_or("unknown error")
        .to_string()
}

fn extraction_error(message: String) -> EngineError {
    match classify_failure(&message) {
        FailureClass::EmptyFile => EngineError::TransientExtraction(message),
        _ => EngineError::Extraction(message),
    }
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    command: Option<YtDlpCommand>,
}

impl YtDlp {
    pub fn new(command: Option<YtDlpCommand>) -> Self {
        Self { command }
    }
}

impl Extractor for YtDlp {
    fn extract(&self, request: &ExtractRequest) -> Result<PathBuf> {
        let ytdlp = self
            .command
            .as_ref()
            .ok_or_else(|| EngineError::ExternalToolMissing {
                tool: "yt-dlp".to_string(),
            })?;

        let mut command = ytdlp.command();
        command.args(request.options.to_args());
        command.args(["--no-simulate", "--dump-single-json", "-o"]);
        command.arg(&request.output_template);
        command.arg("--");
        command.arg(&request.url);

        tracing::debug!(
            url = %redact_url_for_log(&request.url),
            program = %ytdlp.describe(),
            "running yt-dlp"
        );
        let output = cmd::run_captured(&mut command, "yt-dlp")?;

        if !output.status.success() {
            let stderr = cmd::stderr_text(&output);
            return Err(extraction_error(format!(
                "{} (code={:?})",
                error_summary(&stderr),
                output.status.code()
            )));
        }

        let path = parse_info_json(&output.stdout)
            .as_ref()
            .and_then(reported_path)
            .ok_or_else(|| {
                EngineError::Extraction(format!(
                    "yt-dlp did not report an output file for {}",
                    redact_url_for_log(&request.url)
                ))
            })?;

        let meta = std::fs::metadata(&path).map_err(|_| {
            EngineError::Extraction(format!(
                "yt-dlp reported a missing file: {}",
                path.to_string_lossy()
            ))
        })?;
        if meta.len() == 0 {
            let _ = std::fs::remove_file(&path);
            return Err(EngineError::TransientExtraction(
                "ERROR: The downloaded file is empty".to_string(),
            ));
        }

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_detection_ignores_case() {
        assert_eq!(
            classify_failure("ERROR: The downloaded file is empty"),
            FailureClass::EmptyFile
        );
        assert_eq!(
            classify_failure("error: DOWNLOADED FILE IS EMPTY"),
            FailureClass::EmptyFile
        );
        assert_eq!(
            classify_failure("ERROR: Postprocessing: ffmpeg not found"),
            FailureClass::FfmpegMissing
        );
        assert_eq!(
            classify_failure("ERROR: Unsupported URL: https://example.com"),
            FailureClass::Other
        );
    }

    #[test]
    fn template_appends_extension_placeholder_only_when_needed() {
        let dir = Path::new("downloads");
        assert_eq!(
            output_template(dir, None),
            dir.join("%(title)s.%(ext)s").to_string_lossy()
        );
        assert_eq!(
            output_template(dir, Some("  ")),
            dir.join("%(title)s.%(ext)s").to_string_lossy()
        );
        assert_eq!(
            output_template(dir, Some("lecture")),
            dir.join("lecture.%(ext)s").to_string_lossy()
        );
        assert_eq!(
            output_template(dir, Some("lecture.mkv")),
            dir.join("lecture.mkv").to_string_lossy()
        );
        assert_eq!(
            output_template(dir, Some("%(id)s.%(ext)s")),
            dir.join("%(id)s.%(ext)s").to_string_lossy()
        );
    }

    #[test]
    fn requested_download_path_is_preferred() {
        let info: InfoJson = serde_json::from_str(
            r#"{"requested_downloads":[{"filepath":"downloads/merged.mp4"}],"_filename":"downloads/t.webm","ext":"webm"}"#,
        )
        .expect("json");
        assert_eq!(reported_path(&info), Some(PathBuf::from("downloads/merged.mp4")));
    }

    #[test]
    fn template_filename_takes_reported_extension() {
        let info: InfoJson =
            serde_json::from_str(r#"{"_filename":"downloads/title.f137.webm","ext":"mp4"}"#)
                .expect("json");
        assert_eq!(reported_path(&info), Some(PathBuf::from("downloads/title.f137.mp4")));

        let info: InfoJson = serde_json::from_str(r#"{"ext":"mp4"}"#).expect("json");
        assert_eq!(reported_path(&info), None);
    }

    #[test]
    fn info_json_is_read_from_last_json_line() {
        let stdout = b"[info] something\n{\"_filename\":\"a.mp4\",\"ext\":\"mp4\"}\n";
        let info = parse_info_json(stdout).expect("info");
        assert_eq!(info.filename.as_deref(), Some("a.mp4"));
    }

    #[test]
    fn fallback_options_force_ipv4_and_raise_retries() {
        let settings = Settings::default();
        let initial = ExtractOptions::initial(&settings, None);
        assert_eq!(initial.format, "b");
        assert!(initial.merge_output_format.is_none());
        assert!(!initial.to_args().contains(&"--force-ipv4".to_string()));

        let fallback = initial.with_network_fallback(&settings);
        let args = fallback.to_args();
        assert!(args.contains(&"--force-ipv4".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--http-chunk-size" && w[1] == "10M"));
        assert!(args.windows(2).any(|w| w[0] == "--retries" && w[1] == "10"));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(args.contains(&"--force-overwrites".to_string()));
    }

    #[test]
    fn merged_format_is_requested_with_ffmpeg() {
        let settings = Settings::default();
        let options = ExtractOptions::initial(&settings, Some(Path::new("/usr/bin/ffmpeg")));
        let args = options.to_args();
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "bv*+ba/b"));
        assert!(args.windows(2).any(|w| w[0] == "--merge-output-format" && w[1] == "mp4"));
        assert!(args.windows(2).any(|w| w[0] == "--ffmpeg-location"));
    }

    #[test]
    fn missing_ytdlp_is_reported_as_missing_tool() {
        let request = ExtractRequest {
            url: "https://example.com/v".to_string(),
            output_template: "downloads/%(title)s.%(ext)s".to_string(),
            options: ExtractOptions::initial(&Settings::default(), None),
        };
        let err = YtDlp::new(None).extract(&request).expect_err("must fail");
        assert!(matches!(err, EngineError::ExternalToolMissing { .. }));
    }
}
