use crate::cmd;
use crate::config::Settings;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// How to start yt-dlp: a program plus any arguments that must precede the
/// real ones (e.g. `python3 -m yt_dlp`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YtDlpCommand {
    pub program: PathBuf,
    pub prefix: Vec<String>,
}

impl YtDlpCommand {
    pub fn binary(program: PathBuf) -> Self {
        Self {
            program,
            prefix: Vec::new(),
        }
    }

    pub fn describe(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().to_string()];
        parts.extend(self.prefix.iter().cloned());
        parts.join(" ")
    }

    pub fn command(&self) -> std::process::Command {
        let mut command = cmd::command(&self.program);
        command.args(&self.prefix);
        command
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    pub ytdlp: Option<YtDlpCommand>,
    pub ffmpeg: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub ytdlp_available: bool,
    pub ytdlp_command: String,
    pub ytdlp_version: Option<String>,
    pub ffmpeg_available: bool,
    pub ffmpeg_path: String,
    pub ffmpeg_version: Option<String>,
}

impl ToolPaths {
    pub fn locate(settings: &Settings) -> Self {
        Self {
            ytdlp: resolve_ytdlp(settings.ytdlp_path.as_deref()),
            ffmpeg: resolve_ffmpeg(settings.ffmpeg_path.as_deref()),
        }
    }

    pub fn status(&self) -> ToolStatus {
        let ytdlp_version = self.ytdlp.as_ref().and_then(|ytdlp| {
            let mut command = ytdlp.command();
            command.arg("--version");
            version_first_line(command)
        });
        let ffmpeg_version = self.ffmpeg.as_ref().and_then(|ffmpeg| {
            let mut command = cmd::command(ffmpeg);
            command.arg("-version");
            version_first_line(command)
        });

        ToolStatus {
            ytdlp_available: self.ytdlp.is_some(),
            ytdlp_command: self
                .ytdlp
                .as_ref()
                .map(YtDlpCommand::describe)
                .unwrap_or_default(),
            ytdlp_version,
            ffmpeg_available: self.ffmpeg.is_some(),
            ffmpeg_path: self
                .ffmpeg
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
            ffmpeg_version,
        }
    }
}

fn existing_file(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn resolve_ytdlp(configured: Option<&Path>) -> Option<YtDlpCommand> {
    if let Some(path) = configured {
        match existing_file(path) {
            Some(found) => return Some(YtDlpCommand::binary(found)),
            None => tracing::warn!(
                path = %path.to_string_lossy(),
                "configured yt-dlp path does not exist; searching PATH"
            ),
        }
    }

    if let Ok(found) = which::which("yt-dlp") {
        return Some(YtDlpCommand::binary(found));
    }

    for python in ["python3", "python"] {
        let Ok(program) = which::which(python) else {
            continue;
        };
        let candidate = YtDlpCommand {
            program,
            prefix: vec!["-m".to_string(), "yt_dlp".to_string()],
        };
        let mut probe = candidate.command();
        probe.arg("--version");
        if version_first_line(probe).is_some() {
            return Some(candidate);
        }
    }

    None
}

fn resolve_ffmpeg(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        match existing_file(path) {
            Some(found) => return Some(found),
            None => tracing::warn!(
                path = %path.to_string_lossy(),
                "configured ffmpeg path does not exist; searching PATH"
            ),
        }
    }
    which::which("ffmpeg").ok()
}

fn version_first_line(mut command: std::process::Command) -> Option<String> {
    let program: OsString = command.get_program().to_os_string();
    let output = cmd::run_captured(&mut command, &program.to_string_lossy()).ok()?;
    if !output.status.success() {
        return None;
    }
    cmd::first_line_of_stdout(&output)
}
