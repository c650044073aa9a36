use crate::cmd;
use crate::timecode::{format_seconds, ClipRange};
use crate::{EngineError, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimMode {
    /// Keep the container; stream copy first, re-encode if that fails.
    Copy,
    /// Drop video and re-encode audio to MP3.
    AudioMp3,
}

pub trait Trimmer {
    fn location(&self) -> Option<&Path>;

    fn available(&self) -> bool {
        self.location().is_some()
    }

    /// Writes `input` cut to `clip` into `output`. An empty `clip` keeps the
    /// whole duration (useful for `TrimMode::AudioMp3`).
    fn trim(&self, input: &Path, output: &Path, clip: &ClipRange, mode: TrimMode) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    path: Option<PathBuf>,
}

impl Ffmpeg {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    fn run(&self, program: &Path, args: Vec<String>, output: &Path) -> Result<()> {
        let mut command = cmd::command(program);
        command.args(args).arg(output);
        let result = cmd::run_captured(&mut command, "ffmpeg")?;
        if result.status.success() && non_empty_file(output) {
            return Ok(());
        }
        Err(EngineError::ExternalToolFailed {
            tool: "ffmpeg".to_string(),
            code: result.status.code(),
            stderr: last_lines(&cmd::stderr_text(&result), 3),
        })
    }
}

impl Trimmer for Ffmpeg {
    fn location(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn trim(&self, input: &Path, output: &Path, clip: &ClipRange, mode: TrimMode) -> Result<()> {
        let program = self
            .path
            .as_deref()
            .ok_or_else(|| EngineError::ExternalToolMissing {
                tool: "ffmpeg".to_string(),
            })?;

        match mode {
            TrimMode::AudioMp3 => {
                let mut args = input_args(input, clip);
                args.extend(["-vn", "-acodec", "libmp3lame", "-q:a", "2"].map(String::from));
                self.run(program, args, output)
            }
            TrimMode::Copy => {
                let mut copy = input_args(input, clip);
                copy.extend(["-c", "copy"].map(String::from));
                match self.run(program, copy, output) {
                    Ok(()) => Ok(()),
                    Err(EngineError::ExternalToolFailed { stderr, .. }) => {
                        // Stream copy fails when the cut points are not on keyframes.
                        tracing::debug!(%stderr, "stream copy failed; re-encoding");
                        let mut reencode = input_args(input, clip);
                        reencode.extend(
                            [
                                "-c:v", "libx264", "-preset", "veryfast", "-crf", "22", "-c:a",
                                "aac", "-movflags", "+faststart",
                            ]
                            .map(String::from),
                        );
                        self.run(program, reencode, output)
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }
}

/// `-ss` seeks the input; the end bound becomes a duration because input
/// seeking resets output timestamps to zero.
fn input_args(input: &Path, clip: &ClipRange) -> Vec<String> {
    let mut args = vec!["-nostdin".to_string(), "-y".to_string()];
    if let Some(start) = clip.start.filter(|s| *s > 0.0) {
        args.push("-ss".to_string());
        args.push(format_seconds(start));
    }
    args.push("-i".to_string());
    args.push(input.to_string_lossy().to_string());
    if let Some(end) = clip.end {
        let duration = end - clip.start.unwrap_or(0.0).max(0.0);
        args.push("-t".to_string());
        args.push(format_seconds(duration));
    }
    args
}

fn non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..].join(" | ")
}

/// Temporary sibling used while trimming `path`; keeps the extension so
/// ffmpeg picks the same container.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "media".to_string());
    let tag = uuid::Uuid::new_v4().simple().to_string();
    let name = match path.extension() {
        Some(ext) => format!(".{stem}.{}.trim.{}", &tag[..8], ext.to_string_lossy()),
        None => format!(".{stem}.{}.trim", &tag[..8]),
    };
    path.with_file_name(name)
}

/// Replaces `path` with its trimmed version. The original is untouched and
/// the temporary file removed if trimming fails.
pub fn trim_in_place(trimmer: &dyn Trimmer, path: &Path, clip: &ClipRange) -> Result<()> {
    let tmp_path = temp_sibling(path);
    if let Err(err) = trimmer.trim(path, &tmp_path, clip, TrimMode::Copy) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(EngineError::TrimFailed(err.to_string()));
    }
    if let Err(err) = replace_file(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(EngineError::TrimFailed(format!(
            "could not replace {}: {err}",
            path.to_string_lossy()
        )));
    }
    Ok(())
}

fn replace_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Windows refuses to rename over an existing file.
    if to.exists() {
        std::fs::remove_file(to)?;
    }
    std::fs::rename(from, to)
}

/// Output path for a clip or audio export next to `base`.
///
/// Returns the path and whether it is an audio-only export.
pub fn derive_clip_path(
    base: &Path,
    prefer_audio: bool,
    explicit_name: Option<&str>,
) -> (PathBuf, bool) {
    let stem = explicit_name
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| base.file_stem().map(|s| s.to_string_lossy().to_string()))
        .unwrap_or_else(|| "clip".to_string());

    if prefer_audio {
        return (base.with_file_name(format!("{stem}.mp3")), true);
    }
    let suffix = base
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp4".to_string());
    (base.with_file_name(format!("{stem}.{suffix}")), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CopyingTrimmer {
        fail: bool,
        calls: Cell<usize>,
    }

    impl Trimmer for CopyingTrimmer {
        fn location(&self) -> Option<&Path> {
            Some(Path::new("/fake/ffmpeg"))
        }

        fn trim(&self, input: &Path, output: &Path, _clip: &ClipRange, _mode: TrimMode) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            std::fs::write(output, b"partial")?;
            if self.fail {
                return Err(EngineError::ExternalToolFailed {
                    tool: "ffmpeg".to_string(),
                    code: Some(1),
                    stderr: "boom".to_string(),
                });
            }
            let mut data = std::fs::read(input)?;
            data.truncate(3);
            std::fs::write(output, data)?;
            Ok(())
        }
    }

    #[test]
    fn trim_in_place_replaces_original() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("title.mp4");
        std::fs::write(&path, b"abcdefgh").expect("write");

        let trimmer = CopyingTrimmer { fail: false, calls: Cell::new(0) };
        let clip = ClipRange::new(Some(1.0), Some(2.0)).expect("clip");
        trim_in_place(&trimmer, &path, &clip).expect("trim");

        assert_eq!(std::fs::read(&path).expect("read"), b"abc");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).expect("ls").flatten().collect();
        assert_eq!(leftovers.len(), 1, "temp file should be gone");
    }

    #[test]
    fn failed_trim_keeps_original_and_removes_temp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("title.mp4");
        std::fs::write(&path, b"abcdefgh").expect("write");

        let trimmer = CopyingTrimmer { fail: true, calls: Cell::new(0) };
        let clip = ClipRange::new(None, Some(2.0)).expect("clip");
        let err = trim_in_place(&trimmer, &path, &clip).expect_err("must fail");

        assert!(matches!(err, EngineError::TrimFailed(_)));
        assert_eq!(std::fs::read(&path).expect("read"), b"abcdefgh");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).expect("ls").flatten().collect();
        assert_eq!(leftovers.len(), 1, "partial trim artifact should be removed");
        assert_eq!(trimmer.calls.get(), 1);
    }

    #[test]
    fn clip_paths_follow_audio_preference() {
        let base = Path::new("downloads/title.webm");
        assert_eq!(
            derive_clip_path(base, true, None),
            (PathBuf::from("downloads/title.mp3"), true)
        );
        assert_eq!(
            derive_clip_path(base, false, Some("intro")),
            (PathBuf::from("downloads/intro.webm"), false)
        );
        assert_eq!(
            derive_clip_path(Path::new("downloads/raw"), false, None),
            (PathBuf::from("downloads/raw.mp4"), false)
        );
    }

    #[test]
    fn end_bound_becomes_duration_after_seek() {
        let clip = ClipRange::new(Some(10.0), Some(25.5)).expect("clip");
        let args = input_args(Path::new("in.mp4"), &clip);
        assert_eq!(
            args,
            vec!["-nostdin", "-y", "-ss", "10", "-i", "in.mp4", "-t", "15.5"]
        );

        let open_start = ClipRange::new(None, Some(5.0)).expect("clip");
        let args = input_args(Path::new("in.mp4"), &open_start);
        assert_eq!(args, vec!["-nostdin", "-y", "-i", "in.mp4", "-t", "5"]);
    }

    #[test]
    fn temp_sibling_keeps_extension_and_directory() {
        let path = Path::new("downloads/title.mp4");
        let tmp = temp_sibling(path);
        assert_eq!(tmp.parent(), path.parent());
        assert_eq!(tmp.extension().and_then(|e| e.to_str()), Some("mp4"));
        assert_ne!(tmp, path);
    }
}
