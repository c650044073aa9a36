use crate::config::Settings;
use crate::extract::{
    classify_failure, output_template, ExtractOptions, ExtractRequest, Extractor, FailureClass,
};
use crate::logging::redact_url_for_log;
use crate::timecode::ClipRange;
use crate::trim::{derive_clip_path, temp_sibling, trim_in_place, TrimMode, Trimmer};
use crate::{EngineError, Result};
use std::path::{Path, PathBuf};

/// What to do when clipping is requested but ffmpeg cannot be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipPolicy {
    /// Warn and deliver the unclipped download.
    Degrade,
    /// Fail before downloading.
    Require,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadRequest {
    pub url: String,
    pub output_dir: PathBuf,
    pub filename: Option<String>,
    pub cookies: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clip_start: Option<f64>,
    pub clip_end: Option<f64>,
    pub audio_only: bool,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn filename(mut self, filename: Option<String>) -> Self {
        self.filename = filename.filter(|v| !v.trim().is_empty());
        self
    }

    pub fn cookies(mut self, cookies: Option<PathBuf>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn clip(mut self, start: Option<f64>, end: Option<f64>) -> Self {
        self.clip_start = start;
        self.clip_end = end;
        self
    }

    pub fn audio_only(mut self, audio_only: bool) -> Self {
        self.audio_only = audio_only;
        self
    }
}

pub struct Pipeline<E, T> {
    extractor: E,
    trimmer: T,
    settings: Settings,
}

impl<E: Extractor, T: Trimmer> Pipeline<E, T> {
    pub fn new(extractor: E, trimmer: T, settings: Settings) -> Self {
        Self {
            extractor,
            trimmer,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    pub fn trim_available(&self) -> bool {
        self.trimmer.available()
    }

    /// Single-download entry point: every failure is logged and turned into
    /// `None`.
    pub fn download_video(&self, request: &DownloadRequest) -> Option<PathBuf> {
        match self.attempt_download(request, ClipPolicy::Degrade) {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::error!(
                    kind = err.kind().as_str(),
                    url = %redact_url_for_log(&request.url),
                    "video download failed: {err}"
                );
                None
            }
        }
    }

    pub fn attempt_download(&self, request: &DownloadRequest, policy: ClipPolicy) -> Result<PathBuf> {
        let url = request.url.trim();
        if url.is_empty() {
            return Err(EngineError::validation("a video URL is required"));
        }

        let mut clip = ClipRange::new(request.clip_start, request.clip_end)?;
        let audio_only = request.audio_only;
        if audio_only && !self.trimmer.available() {
            return Err(EngineError::validation(
                "audio export was requested but ffmpeg is not available",
            ));
        }
        if !clip.is_empty() && !self.trimmer.available() {
            match policy {
                ClipPolicy::Require => {
                    return Err(EngineError::validation(
                        "clipping was requested but ffmpeg is not available",
                    ));
                }
                ClipPolicy::Degrade => {
                    tracing::warn!("ffmpeg is not available; skipping clipping");
                    clip = ClipRange::default();
                }
            }
        }

        std::fs::create_dir_all(&request.output_dir).map_err(|e| {
            tracing::error!(
                dir = %request.output_dir.to_string_lossy(),
                "unable to create output directory: {e}"
            );
            EngineError::Io(e)
        })?;

        let mut options = ExtractOptions::initial(&self.settings, self.trimmer.location());
        if self.trimmer.location().is_none() {
            tracing::info!("ffmpeg not found; requesting a single pre-muxed stream");
        }
        options.cookies = resolve_cookies(request.cookies.as_deref());
        let (username, password) = resolve_credentials(&request.username, &request.password);
        options.username = username;
        options.password = password;

        let extract = ExtractRequest {
            url: url.to_string(),
            output_template: output_template(&request.output_dir, request.filename.as_deref()),
            options,
        };

        let downloaded = self.extract_with_fallback(extract)?;
        tracing::info!(
            url = %redact_url_for_log(url),
            "downloaded -> {}",
            downloaded.to_string_lossy()
        );

        if audio_only {
            return self.export_audio(&downloaded, &clip, request.filename.as_deref());
        }
        if !clip.is_empty() {
            trim_in_place(&self.trimmer, &downloaded, &clip).map_err(|err| {
                tracing::error!(path = %downloaded.to_string_lossy(), "clipping failed: {err}");
                err
            })?;
            tracing::info!(
                start = ?clip.start_arg(),
                end = ?clip.end_arg(),
                "clipped {}",
                downloaded.to_string_lossy()
            );
        }
        Ok(downloaded)
    }

    /// One initial attempt, plus exactly one retry with network-forcing
    /// options when the first failure is the empty-file case.
    fn extract_with_fallback(&self, mut request: ExtractRequest) -> Result<PathBuf> {
        let first_err = match self.extractor.extract(&request).map_err(|e| self.annotate(e)) {
            Ok(path) => return Ok(path),
            Err(err) => err,
        };
        if !matches!(first_err, EngineError::TransientExtraction(_)) {
            return Err(first_err);
        }

        tracing::warn!(
            url = %redact_url_for_log(&request.url),
            "downloaded file was empty; retrying once with forced IPv4: {first_err}"
        );
        request.options = request.options.with_network_fallback(&self.settings);
        self.extractor.extract(&request).map_err(|second_err| {
            match self.annotate(second_err) {
                EngineError::TransientExtraction(message) => EngineError::Extraction(format!(
                    "{message} (still empty after retrying with forced IPv4)"
                )),
                other => other,
            }
        })
    }

    /// Normalizes extractor errors through [`classify_failure`] and adds a
    /// hint when ffmpeg was expected to be usable.
    fn annotate(&self, err: EngineError) -> EngineError {
        let message = match err {
            EngineError::Extraction(message) | EngineError::TransientExtraction(message) => message,
            other => return other,
        };
        match classify_failure(&message) {
            FailureClass::EmptyFile => EngineError::TransientExtraction(message),
            FailureClass::FfmpegMissing => match self.trimmer.location() {
                Some(location) => EngineError::Extraction(format!(
                    "{message} (hint: ffmpeg was found at {} but the extractor could not use it)",
                    location.to_string_lossy()
                )),
                None => EngineError::Extraction(message),
            },
            FailureClass::Other => EngineError::Extraction(message),
        }
    }

    fn export_audio(&self, downloaded: &Path, clip: &ClipRange, name: Option<&str>) -> Result<PathBuf> {
        // Templates and names with a suffix fall back to the downloaded stem.
        let stem = name.filter(|n| !n.contains("%(") && Path::new(n.trim()).extension().is_none());
        let (target, _) = derive_clip_path(downloaded, true, stem);
        // An .mp3 source is re-encoded through a temporary sibling.
        let in_place = target == downloaded;
        let written = if in_place {
            temp_sibling(downloaded)
        } else {
            target.clone()
        };

        if let Err(err) = self.trimmer.trim(downloaded, &written, clip, TrimMode::AudioMp3) {
            let _ = std::fs::remove_file(&written);
            tracing::error!(path = %downloaded.to_string_lossy(), "audio export failed: {err}");
            return Err(EngineError::TrimFailed(err.to_string()));
        }

        if in_place {
            std::fs::rename(&written, downloaded)?;
        } else if let Err(err) = std::fs::remove_file(downloaded) {
            tracing::warn!(
                path = %downloaded.to_string_lossy(),
                "could not remove source after audio export: {err}"
            );
        }
        tracing::info!("exported audio -> {}", target.to_string_lossy());
        Ok(target)
    }
}

fn resolve_cookies(cookies: Option<&Path>) -> Option<PathBuf> {
    let path = cookies?;
    if path.is_file() {
        Some(path.to_path_buf())
    } else {
        tracing::warn!(
            path = %path.to_string_lossy(),
            "cookie file not found; continuing without cookies"
        );
        None
    }
}

fn resolve_credentials(
    username: &Option<String>,
    password: &Option<String>,
) -> (Option<String>, Option<String>) {
    let username = username.as_deref().map(str::trim).filter(|v| !v.is_empty());
    let password = password.as_deref().filter(|v| !v.is_empty());
    match (username, password) {
        (Some(user), pass) => (Some(user.to_string()), pass.map(str::to_string)),
        (None, Some(_)) => {
            tracing::warn!("password given without a username; ignoring it");
            (None, None)
        }
        (None, None) => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Replays scripted outcomes and records the options of every call.
    struct ScriptedExtractor {
        outcomes: RefCell<VecDeque<std::result::Result<&'static str, &'static str>>>,
        calls: RefCell<Vec<ExtractRequest>>,
    }

    impl ScriptedExtractor {
        fn new(outcomes: Vec<std::result::Result<&'static str, &'static str>>) -> Self {
            Self {
                outcomes: RefCell::new(outcomes.into()),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Extractor for ScriptedExtractor {
        fn extract(&self, request: &ExtractRequest) -> Result<PathBuf> {
            self.calls.borrow_mut().push(request.clone());
            let out_dir = Path::new(&request.output_template)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            match self.outcomes.borrow_mut().pop_front() {
                Some(Ok(name)) => {
                    let path = out_dir.join(name);
                    std::fs::write(&path, b"media-bytes")?;
                    Ok(path)
                }
                Some(Err(message)) => Err(EngineError::Extraction(message.to_string())),
                None => Err(EngineError::Extraction("no scripted outcome".to_string())),
            }
        }
    }

    struct FakeTrimmer {
        location: Option<PathBuf>,
        fail: bool,
        modes: RefCell<Vec<TrimMode>>,
    }

    impl FakeTrimmer {
        fn present() -> Self {
            Self {
                location: Some(PathBuf::from("/fake/ffmpeg")),
                fail: false,
                modes: RefCell::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::present()
            }
        }

        fn absent() -> Self {
            Self {
                location: None,
                ..Self::present()
            }
        }
    }

    impl Trimmer for FakeTrimmer {
        fn location(&self) -> Option<&Path> {
            self.location.as_deref()
        }

        fn trim(&self, _input: &Path, output: &Path, _clip: &ClipRange, mode: TrimMode) -> Result<()> {
            self.modes.borrow_mut().push(mode);
            if self.fail {
                std::fs::write(output, b"half")?;
                return Err(EngineError::ExternalToolFailed {
                    tool: "ffmpeg".to_string(),
                    code: Some(1),
                    stderr: "Invalid data found".to_string(),
                });
            }
            std::fs::write(output, b"trimmed")?;
            Ok(())
        }
    }

    fn request(dir: &Path) -> DownloadRequest {
        DownloadRequest::new("https://example.com/v", dir.join("downloads"))
    }

    #[test]
    fn successful_download_returns_reported_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![Ok("title.mp4")]),
            FakeTrimmer::present(),
            Settings::default(),
        );

        let path = pipeline.download_video(&request(dir.path())).expect("path");
        assert_eq!(path, dir.path().join("downloads").join("title.mp4"));
        assert_eq!(pipeline.extractor.calls.borrow().len(), 1);
    }

    #[test]
    fn empty_file_failure_is_retried_exactly_once_with_ipv4() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![Err("ERROR: The Downloaded File Is Empty"), Ok("title.mp4")]),
            FakeTrimmer::present(),
            Settings::default(),
        );

        let path = pipeline.download_video(&request(dir.path()));
        assert!(path.is_some());

        let calls = pipeline.extractor.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].options.force_ipv4);
        assert!(calls[1].options.force_ipv4);
        assert_eq!(calls[1].options.http_chunk_size.as_deref(), Some("10M"));
        assert!(calls[1].options.retries > calls[0].options.retries);
    }

    #[test]
    fn second_empty_file_failure_is_terminal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![
                Err("downloaded file is empty"),
                Err("downloaded file is empty"),
                Ok("never.mp4"),
            ]),
            FakeTrimmer::present(),
            Settings::default(),
        );

        let err = pipeline
            .attempt_download(&request(dir.path()), ClipPolicy::Degrade)
            .expect_err("must fail");
        assert!(matches!(err, EngineError::Extraction(_)), "{err}");
        assert_eq!(pipeline.extractor.calls.borrow().len(), 2);
    }

    #[test]
    fn other_failures_are_not_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![Err("ERROR: Unsupported URL"), Ok("title.mp4")]),
            FakeTrimmer::present(),
            Settings::default(),
        );

        assert!(pipeline.download_video(&request(dir.path())).is_none());
        assert_eq!(pipeline.extractor.calls.borrow().len(), 1);
    }

    #[test]
    fn ffmpeg_failure_gets_a_hint_when_ffmpeg_was_located() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![Err("ERROR: ffmpeg exited with code 1")]),
            FakeTrimmer::present(),
            Settings::default(),
        );
        let err = pipeline
            .attempt_download(&request(dir.path()), ClipPolicy::Degrade)
            .expect_err("must fail");
        assert!(err.to_string().contains("hint"), "{err}");
    }

    #[test]
    fn failed_trim_invalidates_the_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![Ok("title.mp4")]),
            FakeTrimmer::failing(),
            Settings::default(),
        );

        let req = request(dir.path()).clip(Some(1.0), Some(3.0));
        let err = pipeline
            .attempt_download(&req, ClipPolicy::Degrade)
            .expect_err("must fail");
        assert!(matches!(err, EngineError::TrimFailed(_)));

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("downloads"))
            .expect("ls")
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["title.mp4".to_string()], "no trim leftovers");
    }

    #[test]
    fn successful_trim_keeps_the_same_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![Ok("title.mp4")]),
            FakeTrimmer::present(),
            Settings::default(),
        );

        let req = request(dir.path()).clip(None, Some(3.0));
        let path = pipeline.download_video(&req).expect("path");
        assert_eq!(path, dir.path().join("downloads").join("title.mp4"));
        assert_eq!(std::fs::read(&path).expect("read"), b"trimmed");
        assert_eq!(pipeline.trimmer.modes.borrow().as_slice(), &[TrimMode::Copy]);
    }

    #[test]
    fn invalid_clip_bounds_fail_before_downloading() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![Ok("title.mp4")]),
            FakeTrimmer::present(),
            Settings::default(),
        );

        let req = request(dir.path()).clip(Some(10.0), Some(5.0));
        let err = pipeline
            .attempt_download(&req, ClipPolicy::Degrade)
            .expect_err("must fail");
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(pipeline.extractor.calls.borrow().is_empty());
    }

    #[test]
    fn missing_ffmpeg_degrades_single_path_but_fails_batch_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![Ok("title.mp4")]),
            FakeTrimmer::absent(),
            Settings::default(),
        );
        let req = request(dir.path()).clip(Some(1.0), Some(2.0));

        let err = pipeline
            .attempt_download(&req, ClipPolicy::Require)
            .expect_err("batch path must fail");
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(pipeline.extractor.calls.borrow().is_empty());

        let path = pipeline.download_video(&req).expect("degraded download");
        assert_eq!(std::fs::read(&path).expect("read"), b"media-bytes");
        let calls = pipeline.extractor.calls.borrow();
        assert_eq!(calls[0].options.format, "b");
        assert!(calls[0].options.merge_output_format.is_none());
    }

    #[test]
    fn audio_export_replaces_video_with_mp3() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![Ok("title.mp4")]),
            FakeTrimmer::present(),
            Settings::default(),
        );

        let req = request(dir.path()).audio_only(true);
        let path = pipeline.download_video(&req).expect("path");
        assert_eq!(path, dir.path().join("downloads").join("title.mp3"));
        assert!(!dir.path().join("downloads").join("title.mp4").exists());
        assert_eq!(pipeline.trimmer.modes.borrow().as_slice(), &[TrimMode::AudioMp3]);
    }

    #[test]
    fn audio_export_without_ffmpeg_fails_under_both_policies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![Ok("song.mp4")]),
            FakeTrimmer::absent(),
            Settings::default(),
        );
        let req = request(dir.path()).audio_only(true);

        for policy in [ClipPolicy::Degrade, ClipPolicy::Require] {
            let err = pipeline
                .attempt_download(&req, policy)
                .expect_err("audio needs ffmpeg");
            assert!(matches!(err, EngineError::Validation(_)), "{err}");
        }
        assert!(pipeline.download_video(&req).is_none());
        assert!(pipeline.extractor.calls.borrow().is_empty());
    }

    #[test]
    fn audio_export_name_ignores_templates_and_suffixes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let downloads = dir.path().join("downloads");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![Ok("abc123.webm"), Ok("lecture.mkv"), Ok("raw.mp4")]),
            FakeTrimmer::present(),
            Settings::default(),
        );

        let templated = request(dir.path())
            .filename(Some("%(id)s.%(ext)s".to_string()))
            .audio_only(true);
        assert_eq!(pipeline.download_video(&templated), Some(downloads.join("abc123.mp3")));

        let suffixed = request(dir.path())
            .filename(Some("lecture.mkv".to_string()))
            .audio_only(true);
        assert_eq!(pipeline.download_video(&suffixed), Some(downloads.join("lecture.mp3")));

        let plain = request(dir.path())
            .filename(Some("talk".to_string()))
            .audio_only(true);
        assert_eq!(pipeline.download_video(&plain), Some(downloads.join("talk.mp3")));
    }

    #[test]
    fn missing_cookie_file_and_orphan_password_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![Ok("title.mp4")]),
            FakeTrimmer::present(),
            Settings::default(),
        );

        let req = request(dir.path())
            .cookies(Some(dir.path().join("missing-cookies.txt")))
            .credentials(None, Some("secret".to_string()));
        assert!(pipeline.download_video(&req).is_some());

        let calls = pipeline.extractor.calls.borrow();
        assert!(calls[0].options.cookies.is_none());
        assert!(calls[0].options.username.is_none());
        assert!(calls[0].options.password.is_none());
    }

    #[test]
    fn username_without_password_is_passed_through() {
        let (user, pass) = resolve_credentials(&Some(" alice ".to_string()), &None);
        assert_eq!(user.as_deref(), Some("alice"));
        assert!(pass.is_none());
    }

    #[test]
    fn blank_url_and_uncreatable_directory_are_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Pipeline::new(
            ScriptedExtractor::new(vec![]),
            FakeTrimmer::present(),
            Settings::default(),
        );

        let blank = DownloadRequest::new("   ", dir.path());
        assert!(matches!(
            pipeline.attempt_download(&blank, ClipPolicy::Degrade),
            Err(EngineError::Validation(_))
        ));

        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").expect("write");
        let bad_dir = DownloadRequest::new("https://example.com/v", file.join("sub"));
        assert!(matches!(
            pipeline.attempt_download(&bad_dir, ClipPolicy::Degrade),
            Err(EngineError::Io(_))
        ));
    }
}
