use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use vidfetch_engine::config::{load_settings, Settings};
use vidfetch_engine::extract::YtDlp;
use vidfetch_engine::logging::{init_cli_logging, LogLevel};
use vidfetch_engine::pipeline::{DownloadRequest, Pipeline};
use vidfetch_engine::timecode::parse_timecode;
use vidfetch_engine::tools::ToolPaths;
use vidfetch_engine::trim::Ffmpeg;

/// Download one video, optionally clipped or exported as MP3.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video page URL
    #[arg(required_unless_present = "tools")]
    url: Option<String>,

    /// Directory to save into (defaults to the configured output_dir)
    #[arg(long = "output-dir")]
    output_dir: Option<PathBuf>,

    /// Output file name; the real extension is added when missing
    #[arg(long)]
    filename: Option<String>,

    /// Netscape-format cookies.txt
    #[arg(long)]
    cookies: Option<PathBuf>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Clip start (SS, MM:SS or H:MM:SS)
    #[arg(long = "clip-start")]
    clip_start: Option<String>,

    /// Clip end (SS, MM:SS or H:MM:SS)
    #[arg(long = "clip-end")]
    clip_end: Option<String>,

    /// Keep only the audio track, as MP3
    #[arg(long = "audio-only")]
    audio_only: bool,

    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long = "log-level", default_value = "INFO", value_parser = parse_level)]
    log_level: LogLevel,

    /// Print where yt-dlp and ffmpeg were found and exit
    #[arg(long)]
    tools: bool,
}

fn parse_level(value: &str) -> Result<LogLevel, String> {
    value.parse::<LogLevel>().map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_cli_logging(args.log_level);

    let mut settings = match &args.config {
        Some(path) => match load_settings(path) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::error!("could not load settings: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };
    if let Some(dir) = &args.output_dir {
        settings.output_dir = dir.clone();
    }

    let paths = ToolPaths::locate(&settings);
    if args.tools {
        return match serde_json::to_string_pretty(&paths.status()) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                tracing::error!("could not render tool status: {err}");
                ExitCode::FAILURE
            }
        };
    }

    let clip = (
        parse_timecode(args.clip_start.as_deref().unwrap_or_default()),
        parse_timecode(args.clip_end.as_deref().unwrap_or_default()),
    );
    let (clip_start, clip_end) = match clip {
        (Ok(start), Ok(end)) => (start, end),
        (Err(err), _) | (_, Err(err)) => {
            tracing::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let request = DownloadRequest::new(args.url.unwrap_or_default(), settings.output_dir.clone())
        .filename(args.filename)
        .cookies(args.cookies)
        .credentials(args.username, args.password)
        .clip(clip_start, clip_end)
        .audio_only(args.audio_only);

    let pipeline = Pipeline::new(YtDlp::new(paths.ytdlp), Ffmpeg::new(paths.ffmpeg), settings);
    match pipeline.download_video(&request) {
        Some(path) => {
            println!("{}", path.to_string_lossy());
            ExitCode::SUCCESS
        }
        None => ExitCode::FAILURE,
    }
}
