use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use vidfetch_engine::archive::write_downloads_archive;
use vidfetch_engine::batch::{
    load_batch_csv, load_batch_state, now_timestamp, process_batch, save_batch_state,
    write_batch_csv, BatchCursor, BatchState,
};
use vidfetch_engine::config::{load_settings, Settings};
use vidfetch_engine::extract::YtDlp;
use vidfetch_engine::logging::{init_cli_logging, LogLevel};
use vidfetch_engine::pipeline::Pipeline;
use vidfetch_engine::tools::ToolPaths;
use vidfetch_engine::trim::Ffmpeg;
use vidfetch_engine::Result;

/// Download every URL listed in a CSV, a chunk at a time.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSV with a URL/Link column
    csv: PathBuf,

    /// Updated CSV to write (defaults to <csv>.updated.csv)
    #[arg(long)]
    out: Option<PathBuf>,

    /// Netscape-format cookies.txt used for every row
    #[arg(long)]
    cookies: Option<PathBuf>,

    /// Stop after this many rows; 0 processes all remaining rows
    #[arg(long = "pause-after", default_value_t = 0)]
    pause_after: usize,

    /// Skip rows already marked as downloaded
    #[arg(long = "skip-completed")]
    skip_completed: bool,

    /// Ignore saved progress and start from the first row
    #[arg(long)]
    restart: bool,

    /// Also zip every downloaded file into this archive
    #[arg(long)]
    archive: Option<PathBuf>,

    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long = "log-level", default_value = "INFO", value_parser = parse_level)]
    log_level: LogLevel,
}

fn parse_level(value: &str) -> std::result::Result<LogLevel, String> {
    value.parse::<LogLevel>().map_err(|e| e.to_string())
}

fn default_out_path(csv: &Path) -> PathBuf {
    let stem = csv
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "batch".to_string());
    csv.with_file_name(format!("{stem}.updated.csv"))
}

fn state_path(out: &Path) -> PathBuf {
    out.with_extension("state.json")
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_cli_logging(args.log_level);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(kind = err.kind().as_str(), "batch failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let settings = match &args.config {
        Some(path) => load_settings(path)?,
        None => Settings::default(),
    };
    let out = args.out.clone().unwrap_or_else(|| default_out_path(&args.csv));
    let state_file = state_path(&out);
    let source = std::fs::canonicalize(&args.csv)
        .unwrap_or_else(|_| args.csv.clone())
        .to_string_lossy()
        .to_string();

    if args.restart && state_file.exists() {
        std::fs::remove_file(&state_file)?;
    }
    let saved = load_batch_state(&state_file)?;
    let mut table = load_batch_csv(&std::fs::read(&args.csv)?, &settings.batch_columns)?;

    // Progress only carries over for the same source and row count; the
    // previously written CSV then holds the row state.
    let mut next_row = 0;
    if let Some(position) = saved
        .as_ref()
        .and_then(|state| state.resume_position(&source, table.len()))
        .filter(|_| out.is_file())
    {
        let written = load_batch_csv(&std::fs::read(&out)?, &settings.batch_columns)?;
        if written.len() == table.len() {
            table = written;
            next_row = position;
            tracing::info!("resuming at row {} of {}", next_row + 1, table.len());
        } else {
            tracing::warn!("{} no longer matches the saved progress; starting over", out.to_string_lossy());
        }
    } else if saved.is_some() {
        tracing::warn!("saved progress does not match this CSV; starting over");
    }
    let cursor = BatchCursor {
        next_row,
        pause_after: args.pause_after,
        skip_completed: args.skip_completed,
    };

    let paths = ToolPaths::locate(&settings);
    let pipeline = Pipeline::new(YtDlp::new(paths.ytdlp), Ffmpeg::new(paths.ffmpeg), settings);
    let outcome = process_batch(&mut table, cursor, &pipeline, args.cookies.as_deref());

    std::fs::write(&out, write_batch_csv(&table)?)?;
    if outcome.remaining > 0 {
        save_batch_state(
            &state_file,
            &BatchState {
                source,
                row_count: table.len(),
                cursor: outcome.cursor,
                updated_at: now_timestamp(),
            },
        )?;
    } else if state_file.exists() {
        std::fs::remove_file(&state_file)?;
    }

    if let Some(archive) = &args.archive {
        let summary = write_downloads_archive(&table.rows, archive)?;
        if summary.missing > 0 {
            tracing::warn!("{} downloaded files were missing from disk", summary.missing);
        }
        println!("archive: {} ({} files)", summary.out_path, summary.entries.len());
    }

    let counts = outcome.counts;
    println!(
        "processed {} rows: {} downloaded, {} failed, {} skipped; {} remaining -> {}",
        outcome.processed,
        counts.downloaded,
        counts.failed,
        counts.skipped,
        outcome.remaining,
        out.to_string_lossy()
    );
    if outcome.paused {
        println!("paused after {} rows; run again to resume", outcome.processed);
    }
    Ok(())
}
