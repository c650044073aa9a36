use crate::{EngineError, Result};
use std::io::Write;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::MakeWriter;

/// The five level names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub const NAMES: [&'static str; 5] = ["CRITICAL", "ERROR", "WARNING", "INFO", "DEBUG"];

    /// `tracing` has no level above ERROR, so CRITICAL collapses onto it.
    pub fn filter(&self) -> LevelFilter {
        match self {
            LogLevel::Critical | LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
        }
    }
}

impl FromStr for LogLevel {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(LogLevel::Critical),
            "ERROR" => Ok(LogLevel::Error),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            other => Err(EngineError::Validation(format!(
                "unknown log level: {other} (expected one of {})",
                Self::NAMES.join("|")
            ))),
        }
    }
}

struct ClockTime;

impl FormatTime for ClockTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let format = time::macros::format_description!("[hour]:[minute]:[second]");
        let now = time::OffsetDateTime::now_utc();
        match now.format(format) {
            Ok(text) => write!(w, "{text}"),
            Err(_) => write!(w, "--:--:--"),
        }
    }
}

/// Installs the process logger for the command-line binaries (stderr only,
/// stdout stays reserved for results).
pub fn init_cli_logging(level: LogLevel) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level.filter())
        .with_timer(ClockTime)
        .with_writer(std::io::stderr)
        .try_init();
}

/// In-memory log sink for one request. Install it with [`LogCapture::scope`]
/// and read the excerpt back with [`LogCapture::contents`].
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

pub struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.buffer.lock() {
            Ok(mut guard) => guard.extend_from_slice(buf),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(buf),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with every event at `level` or above recorded into this
    /// capture instead of the process logger.
    pub fn scope<R>(&self, level: LogLevel, f: impl FnOnce() -> R) -> R {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level.filter())
            .with_timer(ClockTime)
            .with_ansi(false)
            .with_writer(self.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn contents(&self) -> String {
        let bytes = match self.buffer.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

/// `scheme://host/...` for logs; the path and query may carry tokens.
pub fn redact_url_for_log(value: &str) -> String {
    match url::Url::parse(value.trim()) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => format!("{}://{host}/...", parsed.scheme()),
            None => format!("{}:...", parsed.scheme()),
        },
        Err(_) => "[invalid-url]".to_string(),
    }
}
