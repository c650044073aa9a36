use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),

    /// Extraction failed in a way that is worth one more attempt with
    /// network-forcing options (the empty-file case).
    #[error("extraction failed (transient): {0}")]
    TransientExtraction(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("trim failed: {0}")]
    TrimFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Validation,
    TransientExtraction,
    Extraction,
    ToolMissing,
    ToolFailed,
    Trim,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Io => "io",
            ErrorKind::Validation => "validation",
            ErrorKind::TransientExtraction => "transient_extraction",
            ErrorKind::Extraction => "extraction",
            ErrorKind::ToolMissing => "tool_missing",
            ErrorKind::ToolFailed => "tool_failed",
            ErrorKind::Trim => "trim",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Io(_) | EngineError::Csv(_) | EngineError::Json(_) => ErrorKind::Io,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::TransientExtraction(_) => ErrorKind::TransientExtraction,
            EngineError::Extraction(_) => ErrorKind::Extraction,
            EngineError::ExternalToolMissing { .. } => ErrorKind::ToolMissing,
            EngineError::ExternalToolFailed { .. } => ErrorKind::ToolFailed,
            EngineError::TrimFailed(_) => ErrorKind::Trim,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
