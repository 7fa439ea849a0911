use thiserror::Error;

/// Failure taxonomy of the forensic pipeline.
///
/// Page-scoped variants (`DecodeError`, `ModelInferenceError`) are recorded inside the page's
/// result; `LocalizationFailed` and `StorageUploadFailed` never invalidate a computed score.
#[derive(Error, Debug)]
pub enum ForensicError {
    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to decode input: {0}")]
    DecodeError(String),

    #[error("classifier inference failed: {0}")]
    ModelInferenceError(String),

    #[error("localization map generation failed: {0}")]
    LocalizationFailed(String),

    #[error("artifact upload to {key} failed: {reason}")]
    StorageUploadFailed { key: String, reason: String },

    /// A batch worker panicked or was cancelled before producing a report.
    #[error("analysis worker failed: {0}")]
    WorkerFailed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForensicError {
    /// Stable name written into serialized records.
    pub fn kind(&self) -> &'static str {
        match self {
            ForensicError::UnsupportedFormat(_) => "UnsupportedFormat",
            ForensicError::DecodeError(_) => "DecodeError",
            ForensicError::ModelInferenceError(_) => "ModelInferenceError",
            ForensicError::LocalizationFailed(_) => "LocalizationFailed",
            ForensicError::StorageUploadFailed { .. } => "StorageUploadFailed",
            ForensicError::WorkerFailed(_) => "WorkerFailed",
            ForensicError::Config(_) => "ConfigError",
            ForensicError::Io(_) => "IoError",
        }
    }
}

impl From<image::ImageError> for ForensicError {
    fn from(e: image::ImageError) -> Self {
        ForensicError::DecodeError(e.to_string())
    }
}

impl From<lopdf::Error> for ForensicError {
    fn from(e: lopdf::Error) -> Self {
        ForensicError::DecodeError(format!("PDF parse error: {}", e))
    }
}

impl From<candle_core::Error> for ForensicError {
    fn from(e: candle_core::Error) -> Self {
        ForensicError::ModelInferenceError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ForensicError>;
