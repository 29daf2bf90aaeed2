use serde::{Deserialize, Serialize};

/// Stable error codes persisted on failed records and carried by terminal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    DiskError,
    SizeMismatch,
    UnsupportedFormat,
    ExtractionToolUnavailable,
    CorruptArchive,
    Interrupted,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "network_error",
            ErrorCode::DiskError => "disk_error",
            ErrorCode::SizeMismatch => "size_mismatch",
            ErrorCode::UnsupportedFormat => "unsupported_format",
            ErrorCode::ExtractionToolUnavailable => "extraction_tool_unavailable",
            ErrorCode::CorruptArchive => "corrupt_archive",
            ErrorCode::Interrupted => "interrupted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "network_error" => ErrorCode::NetworkError,
            "disk_error" => ErrorCode::DiskError,
            "size_mismatch" => ErrorCode::SizeMismatch,
            "unsupported_format" => ErrorCode::UnsupportedFormat,
            "extraction_tool_unavailable" => ErrorCode::ExtractionToolUnavailable,
            "corrupt_archive" => ErrorCode::CorruptArchive,
            "interrupted" => ErrorCode::Interrupted,
            _ => return None,
        })
    }
}

/// Errors returned synchronously to callers of the download manager.
///
/// None of these mutate the ledger.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("item {0} already has an active download")]
    AlreadyActive(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("no download record for item {0}")]
    NotFound(String),

    #[error("item {0} has no active download")]
    NotActive(String),

    #[error("failed to remove {path}: {source}")]
    Filesystem {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger error: {0:#}")]
    Ledger(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Reasons a running job ends without completing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("network error: {0}")]
    Network(String),

    #[error("disk error: {0}")]
    Disk(String),

    #[error("size_mismatch")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("extraction tool unavailable: {0}")]
    ExtractionToolUnavailable(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("interrupted")]
    Interrupted,

    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    /// `None` for cancellation, which is not a failure.
    pub fn code(&self) -> Option<ErrorCode> {
        Some(match self {
            JobError::Network(_) => ErrorCode::NetworkError,
            JobError::Disk(_) => ErrorCode::DiskError,
            JobError::SizeMismatch { .. } => ErrorCode::SizeMismatch,
            JobError::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            JobError::ExtractionToolUnavailable(_) => ErrorCode::ExtractionToolUnavailable,
            JobError::CorruptArchive(_) => ErrorCode::CorruptArchive,
            JobError::Interrupted => ErrorCode::Interrupted,
            JobError::Cancelled => return None,
        })
    }

    /// Value stored in `error_detail`.
    pub fn detail(&self) -> String {
        match self {
            JobError::SizeMismatch { .. } | JobError::Interrupted | JobError::Cancelled => {
                self.to_string()
            }
            JobError::Network(msg)
            | JobError::Disk(msg)
            | JobError::UnsupportedFormat(msg)
            | JobError::ExtractionToolUnavailable(msg)
            | JobError::CorruptArchive(msg) => {
                format!("{}: {}", self.code().map(ErrorCode::as_str).unwrap_or(""), msg)
            }
        }
    }

    /// The staged archive is kept for inspection when the archive itself or the
    /// local toolchain is at fault.
    pub fn retains_staged(&self) -> bool {
        matches!(
            self,
            JobError::CorruptArchive(_) | JobError::ExtractionToolUnavailable(_)
        )
    }

    pub(crate) fn disk(context: &str, err: std::io::Error) -> Self {
        JobError::Disk(format!("{context}: {err}"))
    }
}
