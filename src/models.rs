use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{EngineError, ErrorCode};

/// Persistent lifecycle status for a download record.
///
/// Transitions only move forward: `Queued -> Transferring -> Extracting -> Completed`,
/// or into `Failed`/`Cancelled` from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Transferring,
    Extracting,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Transferring => "transferring",
            DownloadStatus::Extracting => "extracting",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => DownloadStatus::Queued,
            "transferring" => DownloadStatus::Transferring,
            "extracting" => DownloadStatus::Extracting,
            "completed" => DownloadStatus::Completed,
            "failed" => DownloadStatus::Failed,
            "cancelled" => DownloadStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    /// Position in the lifecycle; terminal states share the last slot.
    pub fn rank(self) -> u8 {
        match self {
            DownloadStatus::Queued => 0,
            DownloadStatus::Transferring => 1,
            DownloadStatus::Extracting => 2,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled => 3,
        }
    }
}

/// Who created a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    UserInitiated,
    FilesystemDiscovered,
}

impl RecordSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordSource::UserInitiated => "user_initiated",
            RecordSource::FilesystemDiscovered => "filesystem_discovered",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "user_initiated" => RecordSource::UserInitiated,
            "filesystem_discovered" => RecordSource::FilesystemDiscovered,
            _ => return None,
        })
    }
}

/// One row of the download ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub item_id: String,
    pub platform_id: String,
    pub status: DownloadStatus,
    pub source: RecordSource,

    /// Set only while `Completed`.
    pub local_path: Option<PathBuf>,
    /// Extracted top-level folder for archive installs.
    pub install_root: Option<PathBuf>,
    pub staged_path: Option<PathBuf>,
    /// Planned destination of the current job.
    pub target_path: Option<PathBuf>,

    pub bytes_total: Option<u64>,
    pub bytes_transferred: u64,

    pub error_code: Option<ErrorCode>,
    pub error_detail: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRecord {
    pub fn progress(&self) -> Progress {
        Progress::new(self.bytes_transferred, self.bytes_total)
    }

    /// Path that Remove deletes for a completed record.
    pub fn owned_path(&self) -> Option<&Path> {
        self.install_root
            .as_deref()
            .or(self.local_path.as_deref())
    }
}

/// Byte progress of a transfer. `percent` is `None` when the total is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
    pub percent: Option<f64>,
}

impl Progress {
    pub fn new(bytes_transferred: u64, bytes_total: Option<u64>) -> Self {
        let percent = match bytes_total {
            Some(0) => Some(100.0),
            Some(total) => Some((bytes_transferred as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        };
        Self {
            bytes_transferred,
            bytes_total,
            percent,
        }
    }
}

/// Where the asset bytes come from.
#[derive(Debug, Clone)]
pub enum RemoteSource {
    /// HTTP(S) endpoint; headers (auth included) are applied verbatim.
    Http { url: Url, headers: HeaderMap },
    /// A file readable on this machine (mounted share, pre-fetched blob).
    Local(PathBuf),
}

/// An already-resolved remote asset handle.
#[derive(Debug, Clone)]
pub struct RemoteRef {
    pub source: RemoteSource,
    /// Expected size from the library catalog, if known.
    pub size_hint: Option<u64>,
}

impl RemoteRef {
    pub fn http(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            source: RemoteSource::Http {
                url: Url::parse(url)?,
                headers: HeaderMap::new(),
            },
            size_hint: None,
        })
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            source: RemoteSource::Local(path.into()),
            size_hint: None,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if let RemoteSource::Http { headers, .. } = &mut self.source {
            headers.insert(name, value);
        }
        self
    }

    /// Attach a pre-encoded `Authorization` value, e.g. `Basic dXNlcjpwYXNz`.
    pub fn with_authorization(self, value: HeaderValue) -> Self {
        self.with_header(AUTHORIZATION, value)
    }

    pub fn with_size_hint(mut self, bytes: u64) -> Self {
        self.size_hint = Some(bytes);
        self
    }

    /// Short description for logs; never includes headers.
    pub fn describe(&self) -> String {
        match &self.source {
            RemoteSource::Http { url, .. } => {
                format!("{}://{}{}", url.scheme(), url.host_str().unwrap_or(""), url.path())
            }
            RemoteSource::Local(path) => path.display().to_string(),
        }
    }
}

/// Post-transfer extraction instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionPlan {
    /// Executable to report as `local_path`, relative to the extracted root.
    pub executable: Option<PathBuf>,
}

/// Where a job stages and lands its output.
///
/// For direct downloads `final_path` is the destination file. For extraction jobs it is
/// the install directory that receives the extracted folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationPlan {
    pub staged_path: PathBuf,
    pub final_path: PathBuf,
    pub extraction: Option<ExtractionPlan>,
}

impl DestinationPlan {
    pub fn direct(staged_path: impl Into<PathBuf>, final_path: impl Into<PathBuf>) -> Self {
        Self {
            staged_path: staged_path.into(),
            final_path: final_path.into(),
            extraction: None,
        }
    }

    pub fn extract(staged_path: impl Into<PathBuf>, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            staged_path: staged_path.into(),
            final_path: install_dir.into(),
            extraction: Some(ExtractionPlan::default()),
        }
    }

    /// Direct download of `file_name` into `folder`, staged next to it as a hidden
    /// `.part` file so the rename stays on one filesystem.
    pub fn direct_into(folder: &Path, file_name: &str) -> Self {
        let name = sanitize_filename::sanitize(file_name);
        Self::direct(folder.join(format!(".{name}.part")), folder.join(name))
    }

    /// Archive download staged in `staging_dir` and extracted into `install_dir`.
    pub fn extract_into(staging_dir: &Path, install_dir: &Path, file_name: &str) -> Self {
        let name = sanitize_filename::sanitize(file_name);
        Self::extract(staging_dir.join(name), install_dir)
    }

    pub fn with_executable(mut self, relative: impl Into<PathBuf>) -> Self {
        let extraction = self.extraction.get_or_insert_with(ExtractionPlan::default);
        extraction.executable = Some(relative.into());
        self
    }

    pub fn requires_extraction(&self) -> bool {
        self.extraction.is_some()
    }

    /// Synchronous checks done before any ledger mutation.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::InvalidDestination(msg));

        if self.staged_path.as_os_str().is_empty() || self.final_path.as_os_str().is_empty() {
            return invalid("staging and final paths must not be empty".to_string());
        }
        if !self.staged_path.is_absolute() {
            return invalid(format!(
                "staging path must be absolute: {}",
                self.staged_path.display()
            ));
        }
        if !self.final_path.is_absolute() {
            return invalid(format!(
                "final path must be absolute: {}",
                self.final_path.display()
            ));
        }
        if self.staged_path.file_name().is_none() {
            return invalid(format!(
                "staging path has no file name: {}",
                self.staged_path.display()
            ));
        }
        if self.staged_path == self.final_path {
            return invalid("staging path and final path are the same".to_string());
        }

        match &self.extraction {
            None => {
                if self.final_path.exists() {
                    return invalid(format!(
                        "destination already exists: {}",
                        self.final_path.display()
                    ));
                }
            }
            Some(plan) => {
                if self.final_path.exists() && !self.final_path.is_dir() {
                    return invalid(format!(
                        "install path is not a directory: {}",
                        self.final_path.display()
                    ));
                }
                if self.staged_path.starts_with(&self.final_path) {
                    return invalid("archive must not be staged inside the install directory".to_string());
                }
                if let Some(exe) = &plan.executable {
                    if exe.is_absolute() {
                        return invalid(format!(
                            "executable must be relative to the extracted folder: {}",
                            exe.display()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Everything `DownloadManager::start` needs for one item.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub item_id: String,
    pub platform_id: String,
    pub remote: RemoteRef,
    pub plan: DestinationPlan,
}

impl DownloadRequest {
    pub fn new(
        item_id: impl Into<String>,
        platform_id: impl Into<String>,
        remote: RemoteRef,
        plan: DestinationPlan,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            platform_id: platform_id.into(),
            remote,
            plan,
        }
    }
}

/// A library entry known to the remote catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryItem {
    pub item_id: String,
    /// Display name, e.g. "Sonic the Hedgehog 2".
    pub name: String,
    /// File name on the server, e.g. "Sonic 2 (USA).zip".
    pub fs_name: Option<String>,
}

impl LibraryItem {
    pub fn new(item_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            name: name.into(),
            fs_name: None,
        }
    }

    pub fn with_fs_name(mut self, fs_name: impl Into<String>) -> Self {
        self.fs_name = Some(fs_name.into());
        self
    }
}

/// Ledger listing filter.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub platform_id: Option<String>,
    pub status: Option<DownloadStatus>,
}

impl RecordFilter {
    pub fn platform(platform_id: impl Into<String>) -> Self {
        Self {
            platform_id: Some(platform_id.into()),
            status: None,
        }
    }

    pub fn status(status: DownloadStatus) -> Self {
        Self {
            platform_id: None,
            status: Some(status),
        }
    }
}
