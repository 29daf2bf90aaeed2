//! Tool Manager
//!
//! Discovery and health checks for the external extractors used for `.7z` archives
//! (7-Zip's `7z`, the standalone `7zz`, and `unar`).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x08000000;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::settings::ExtractionSettings;

/// External extractors, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveTool {
    SevenZip,
    SevenZipStandalone,
    Unar,
}

impl ArchiveTool {
    pub const ALL: [ArchiveTool; 3] = [
        ArchiveTool::SevenZip,
        ArchiveTool::SevenZipStandalone,
        ArchiveTool::Unar,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveTool::SevenZip => "7z",
            ArchiveTool::SevenZipStandalone => "7zz",
            ArchiveTool::Unar => "unar",
        }
    }

    pub fn binary_name(&self) -> &'static str {
        #[cfg(target_os = "windows")]
        {
            match self {
                ArchiveTool::SevenZip => "7z.exe",
                ArchiveTool::SevenZipStandalone => "7zz.exe",
                ArchiveTool::Unar => "unar.exe",
            }
        }
        #[cfg(not(target_os = "windows"))]
        {
            self.as_str()
        }
    }

    /// Guess the tool kind from a configured binary path.
    pub fn from_path(path: &Path) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match stem.as_str() {
            "unar" => ArchiveTool::Unar,
            "7zz" => ArchiveTool::SevenZipStandalone,
            _ => ArchiveTool::SevenZip,
        }
    }

    pub fn version_args(&self) -> &[&str] {
        match self {
            // 7-Zip prints its banner on any invocation.
            ArchiveTool::SevenZip | ArchiveTool::SevenZipStandalone => &["i"],
            ArchiveTool::Unar => &["--version"],
        }
    }

    /// Arguments for a full-path, overwrite-everything extraction of `archive` into `dest`.
    pub fn extract_args(&self, archive: &Path, dest: &Path) -> Vec<OsString> {
        match self {
            ArchiveTool::SevenZip | ArchiveTool::SevenZipStandalone => {
                let mut out_dir = OsString::from("-o");
                out_dir.push(dest);
                vec![
                    OsString::from("x"),
                    archive.as_os_str().to_os_string(),
                    out_dir,
                    OsString::from("-y"),
                ]
            }
            ArchiveTool::Unar => vec![
                OsString::from("-o"),
                dest.as_os_str().to_os_string(),
                OsString::from("-f"),
                archive.as_os_str().to_os_string(),
            ],
        }
    }
}

/// A located, runnable extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub tool: ArchiveTool,
    pub path: PathBuf,
    pub version: Option<String>,
}

/// Tool Manager configuration.
#[derive(Debug, Clone)]
pub struct ToolManagerConfig {
    /// Explicitly configured binary, tried first.
    pub explicit_path: Option<PathBuf>,
    /// Extra directories to probe before the platform defaults.
    pub search_dirs: Vec<PathBuf>,
    /// Whether to fall back to the system PATH.
    pub use_system_path: bool,
    /// How long to wait for version checks.
    pub version_timeout: Duration,
}

impl Default for ToolManagerConfig {
    fn default() -> Self {
        Self {
            explicit_path: None,
            search_dirs: Vec::new(),
            use_system_path: true,
            version_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ExtractionSettings> for ToolManagerConfig {
    fn from(settings: &ExtractionSettings) -> Self {
        Self {
            explicit_path: settings.seven_zip_path.clone(),
            search_dirs: settings.tool_search_dirs.clone(),
            use_system_path: settings.use_system_path,
            ..Self::default()
        }
    }
}

/// Install locations that are not usually on PATH.
pub(crate) fn platform_dirs() -> Vec<PathBuf> {
    #[allow(unused_mut)]
    let mut dirs = Vec::new();

    #[cfg(windows)]
    for var in ["ProgramFiles", "ProgramFiles(x86)", "ProgramW6432"] {
        if let Some(base) = std::env::var_os(var) {
            dirs.push(PathBuf::from(base).join("7-Zip"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        // Homebrew on Apple Silicon and Intel
        dirs.push(PathBuf::from("/opt/homebrew/bin"));
        dirs.push(PathBuf::from("/usr/local/bin"));
    }

    dirs
}

/// Tool Manager handles extractor discovery and validation.
#[derive(Debug, Clone)]
pub struct ToolManager {
    config: ToolManagerConfig,
}

impl ToolManager {
    pub fn new(config: ToolManagerConfig) -> Self {
        Self { config }
    }

    /// Directories probed for `tool`, in order. PATH lookup comes after these.
    pub fn candidates(&self, tool: ArchiveTool) -> Vec<PathBuf> {
        self.config
            .search_dirs
            .iter()
            .cloned()
            .chain(platform_dirs())
            .map(|dir| dir.join(tool.binary_name()))
            .collect()
    }

    /// Find the best available path for a tool.
    ///
    /// Priority:
    /// 1. Configured search directories
    /// 2. Platform install locations (e.g. `Program Files\7-Zip`)
    /// 3. System PATH
    pub async fn find_tool(&self, tool: ArchiveTool) -> Option<PathBuf> {
        for path in self.candidates(tool) {
            if path.exists() && self.check_health(&path, tool).await.is_ok() {
                return Some(path);
            }
        }

        if self.config.use_system_path {
            if let Ok(path) = which::which(tool.binary_name()) {
                if self.check_health(&path, tool).await.is_ok() {
                    return Some(path);
                }
            }
        }

        None
    }

    /// First usable extractor, honoring an explicitly configured binary.
    pub async fn find_extractor(&self) -> Option<ToolInfo> {
        if let Some(path) = &self.config.explicit_path {
            let tool = ArchiveTool::from_path(path);
            match self.check_health(path, tool).await {
                Ok(()) => return Some(self.describe(tool, path.clone()).await),
                Err(e) => log::warn!(
                    "Configured extractor {} is not usable: {:#}",
                    path.display(),
                    e
                ),
            }
        }

        for tool in ArchiveTool::ALL {
            if let Some(path) = self.find_tool(tool).await {
                log::info!("Using {} at {}", tool.as_str(), path.display());
                return Some(self.describe(tool, path).await);
            }
        }

        None
    }

    async fn describe(&self, tool: ArchiveTool, path: PathBuf) -> ToolInfo {
        let version = self.get_version(&path, tool).await.ok().flatten();
        ToolInfo {
            tool,
            path,
            version,
        }
    }

    /// Check that a tool binary exists and can be executed.
    async fn check_health(&self, path: &Path, tool: ArchiveTool) -> Result<()> {
        if !path.exists() {
            return Err(anyhow!("Tool binary does not exist: {}", path.display()));
        }
        self.get_version(path, tool).await?;
        Ok(())
    }

    /// Run the tool's version command. `Ok(None)` means it ran but printed no version.
    pub async fn get_version(&self, path: &Path, tool: ArchiveTool) -> Result<Option<String>> {
        let mut cmd = Command::new(path);
        cmd.args(tool.version_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let output = tokio::time::timeout(self.config.version_timeout, cmd.output())
            .await
            .context("Version check timed out")?
            .context("Failed to execute tool")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_version(&stdout))
    }
}

/// Parse a version number out of a tool banner.
///
/// `7-Zip [64] 16.02 : Copyright ...` -> `16.02`, `v1.10.7` -> `1.10.7`.
fn parse_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .map(|token| token.trim_start_matches('v'))
        .find(|token| {
            token.starts_with(|c: char| c.is_ascii_digit())
                && token.contains('.')
                && token.chars().all(|c| c.is_ascii_digit() || c == '.')
        })
        .map(str::to_string)
}
