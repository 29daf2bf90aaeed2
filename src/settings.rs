//! Settings Manager
//!
//! Handles persistence and retrieval of engine configuration using SQLite.
//! Settings are stored as JSON values keyed by setting name.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Engine settings structure with all configurable options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Transfer and scheduling settings
    #[serde(default)]
    pub transfers: TransferSettings,

    /// Archive extraction settings
    #[serde(default)]
    pub extraction: ExtractionSettings,

    /// Local library layout and reconciliation
    #[serde(default)]
    pub library: LibrarySettings,
}

/// Transfer and scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Maximum jobs transferring or extracting at once.
    #[serde(default = "default_concurrency")]
    pub max_concurrent_jobs: u32,

    /// Minimum time between progress updates for one job.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// TCP/TLS connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// A transfer that receives no data for this long fails with a network error.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    /// Read buffer for local sources.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_concurrency(),
            progress_interval_ms: default_progress_interval_ms(),
            connect_timeout_secs: default_connect_timeout(),
            stall_timeout_secs: default_stall_timeout(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Archive extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSettings {
    /// Explicit 7-Zip (or compatible) binary; tried before anything else.
    #[serde(default)]
    pub seven_zip_path: Option<PathBuf>,

    /// Extra directories searched for 7z/7zz/unar.
    #[serde(default)]
    pub tool_search_dirs: Vec<PathBuf>,

    /// Fall back to the system PATH.
    #[serde(default = "default_true")]
    pub use_system_path: bool,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            seven_zip_path: None,
            tool_search_dirs: Vec::new(),
            use_system_path: true,
        }
    }
}

/// Folders for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFolders {
    pub platform_id: String,

    /// Where plain ROM files land.
    #[serde(default)]
    pub rom_folder: Option<PathBuf>,

    /// Where archives are extracted, one folder per game.
    #[serde(default)]
    pub install_dirs: Vec<PathBuf>,

    /// Extract archives after download instead of keeping them.
    #[serde(default)]
    pub auto_extract: bool,
}

impl PlatformFolders {
    pub fn new(platform_id: impl Into<String>) -> Self {
        Self {
            platform_id: platform_id.into(),
            rom_folder: None,
            install_dirs: Vec::new(),
            auto_extract: false,
        }
    }
}

/// Local library settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarySettings {
    /// Where archives are staged before extraction.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    #[serde(default)]
    pub platforms: Vec<PlatformFolders>,

    /// File extensions (lowercase, no dot) considered during discovery.
    #[serde(default = "default_discovery_extensions")]
    pub discovery_extensions: Vec<String>,

    /// Background reconciliation period; `None` disables it.
    #[serde(default)]
    pub reconcile_interval_secs: Option<u64>,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            platforms: Vec::new(),
            discovery_extensions: default_discovery_extensions(),
            reconcile_interval_secs: None,
        }
    }
}

impl LibrarySettings {
    pub fn platform(&self, platform_id: &str) -> Option<&PlatformFolders> {
        self.platforms.iter().find(|p| p.platform_id == platform_id)
    }

    /// Insert or replace the folders for a platform.
    pub fn upsert_platform(&mut self, folders: PlatformFolders) {
        match self
            .platforms
            .iter_mut()
            .find(|p| p.platform_id == folders.platform_id)
        {
            Some(existing) => *existing = folders,
            None => self.platforms.push(folders),
        }
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        self.reconcile_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

// Default value functions
fn default_concurrency() -> u32 {
    2
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_stall_timeout() -> u64 {
    60
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_staging_dir() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("romdeck-staging")
}

fn default_discovery_extensions() -> Vec<String> {
    [
        "zip", "7z", "rar", "iso", "chd", "cue", "bin", "img", "cso", "pbp", "rvz", "wbfs",
        "gcm", "nes", "fds", "sfc", "smc", "gb", "gbc", "gba", "nds", "3ds", "cia", "n64",
        "z64", "v64", "md", "gen", "smd", "sms", "gg", "32x", "pce", "ngp", "ngc", "ws", "wsc",
        "a26", "a78", "lnx", "xci", "nsp", "wad", "m3u",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Settings keys used in the database.
pub mod keys {
    pub const ENGINE_SETTINGS: &str = "engine_settings";
}

/// Settings manager for reading and writing settings to the database.
pub struct SettingsManager<'a> {
    conn: &'a Connection,
}

impl<'a> SettingsManager<'a> {
    /// Create a new settings manager with a database connection.
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Get a setting value by key.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let result: Option<String> = self
            .conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query settings")?;

        match result {
            Some(json) => {
                let value: T =
                    serde_json::from_str(&json).context("Failed to deserialize setting")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value by key.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).context("Failed to serialize setting")?;

        self.conn
            .execute(
                "INSERT INTO settings (key, value_json) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
                params![key, json],
            )
            .context("Failed to save setting")?;

        Ok(())
    }

    /// Get the engine settings, returning defaults if not set.
    pub fn get_engine_settings(&self) -> Result<EngineSettings> {
        self.get::<EngineSettings>(keys::ENGINE_SETTINGS)
            .map(|opt| opt.unwrap_or_default())
    }

    /// Save engine settings.
    pub fn save_engine_settings(&self, settings: &EngineSettings) -> Result<()> {
        self.set(keys::ENGINE_SETTINGS, settings)
    }

    /// Persist the folders for one platform, keeping everything else.
    pub fn save_platform_folders(&self, folders: PlatformFolders) -> Result<()> {
        let mut settings = self.get_engine_settings()?;
        settings.library.upsert_platform(folders);
        self.save_engine_settings(&settings)
    }
}
