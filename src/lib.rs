//! RomDeck download and local-library synchronization engine.
//!
//! Downloads game files from a RomM server (or any already-resolved source), optionally
//! extracts archives into install folders, and keeps a persistent ledger of what is on
//! disk in sync with the filesystem. Logging goes through the `log` facade; the host
//! application installs the logger.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod db;
pub mod download_manager;
pub mod error;
pub mod events;
pub mod extractor;
mod fs_utils;
pub mod ledger;
pub mod matcher;
pub mod models;
pub mod reconciler;
pub mod settings;
pub mod tool_manager;
mod transfer;

pub use db::Db;
pub use download_manager::{DownloadManager, JobHandle, LaunchTarget, ManagerConfig};
pub use error::{EngineError, EngineResult, ErrorCode, JobError};
pub use events::{ExtractPhase, JobEvent, ProgressFeed, ProgressPublisher};
pub use extractor::{find_executables, ArchiveFormat};
pub use ledger::{ItemGuard, Ledger};
pub use matcher::{LibraryIndex, MatchOutcome};
pub use models::{
    DestinationPlan, DownloadRecord, DownloadRequest, DownloadStatus, ExtractionPlan,
    LibraryItem, Progress, RecordFilter, RecordSource, RemoteRef, RemoteSource,
};
pub use reconciler::{
    recover_interrupted, OrphanFile, OrphanReason, PlatformScan, ReconcileReport, Reconciler,
};
pub use settings::{EngineSettings, PlatformFolders, SettingsManager};
pub use tool_manager::{ArchiveTool, ToolInfo, ToolManager, ToolManagerConfig};

/// Everything a host needs, wired from the persisted settings.
pub struct Engine {
    settings: EngineSettings,
    ledger: Ledger,
    manager: Arc<DownloadManager>,
    reconciler: Arc<Reconciler>,
}

impl Engine {
    /// Open the engine on the per-user database.
    pub async fn open() -> Result<Self> {
        Self::open_with(Db::open()?).await
    }

    pub async fn open_with(db: Db) -> Result<Self> {
        let settings = SettingsManager::new(db.conn()).get_engine_settings()?;
        let ledger = Ledger::new(db);

        let manager =
            DownloadManager::open(ManagerConfig::from_settings(&settings), ledger.clone()).await?;
        let reconciler = Reconciler::new(ledger.clone(), &settings.library.discovery_extensions);
        log::info!(
            "Engine ready: {} platform(s) configured, {} concurrent job(s)",
            settings.library.platforms.len(),
            manager.config().max_concurrent_jobs
        );

        Ok(Self {
            settings,
            ledger,
            manager: Arc::new(manager),
            reconciler: Arc::new(reconciler),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn manager(&self) -> &Arc<DownloadManager> {
        &self.manager
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Persist new settings. Library folders and discovery extensions apply right away;
    /// transfer and tool settings, and an already running periodic reconcile, pick
    /// them up on the next open.
    pub async fn save_settings(&mut self, settings: EngineSettings) -> Result<()> {
        {
            let db = self.ledger.db();
            let db = db.lock().await;
            SettingsManager::new(db.conn()).save_engine_settings(&settings)?;
        }
        self.reconciler
            .set_extensions(&settings.library.discovery_extensions);
        self.settings = settings;
        Ok(())
    }

    /// Where a download of `file_name` for `platform_id` should go.
    ///
    /// Archives are extracted into the first install dir when the platform has
    /// `auto_extract` set; everything else lands in the ROM folder.
    pub fn plan_for(&self, platform_id: &str, file_name: &str) -> Option<DestinationPlan> {
        let library = &self.settings.library;
        let folders = library.platform(platform_id)?;

        let is_archive = ArchiveFormat::from_path(Path::new(file_name)).is_ok();
        if folders.auto_extract && is_archive {
            if let Some(install_dir) = folders.install_dirs.first() {
                return Some(DestinationPlan::extract_into(
                    &library.staging_dir,
                    install_dir,
                    file_name,
                ));
            }
        }
        folders
            .rom_folder
            .as_deref()
            .map(|folder| DestinationPlan::direct_into(folder, file_name))
    }

    /// Scan descriptions for every configured platform in `library`.
    pub fn scans_for(&self, library: &HashMap<String, Vec<LibraryItem>>) -> Vec<PlatformScan> {
        build_scans(&self.settings.library.platforms, library)
    }

    pub async fn reconcile(
        &self,
        library: &HashMap<String, Vec<LibraryItem>>,
    ) -> Result<ReconcileReport> {
        self.reconciler.run(&self.scans_for(library)).await
    }

    /// Start background reconciliation if `reconcile_interval_secs` is set.
    /// `library` is asked for the current catalog before every run.
    pub fn spawn_periodic_reconcile<F>(
        &self,
        token: CancellationToken,
        library: F,
    ) -> Option<JoinHandle<()>>
    where
        F: Fn() -> HashMap<String, Vec<LibraryItem>> + Send + Sync + 'static,
    {
        let interval = self.settings.library.reconcile_interval()?;
        let platforms = self.settings.library.platforms.clone();
        log::info!("Reconciling every {}s", interval.as_secs());
        Some(
            self.reconciler
                .clone()
                .spawn_periodic(interval, token, move || build_scans(&platforms, &library())),
        )
    }
}

fn build_scans(
    platforms: &[PlatformFolders],
    library: &HashMap<String, Vec<LibraryItem>>,
) -> Vec<PlatformScan> {
    platforms
        .iter()
        .filter_map(|folders| {
            library
                .get(&folders.platform_id)
                .map(|items| PlatformScan::new(folders.clone(), items.clone()))
        })
        .collect()
}
