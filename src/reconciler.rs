//! Filesystem Reconciler
//!
//! Keeps the ledger in line with what is actually on disk: completed records whose files
//! disappeared are pruned, and library items found in the configured folders are adopted
//! as `filesystem_discovered` records. Startup recovery of interrupted jobs lives here too.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, JobError};
use crate::extractor::partial_dir_for;
use crate::fs_utils;
use crate::ledger::Ledger;
use crate::matcher::{LibraryIndex, MatchOutcome};
use crate::models::{DownloadRecord, DownloadStatus, LibraryItem, RecordFilter};
use crate::settings::PlatformFolders;

/// Folders and known items for one platform.
#[derive(Debug, Clone)]
pub struct PlatformScan {
    pub folders: PlatformFolders,
    pub items: Vec<LibraryItem>,
}

impl PlatformScan {
    pub fn new(folders: PlatformFolders, items: Vec<LibraryItem>) -> Self {
        Self { folders, items }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrphanReason {
    Unmatched,
    Ambiguous { candidates: Vec<String> },
    /// The item is already recorded as downloaded at another path.
    AlreadyRecorded { item_id: String, recorded_path: PathBuf },
}

/// A file or folder that could not be tied to exactly one library item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanFile {
    pub platform_id: String,
    pub path: PathBuf,
    pub reason: OrphanReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub orphans: Vec<OrphanFile>,
    pub skipped_active: Vec<String>,
}

impl ReconcileReport {
    /// Ledger rows inserted or deleted by the run.
    pub fn mutations(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

pub struct Reconciler {
    ledger: Ledger,
    extensions: std::sync::RwLock<HashSet<String>>,
    gate: Mutex<()>,
}

fn extension_set(extensions: &[String]) -> HashSet<String> {
    extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect()
}

impl Reconciler {
    pub fn new(ledger: Ledger, extensions: &[String]) -> Self {
        Self {
            ledger,
            extensions: std::sync::RwLock::new(extension_set(extensions)),
            gate: Mutex::new(()),
        }
    }

    /// Replace the file extensions considered during discovery. Applies from the next run.
    pub fn set_extensions(&self, extensions: &[String]) {
        *self
            .extensions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = extension_set(extensions);
    }

    /// Prune vanished records, then discover files for every platform.
    pub async fn run(&self, scans: &[PlatformScan]) -> Result<ReconcileReport> {
        let _gate = self.gate.lock().await;
        let mut report = ReconcileReport::default();

        self.prune(&mut report).await?;
        for scan in scans {
            self.discover(scan, &mut report).await?;
        }

        log::info!(
            "Reconciled library: {} added, {} removed, {} orphans, {} skipped",
            report.added.len(),
            report.removed.len(),
            report.orphans.len(),
            report.skipped_active.len()
        );
        Ok(report)
    }

    async fn prune(&self, report: &mut ReconcileReport) -> Result<()> {
        let completed = self
            .ledger
            .list(&RecordFilter::status(DownloadStatus::Completed))
            .await?;

        for record in completed {
            let Some(path) = record.owned_path() else {
                continue;
            };
            if !is_missing(path).await {
                continue;
            }

            let guard = self.ledger.lock_item(&record.item_id).await;
            let Some(current) = self.ledger.get(&record.item_id).await? else {
                continue;
            };
            if current.status != DownloadStatus::Completed {
                continue;
            }
            let still_missing = match current.owned_path() {
                Some(current_path) => is_missing(current_path).await,
                None => false,
            };
            if !still_missing {
                continue;
            }

            if self.ledger.delete(&guard).await? {
                log::info!(
                    "Pruned {}: {} no longer exists",
                    record.item_id,
                    path.display()
                );
                report.removed.push(record.item_id.clone());
            }
        }
        Ok(())
    }

    async fn discover(&self, scan: &PlatformScan, report: &mut ReconcileReport) -> Result<()> {
        let platform_id = scan.folders.platform_id.as_str();
        let index = LibraryIndex::new(&scan.items);

        let mut entries: Vec<(PathBuf, bool)> = Vec::new();
        if let Some(rom_folder) = &scan.folders.rom_folder {
            let files = list_entries(rom_folder, false).await;
            let extensions = self
                .extensions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.extend(
                files
                    .into_iter()
                    .filter(|path| has_known_extension(&extensions, path))
                    .map(|path| (path, false)),
            );
        }
        for install_dir in &scan.folders.install_dirs {
            for path in list_entries(install_dir, true).await {
                entries.push((path, true));
            }
        }
        entries.sort();
        entries.dedup();

        for (path, is_dir) in entries {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let reason = match index.match_entry(&name, is_dir) {
                MatchOutcome::Matched(item_id) => {
                    self.adopt(platform_id, &item_id, &path, is_dir, report)
                        .await?;
                    continue;
                }
                MatchOutcome::Ambiguous(candidates) => OrphanReason::Ambiguous { candidates },
                MatchOutcome::Unmatched => OrphanReason::Unmatched,
            };
            log::debug!("Orphan {}: {:?}", path.display(), reason);
            report.orphans.push(OrphanFile {
                platform_id: platform_id.to_string(),
                path,
                reason,
            });
        }
        Ok(())
    }

    async fn adopt(
        &self,
        platform_id: &str,
        item_id: &str,
        path: &Path,
        is_dir: bool,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let guard = self.ledger.lock_item(item_id).await;
        match self.ledger.get(item_id).await? {
            Some(record) if !record.status.is_terminal() => {
                report.skipped_active.push(item_id.to_string());
            }
            Some(record) if record.status == DownloadStatus::Completed => {
                let same = record.owned_path() == Some(path)
                    || record.local_path.as_deref() == Some(path);
                if !same {
                    report.orphans.push(OrphanFile {
                        platform_id: platform_id.to_string(),
                        path: path.to_path_buf(),
                        reason: OrphanReason::AlreadyRecorded {
                            item_id: item_id.to_string(),
                            recorded_path: record.owned_path().map(Path::to_path_buf).unwrap_or_default(),
                        },
                    });
                }
            }
            previous => {
                // A retained archive from a failed attempt is no longer needed.
                if let Some(record) = previous.filter(|r| r.staged_path.as_deref() != Some(path)) {
                    discard_leftovers(&record).await;
                }
                let size = if is_dir {
                    None
                } else {
                    fs::metadata(path).await.ok().map(|m| m.len())
                };
                let install_root = is_dir.then_some(path);
                if self
                    .ledger
                    .insert_discovered(&guard, platform_id, path, install_root, size)
                    .await?
                {
                    log::info!("Discovered {} at {}", item_id, path.display());
                    report.added.push(item_id.to_string());
                }
            }
        }
        Ok(())
    }

    /// Run on a timer until `token` is cancelled. `scans` is called before each run.
    pub fn spawn_periodic<F>(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
        scans: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Vec<PlatformScan> + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let scans = scans();
                        if let Err(e) = self.run(&scans).await {
                            log::warn!("Periodic reconciliation failed: {:#}", e);
                        }
                    }
                }
            }
            log::debug!("Periodic reconciliation stopped");
        })
    }
}

/// Mark every non-terminal record as interrupted and remove its leftovers.
///
/// Must run before any job is started in this process; jobs are never resumed.
pub async fn recover_interrupted(ledger: &Ledger) -> Result<Vec<String>> {
    let mut recovered = Vec::new();

    for record in ledger.list_active().await? {
        let guard = ledger.lock_item(&record.item_id).await;
        let Some(current) = ledger.get(&record.item_id).await? else {
            continue;
        };
        if current.status.is_terminal() {
            continue;
        }

        discard_leftovers(&current).await;
        ledger
            .set_failed(&guard, ErrorCode::Interrupted, &JobError::Interrupted.detail(), None)
            .await?;
        log::warn!(
            "Download of {} was interrupted while {}",
            current.item_id,
            current.status.as_str()
        );
        recovered.push(current.item_id);
    }
    Ok(recovered)
}

/// Remove the staged file and any partial extraction directory a record points at.
pub(crate) async fn discard_leftovers(record: &DownloadRecord) {
    if let Some(staged) = &record.staged_path {
        fs_utils::discard(staged).await;
        if let Some(target) = &record.target_path {
            fs_utils::discard(&partial_dir_for(target, staged)).await;
        }
    }
}

fn has_known_extension(extensions: &HashSet<String>, path: &Path) -> bool {
    path.extension()
        .map(|e| extensions.contains(&e.to_string_lossy().to_lowercase()))
        .unwrap_or(false)
}

async fn is_missing(path: &Path) -> bool {
    matches!(fs::try_exists(path).await, Ok(false))
}

/// Visible entries of `dir` that are directories (`want_dirs`) or files.
async fn list_entries(dir: &Path, want_dirs: bool) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("Skipping {}: {}", dir.display(), e);
            return found;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                log::warn!("Error reading {}: {}", dir.display(), e);
                break;
            }
        };
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let Ok(meta) = fs::metadata(&path).await else {
            continue;
        };
        if meta.is_dir() == want_dirs && (want_dirs || meta.is_file()) {
            found.push(path);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        roms: PathBuf,
        games: PathBuf,
        ledger: Ledger,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let roms = dir.path().join("roms/md");
        let games = dir.path().join("games");
        std::fs::create_dir_all(&roms).unwrap();
        std::fs::create_dir_all(&games).unwrap();
        let ledger = Ledger::in_memory().unwrap();
        let extensions = vec!["zip".to_string(), "md".to_string()];
        let reconciler = Reconciler::new(ledger.clone(), &extensions);
        Fixture {
            _dir: dir,
            roms,
            games,
            ledger,
            reconciler,
        }
    }

    fn scan(f: &Fixture, items: Vec<LibraryItem>) -> Vec<PlatformScan> {
        let mut folders = PlatformFolders::new("md");
        folders.rom_folder = Some(f.roms.clone());
        folders.install_dirs = vec![f.games.clone()];
        vec![PlatformScan::new(folders, items)]
    }

    fn sonic() -> LibraryItem {
        LibraryItem::new("1", "Sonic 2").with_fs_name("Sonic 2 (USA).zip")
    }

    #[tokio::test]
    async fn test_discovers_file_and_is_idempotent() {
        let f = fixture();
        let rom = f.roms.join("Sonic2.zip");
        std::fs::write(&rom, b"1234").unwrap();
        std::fs::write(f.roms.join(".Sonic2.zip.part"), b"12").unwrap();
        std::fs::write(f.roms.join("notes.txt"), b"x").unwrap();
        let scans = scan(&f, vec![sonic()]);

        let report = f.reconciler.run(&scans).await.unwrap();
        assert_eq!(report.added, vec!["1".to_string()]);
        assert!(report.orphans.is_empty());

        let record = f.ledger.get("1").await.unwrap().unwrap();
        assert_eq!(record.status, DownloadStatus::Completed);
        assert_eq!(record.source, crate::models::RecordSource::FilesystemDiscovered);
        assert_eq!(record.local_path, Some(rom));
        assert_eq!(record.bytes_total, Some(4));

        let again = f.reconciler.run(&scans).await.unwrap();
        assert_eq!(again.mutations(), 0);
    }

    #[tokio::test]
    async fn test_discovers_install_folder() {
        let f = fixture();
        let folder = f.games.join("Doom");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::create_dir_all(f.games.join(".Doom.zip.partial")).unwrap();

        let report = f
            .reconciler
            .run(&scan(&f, vec![LibraryItem::new("5", "DOOM")]))
            .await
            .unwrap();
        assert_eq!(report.added, vec!["5".to_string()]);
        let record = f.ledger.get("5").await.unwrap().unwrap();
        assert_eq!(record.install_root, Some(folder.clone()));
        assert_eq!(record.local_path, Some(folder));
    }

    #[tokio::test]
    async fn test_prunes_vanished_files() {
        let f = fixture();
        let rom = f.roms.join("Sonic2.zip");
        std::fs::write(&rom, b"1234").unwrap();
        let scans = scan(&f, vec![sonic()]);
        f.reconciler.run(&scans).await.unwrap();

        std::fs::remove_file(&rom).unwrap();
        let report = f.reconciler.run(&scans).await.unwrap();
        assert_eq!(report.removed, vec!["1".to_string()]);
        assert!(f.ledger.get("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ambiguous_file_is_an_orphan() {
        let f = fixture();
        std::fs::write(f.roms.join("Tetris.zip"), b"x").unwrap();
        let items = vec![
            LibraryItem::new("3", "Tetris (World)"),
            LibraryItem::new("4", "Tetris (Japan)"),
        ];

        let report = f.reconciler.run(&scan(&f, items)).await.unwrap();
        assert_eq!(report.mutations(), 0);
        assert_eq!(
            report.orphans[0].reason,
            OrphanReason::Ambiguous {
                candidates: vec!["3".into(), "4".into()]
            }
        );
        assert!(f.ledger.list(&RecordFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_and_failed_records() {
        let f = fixture();
        std::fs::write(f.roms.join("Sonic2.zip"), b"1234").unwrap();
        {
            let guard = f.ledger.lock_item("1").await;
            f.ledger
                .insert_queued(&guard, "md", &f.roms.join(".x.part"), &f.roms.join("x"), None)
                .await
                .unwrap();
        }
        let scans = scan(&f, vec![sonic()]);

        let report = f.reconciler.run(&scans).await.unwrap();
        assert_eq!(report.skipped_active, vec!["1".to_string()]);
        assert_eq!(
            f.ledger.get("1").await.unwrap().unwrap().status,
            DownloadStatus::Queued
        );

        {
            let guard = f.ledger.lock_item("1").await;
            f.ledger
                .set_failed(&guard, ErrorCode::NetworkError, "network_error: reset", None)
                .await
                .unwrap();
        }
        let report = f.reconciler.run(&scans).await.unwrap();
        assert_eq!(report.added, vec!["1".to_string()]);
        assert_eq!(
            f.ledger.get("1").await.unwrap().unwrap().status,
            DownloadStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_adopting_over_failed_extraction_drops_retained_archive() {
        let f = fixture();
        let staging = f._dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let archive = staging.join("Doom.7z");
        std::fs::write(&archive, b"not really 7z").unwrap();
        {
            let guard = f.ledger.lock_item("5").await;
            f.ledger
                .insert_queued(&guard, "md", &archive, &f.games, None)
                .await
                .unwrap();
            f.ledger
                .set_failed(
                    &guard,
                    ErrorCode::CorruptArchive,
                    "corrupt_archive: not a 7z archive",
                    Some(&archive),
                )
                .await
                .unwrap();
        }
        assert_eq!(
            f.ledger.get("5").await.unwrap().unwrap().staged_path,
            Some(archive.clone())
        );
        std::fs::create_dir_all(f.games.join("Doom")).unwrap();

        let report = f
            .reconciler
            .run(&scan(&f, vec![LibraryItem::new("5", "DOOM")]))
            .await
            .unwrap();
        assert_eq!(report.added, vec!["5".to_string()]);
        let record = f.ledger.get("5").await.unwrap().unwrap();
        assert_eq!(record.status, DownloadStatus::Completed);
        assert!(record.staged_path.is_none());
        assert!(!archive.exists());
    }

    #[tokio::test]
    async fn test_second_copy_is_reported_as_already_recorded() {
        let f = fixture();
        std::fs::write(f.roms.join("Sonic 2 (USA).zip"), b"1").unwrap();
        std::fs::write(f.roms.join("Sonic2.md"), b"2").unwrap();

        let report = f.reconciler.run(&scan(&f, vec![sonic()])).await.unwrap();
        assert_eq!(report.added.len(), 1);
        assert_eq!(report.orphans.len(), 1);
        assert!(matches!(
            report.orphans[0].reason,
            OrphanReason::AlreadyRecorded { .. }
        ));
    }

    #[tokio::test]
    async fn test_recover_interrupted_cleans_leftovers() {
        let f = fixture();
        let staged = f.roms.join(".Sonic2.zip.part");
        std::fs::write(&staged, b"12").unwrap();
        {
            let guard = f.ledger.lock_item("1").await;
            f.ledger
                .insert_queued(&guard, "md", &staged, &f.roms.join("Sonic2.zip"), Some(4))
                .await
                .unwrap();
            f.ledger.set_transferring(&guard, Some(4)).await.unwrap();
        }

        let recovered = recover_interrupted(&f.ledger).await.unwrap();
        assert_eq!(recovered, vec!["1".to_string()]);
        assert!(!staged.exists());

        let record = f.ledger.get("1").await.unwrap().unwrap();
        assert_eq!(record.status, DownloadStatus::Failed);
        assert_eq!(record.error_code, Some(ErrorCode::Interrupted));
        assert_eq!(record.error_detail.as_deref(), Some("interrupted"));
    }

    #[tokio::test]
    async fn test_spawn_periodic_runs_until_cancelled() {
        let f = fixture();
        std::fs::write(f.roms.join("Sonic2.zip"), b"1234").unwrap();
        let scans = scan(&f, vec![sonic()]);
        let reconciler = Arc::new(Reconciler::new(f.ledger.clone(), &["zip".to_string()]));
        let token = CancellationToken::new();

        let handle = reconciler.spawn_periodic(Duration::from_millis(10), token.clone(), move || {
            scans.clone()
        });

        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if f.ledger.get("1").await.unwrap().is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(found.is_ok());

        token.cancel();
        handle.await.unwrap();
    }
}
