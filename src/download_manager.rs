//! Download Manager
//!
//! Caller-facing entry point: starts, cancels and removes downloads, and hands out
//! progress feeds. Each job runs as its own task behind a semaphore; the ledger is the
//! source of truth and is written before anything is published.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::fs;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, JobError};
use crate::events::{JobEvent, JobReporter, ProgressFeed, ProgressPublisher};
use crate::extractor::{find_executables, partial_dir_for, ArchiveExtractor, ArchiveFormat};
use crate::fs_utils;
use crate::ledger::Ledger;
use crate::models::{
    DestinationPlan, DownloadRecord, DownloadRequest, DownloadStatus, RecordFilter, RemoteRef,
};
use crate::reconciler::{discard_leftovers, recover_interrupted};
use crate::settings::EngineSettings;
use crate::tool_manager::{ToolManager, ToolManagerConfig};
use crate::transfer::TransferWorker;

/// Download manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_concurrent_jobs: usize,
    pub progress_interval: Duration,
    pub connect_timeout: Duration,
    pub stall_timeout: Duration,
    pub chunk_size: usize,
    pub tools: ToolManagerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

impl ManagerConfig {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        let transfers = &settings.transfers;
        Self {
            max_concurrent_jobs: transfers.max_concurrent_jobs.max(1) as usize,
            progress_interval: Duration::from_millis(transfers.progress_interval_ms),
            connect_timeout: Duration::from_secs(transfers.connect_timeout_secs),
            stall_timeout: Duration::from_secs(transfers.stall_timeout_secs),
            chunk_size: transfers.chunk_size,
            tools: ToolManagerConfig::from(&settings.extraction),
        }
    }
}

/// Handle returned by [`DownloadManager::start`].
pub struct JobHandle {
    item_id: String,
    job_id: Uuid,
    feed: ProgressFeed,
}

impl JobHandle {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub async fn next(&mut self) -> Option<JobEvent> {
        self.feed.next().await
    }

    /// Wait for the terminal event.
    pub async fn wait(self) -> Option<JobEvent> {
        self.feed.wait_terminal().await
    }

    pub fn into_feed(self) -> ProgressFeed {
        self.feed
    }
}

/// Paths an external launcher needs to register an installed game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchTarget {
    pub install_root: PathBuf,
    /// Designated executable, if the job named one and it exists.
    pub executable: Option<PathBuf>,
    /// Every `.exe` under the install root.
    pub candidates: Vec<PathBuf>,
}

struct ActiveJob {
    job_id: Uuid,
    token: CancellationToken,
    /// Paths this job writes to; no other job may use them while it runs.
    claims: Vec<PathBuf>,
}

/// Files and directories a job creates while running.
fn claimed_paths(plan: &DestinationPlan) -> Vec<PathBuf> {
    let mut claims = vec![plan.staged_path.clone()];
    if plan.requires_extraction() {
        claims.push(partial_dir_for(&plan.final_path, &plan.staged_path));
    } else {
        claims.push(plan.final_path.clone());
    }
    claims
}

/// State shared between the manager and its job tasks.
#[derive(Clone)]
struct Shared {
    ledger: Ledger,
    publisher: ProgressPublisher,
    worker: Arc<TransferWorker>,
    extractor: Arc<ArchiveExtractor>,
    active: Arc<RwLock<HashMap<String, ActiveJob>>>,
    permits: Arc<Semaphore>,
}

/// Where a successful job put its output.
struct Landed {
    local_path: PathBuf,
    install_root: Option<PathBuf>,
}

pub struct DownloadManager {
    config: ManagerConfig,
    shared: Shared,
}

impl DownloadManager {
    /// Open the manager over `ledger`, recovering jobs left unfinished by a previous run.
    pub async fn open(config: ManagerConfig, ledger: Ledger) -> Result<Self> {
        let recovered = recover_interrupted(&ledger).await?;
        if !recovered.is_empty() {
            log::info!("Marked {} interrupted download(s) as failed", recovered.len());
        }

        let worker = TransferWorker::new(
            config.connect_timeout,
            config.stall_timeout,
            config.chunk_size,
        )?;
        let extractor = ArchiveExtractor::new(ToolManager::new(config.tools.clone()));

        let shared = Shared {
            ledger,
            publisher: ProgressPublisher::new(),
            worker: Arc::new(worker),
            extractor: Arc::new(extractor),
            active: Arc::new(RwLock::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
        };
        Ok(Self { config, shared })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.shared.ledger
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Queue a download. The job waits in `Queued` until a slot is free.
    pub async fn start(&self, request: DownloadRequest) -> EngineResult<JobHandle> {
        request.plan.validate()?;
        let DownloadRequest {
            item_id,
            platform_id,
            remote,
            plan,
        } = request;

        let guard = self.shared.ledger.lock_item(&item_id).await;
        let claims = claimed_paths(&plan);
        let mut active = self.shared.active.write().await;
        if let Some((other, path)) = active.iter().find_map(|(other, job)| {
            (*other != item_id)
                .then(|| claims.iter().find(|path| job.claims.contains(*path)))
                .flatten()
                .map(|path| (other, path))
        }) {
            return Err(EngineError::InvalidDestination(format!(
                "{} is in use by the download of {}",
                path.display(),
                other
            )));
        }

        let inserted = self
            .shared
            .ledger
            .insert_queued(
                &guard,
                &platform_id,
                &plan.staged_path,
                &plan.final_path,
                remote.size_hint,
            )
            .await?;
        if inserted.is_none() {
            return Err(EngineError::AlreadyActive(item_id));
        }

        let job_id = Uuid::new_v4();
        let token = CancellationToken::new();
        let tx = self
            .shared
            .publisher
            .open(
                &item_id,
                job_id,
                JobEvent::Queued {
                    item_id: item_id.clone(),
                },
            )
            .await;
        let feed = ProgressFeed::new(tx.subscribe());
        active.insert(
            item_id.clone(),
            ActiveJob {
                job_id,
                token: token.clone(),
                claims,
            },
        );
        drop(active);
        drop(guard);

        log::info!(
            "Queued {} from {} ({})",
            item_id,
            remote.describe(),
            if plan.requires_extraction() {
                "extract"
            } else {
                "direct"
            }
        );

        let reporter = JobReporter::new(
            &item_id,
            self.shared.ledger.clone(),
            tx,
            self.config.progress_interval,
        );
        let shared = self.shared.clone();
        let job_item = item_id.clone();
        tokio::spawn(async move {
            run_job(shared, job_item, job_id, remote, plan, token, reporter).await;
        });

        Ok(JobHandle {
            item_id,
            job_id,
            feed,
        })
    }

    /// Request cooperative cancellation. The job settles as `Cancelled` on its own.
    pub async fn cancel(&self, item_id: &str) -> EngineResult<()> {
        let guard = self.shared.ledger.lock_item(item_id).await;
        let record = match self.shared.ledger.get(item_id).await? {
            Some(record) if !record.status.is_terminal() => record,
            _ => return Err(EngineError::NotActive(item_id.to_string())),
        };

        let token = self
            .shared
            .active
            .read()
            .await
            .get(item_id)
            .map(|job| job.token.clone());
        match token {
            Some(token) => {
                token.cancel();
                log::info!("Cancellation requested for {}", item_id);
            }
            None => {
                // Record outlived its job; settle it directly.
                log::warn!("No running job for {}, marking it cancelled", item_id);
                discard_leftovers(&record).await;
                self.shared.ledger.set_cancelled(&guard).await?;
            }
        }
        Ok(())
    }

    pub async fn status(&self, item_id: &str) -> EngineResult<DownloadRecord> {
        self.shared
            .ledger
            .get(item_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(item_id.to_string()))
    }

    /// Live feed for a running job, or a one-shot snapshot of the stored record.
    pub async fn subscribe(&self, item_id: &str) -> EngineResult<ProgressFeed> {
        if let Some(feed) = self.shared.publisher.subscribe(item_id).await {
            return Ok(feed);
        }
        let record = self.status(item_id).await?;
        Ok(ProgressFeed::snapshot(JobEvent::from_record(&record)))
    }

    /// Delete the item's local files and its record. Active jobs are cancelled first.
    ///
    /// Returns the paths that were deleted.
    pub async fn remove(&self, item_id: &str) -> EngineResult<Vec<PathBuf>> {
        let record = self.status(item_id).await?;
        if !record.status.is_terminal() {
            let feed = self.subscribe(item_id).await?;
            match self.cancel(item_id).await {
                Ok(()) | Err(EngineError::NotActive(_)) => {}
                Err(e) => return Err(e),
            }
            feed.wait_terminal().await;
        }

        let guard = self.shared.ledger.lock_item(item_id).await;
        let Some(record) = self.shared.ledger.get(item_id).await? else {
            return Err(EngineError::NotFound(item_id.to_string()));
        };
        if !record.status.is_terminal() {
            // Restarted while we waited.
            return Err(EngineError::AlreadyActive(item_id.to_string()));
        }

        let mut targets: Vec<&Path> = Vec::new();
        if record.status == DownloadStatus::Completed {
            targets.extend(record.owned_path());
        }
        targets.extend(record.staged_path.as_deref());

        let mut removed = Vec::new();
        for path in targets {
            match fs_utils::remove_path(path).await {
                Ok(true) => removed.push(path.to_path_buf()),
                Ok(false) => {}
                Err(source) => {
                    return Err(EngineError::Filesystem {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }
        }

        self.shared.ledger.delete(&guard).await?;
        log::info!("Removed {} ({} path(s) deleted)", item_id, removed.len());
        Ok(removed)
    }

    pub async fn records(&self, filter: &RecordFilter) -> EngineResult<Vec<DownloadRecord>> {
        Ok(self.shared.ledger.list(filter).await?)
    }

    /// Items with a completed download.
    pub async fn downloaded_item_ids(&self) -> EngineResult<HashSet<String>> {
        let completed = self
            .shared
            .ledger
            .list(&RecordFilter::status(DownloadStatus::Completed))
            .await?;
        Ok(completed.into_iter().map(|r| r.item_id).collect())
    }

    pub async fn launch_target(&self, item_id: &str) -> EngineResult<LaunchTarget> {
        let record = self.status(item_id).await?;
        let not_installed = || EngineError::NotFound(format!("{item_id} (not installed)"));
        if record.status != DownloadStatus::Completed {
            return Err(not_installed());
        }
        let install_root = record
            .owned_path()
            .map(Path::to_path_buf)
            .ok_or_else(not_installed)?;

        let executable = record
            .local_path
            .clone()
            .filter(|path| *path != install_root && path.is_file());
        let candidates = if install_root.is_dir() {
            let root = install_root.clone();
            tokio::task::spawn_blocking(move || find_executables(&root))
                .await
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(LaunchTarget {
            install_root,
            executable,
            candidates,
        })
    }

    pub async fn is_active(&self, item_id: &str) -> bool {
        self.shared.active.read().await.contains_key(item_id)
    }

    pub async fn active_count(&self) -> usize {
        self.shared.active.read().await.len()
    }

    /// Cancel every running job and wait for each to settle.
    pub async fn shutdown(&self) {
        let jobs: Vec<(String, CancellationToken)> = self
            .shared
            .active
            .read()
            .await
            .iter()
            .map(|(id, job)| (id.clone(), job.token.clone()))
            .collect();

        let mut feeds = Vec::new();
        for (item_id, token) in jobs {
            if let Some(feed) = self.shared.publisher.subscribe(&item_id).await {
                feeds.push(feed);
            }
            token.cancel();
        }
        for feed in feeds {
            feed.wait_terminal().await;
        }
        log::info!("Download manager shut down");
    }
}

async fn run_job(
    shared: Shared,
    item_id: String,
    job_id: Uuid,
    remote: RemoteRef,
    plan: DestinationPlan,
    token: CancellationToken,
    mut reporter: JobReporter,
) {
    let outcome = execute(&shared, &remote, &plan, &token, &mut reporter).await;
    finish(&mut reporter, &plan, outcome).await;

    {
        let mut active = shared.active.write().await;
        if active.get(&item_id).is_some_and(|job| job.job_id == job_id) {
            active.remove(&item_id);
        }
    }
    shared.publisher.close(&item_id, job_id).await;
}

async fn execute(
    shared: &Shared,
    remote: &RemoteRef,
    plan: &DestinationPlan,
    token: &CancellationToken,
    reporter: &mut JobReporter,
) -> Result<Landed, JobError> {
    if plan.requires_extraction() {
        ArchiveFormat::from_path(&plan.staged_path)?;
    }

    let _permit = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(JobError::Cancelled),
        permit = shared.permits.clone().acquire_owned() => {
            permit.map_err(|_| JobError::Cancelled)?
        }
    };

    reporter
        .transferring(remote.size_hint)
        .await
        .map_err(ledger_error)?;
    shared
        .worker
        .run(remote, &plan.staged_path, token, reporter)
        .await?;

    if token.is_cancelled() {
        return Err(JobError::Cancelled);
    }

    match &plan.extraction {
        None => {
            if let Some(parent) = plan.final_path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| JobError::disk("create destination dir", e))?;
            }
            if fs::try_exists(&plan.final_path).await.unwrap_or(false) {
                return Err(JobError::Disk(format!(
                    "destination already exists: {}",
                    plan.final_path.display()
                )));
            }
            fs_utils::move_file(&plan.staged_path, &plan.final_path)
                .await
                .map_err(|e| JobError::disk("move into place", e))?;
            Ok(Landed {
                local_path: plan.final_path.clone(),
                install_root: None,
            })
        }
        Some(extraction) => {
            reporter.extracting().await.map_err(ledger_error)?;
            let output = shared
                .extractor
                .extract(&plan.staged_path, &plan.final_path, extraction, token, reporter)
                .await?;
            Ok(Landed {
                local_path: output.local_path,
                install_root: Some(output.install_root),
            })
        }
    }
}

/// Clean up, then write and publish the terminal state.
async fn finish(reporter: &mut JobReporter, plan: &DestinationPlan, outcome: Result<Landed, JobError>) {
    let result = match outcome {
        Ok(landed) => {
            log::info!(
                "Download of {} completed: {}",
                reporter.item_id(),
                landed.local_path.display()
            );
            reporter
                .completed(&landed.local_path, landed.install_root.as_deref())
                .await
        }
        Err(err) => {
            let retained = err.retains_staged().then_some(plan.staged_path.as_path());
            if retained.is_none() {
                fs_utils::discard(&plan.staged_path).await;
            }
            match &err {
                JobError::Cancelled => log::info!("Download of {} cancelled", reporter.item_id()),
                other => log::warn!("Download of {} failed: {}", reporter.item_id(), other),
            }
            reporter.failed(&err, retained).await
        }
    };
    if let Err(e) = result {
        log::error!(
            "Failed to record final state for {}: {:#}",
            reporter.item_id(),
            e
        );
    }
}

fn ledger_error(e: anyhow::Error) -> JobError {
    JobError::Disk(format!("ledger: {e:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::error::ErrorCode;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(max_concurrent_jobs: usize) -> ManagerConfig {
        ManagerConfig {
            max_concurrent_jobs,
            progress_interval: Duration::ZERO,
            connect_timeout: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(10),
            chunk_size: 64 * 1024,
            tools: ToolManagerConfig {
                use_system_path: false,
                ..ToolManagerConfig::default()
            },
        }
    }

    async fn manager() -> DownloadManager {
        DownloadManager::open(test_config(2), Ledger::in_memory().unwrap())
            .await
            .unwrap()
    }

    async fn serve(server: &MockServer, route: &str, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(response)
            .mount(server)
            .await;
    }

    fn remote(server: &MockServer, route: &str) -> RemoteRef {
        RemoteRef::http(&format!("{}{}", server.uri(), route)).unwrap()
    }

    /// Serves response headers for `total` bytes, sends `first` of them, then goes quiet.
    async fn trickle_server(total: usize, first: usize) -> RemoteRef {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = [0u8; 1024];
                    let _ = socket.read(&mut request).await;
                    let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {total}\r\n\r\n");
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&vec![7u8; first]).await;
                    let _ = socket.flush().await;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });
        RemoteRef::http(&format!("http://{addr}/roms/20/content")).unwrap()
    }

    async fn wait_for_bytes(dm: &DownloadManager, item_id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while dm.status(item_id).await.unwrap().bytes_transferred == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            for (name, data) in entries {
                zip.start_file(*name, options).unwrap();
                zip.write_all(data).unwrap();
            }
            zip.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn test_direct_download_completes() {
        let server = MockServer::start().await;
        serve(&server, "/roms/1/content", ResponseTemplate::new(200).set_body_bytes(vec![3u8; 1024])).await;
        let dir = tempfile::tempdir().unwrap();
        let plan = DestinationPlan::direct_into(&dir.path().join("roms/md"), "Sonic 2.md");
        let final_path = plan.final_path.clone();
        let staged = plan.staged_path.clone();

        let dm = manager().await;
        let handle = dm
            .start(DownloadRequest::new(
                "1",
                "md",
                remote(&server, "/roms/1/content").with_size_hint(1024),
                plan,
            ))
            .await
            .unwrap();

        let last = handle.wait().await.unwrap();
        assert_eq!(
            last,
            JobEvent::Completed {
                item_id: "1".into(),
                local_path: final_path.clone(),
            }
        );

        let record = dm.status("1").await.unwrap();
        assert_eq!(record.status, DownloadStatus::Completed);
        assert_eq!(record.local_path, Some(final_path.clone()));
        assert_eq!(record.bytes_transferred, 1024);
        assert!(record.staged_path.is_none());
        assert_eq!(std::fs::metadata(&final_path).unwrap().len(), 1024);
        assert!(!staged.exists());
        assert!(dm.downloaded_item_ids().await.unwrap().contains("1"));
    }

    #[tokio::test]
    async fn test_size_mismatch_fails_and_cleans_up() {
        let server = MockServer::start().await;
        serve(&server, "/roms/2/content", ResponseTemplate::new(200).set_body_bytes(vec![0u8; 20])).await;
        let dir = tempfile::tempdir().unwrap();
        let plan = DestinationPlan::direct_into(dir.path(), "game.nes");
        let (staged, final_path) = (plan.staged_path.clone(), plan.final_path.clone());

        let dm = manager().await;
        let handle = dm
            .start(DownloadRequest::new(
                "2",
                "nes",
                remote(&server, "/roms/2/content").with_size_hint(10),
                plan,
            ))
            .await
            .unwrap();

        match handle.wait().await.unwrap() {
            JobEvent::Failed {
                error_code,
                error_detail,
                ..
            } => {
                assert_eq!(error_code, ErrorCode::SizeMismatch);
                assert_eq!(error_detail, "size_mismatch");
            }
            other => panic!("unexpected {other:?}"),
        }
        let record = dm.status("2").await.unwrap();
        assert_eq!(record.status, DownloadStatus::Failed);
        assert!(record.local_path.is_none());
        assert!(!staged.exists());
        assert!(!final_path.exists());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_headers() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 64])
                .set_delay(Duration::from_secs(30)),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let plan = DestinationPlan::direct_into(dir.path(), "slow.gba");
        let (staged, final_path) = (plan.staged_path.clone(), plan.final_path.clone());

        let dm = manager().await;
        let handle = dm
            .start(DownloadRequest::new("3", "gba", remote(&server, "/slow"), plan))
            .await
            .unwrap();

        dm.cancel("3").await.unwrap();
        let last = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last, JobEvent::Cancelled { item_id: "3".into() });

        let record = dm.status("3").await.unwrap();
        assert_eq!(record.status, DownloadStatus::Cancelled);
        assert!(!staged.exists());
        assert!(!final_path.exists());
        assert!(matches!(dm.cancel("3").await, Err(EngineError::NotActive(_))));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let plan = DestinationPlan::direct_into(dir.path(), "big.iso");
        let (staged, final_path) = (plan.staged_path.clone(), plan.final_path.clone());

        let dm = manager().await;
        let handle = dm
            .start(DownloadRequest::new(
                "20",
                "ps2",
                trickle_server(1_000_000, 4096).await,
                plan,
            ))
            .await
            .unwrap();

        wait_for_bytes(&dm, "20").await;
        assert!(staged.exists());
        dm.cancel("20").await.unwrap();

        let last = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last, JobEvent::Cancelled { item_id: "20".into() });
        assert_eq!(dm.status("20").await.unwrap().status, DownloadStatus::Cancelled);
        assert!(!staged.exists());
        assert!(!final_path.exists());
    }

    #[tokio::test]
    async fn test_stalled_body_fails_with_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let plan = DestinationPlan::direct_into(dir.path(), "stuck.iso");
        let staged = plan.staged_path.clone();

        let config = ManagerConfig {
            stall_timeout: Duration::from_secs(1),
            ..test_config(2)
        };
        let dm = DownloadManager::open(config, Ledger::in_memory().unwrap())
            .await
            .unwrap();
        let handle = dm
            .start(DownloadRequest::new(
                "21",
                "ps2",
                trickle_server(1_000_000, 4096).await,
                plan,
            ))
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap()
        {
            JobEvent::Failed {
                error_code,
                error_detail,
                ..
            } => {
                assert_eq!(error_code, ErrorCode::NetworkError);
                assert!(error_detail.contains("no data received"), "{error_detail}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_missing_response_headers_time_out() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/hung",
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 64])
                .set_delay(Duration::from_secs(4)),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();

        let config = ManagerConfig {
            stall_timeout: Duration::from_secs(1),
            ..test_config(2)
        };
        let dm = DownloadManager::open(config, Ledger::in_memory().unwrap())
            .await
            .unwrap();
        let handle = dm
            .start(DownloadRequest::new(
                "22",
                "gba",
                remote(&server, "/hung"),
                DestinationPlan::direct_into(dir.path(), "hung.gba"),
            ))
            .await
            .unwrap();

        let last = tokio::time::timeout(Duration::from_secs(3), handle.wait())
            .await
            .unwrap()
            .unwrap();
        match last {
            JobEvent::Failed { error_code, .. } => assert_eq!(error_code, ErrorCode::NetworkError),
            other => panic!("unexpected {other:?}"),
        }
        let record = dm.status("22").await.unwrap();
        assert_eq!(record.status, DownloadStatus::Failed);
        assert!(record.error_detail.unwrap().starts_with("network_error: timeout"));
    }

    #[tokio::test]
    async fn test_jobs_cannot_share_staging_or_partial_paths() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 64])
                .set_delay(Duration::from_secs(30)),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let plan = DestinationPlan::direct_into(dir.path(), "Game.gba");
        let games = dir.path().join("games");

        let dm = manager().await;
        dm.start(DownloadRequest::new("a", "gba", remote(&server, "/slow"), plan.clone()))
            .await
            .unwrap();
        let clash = dm
            .start(DownloadRequest::new("b", "gba", remote(&server, "/slow"), plan))
            .await;
        assert!(matches!(clash, Err(EngineError::InvalidDestination(_))));
        assert!(matches!(dm.status("b").await, Err(EngineError::NotFound(_))));

        dm.start(DownloadRequest::new(
            "c",
            "dos",
            remote(&server, "/slow"),
            DestinationPlan::extract_into(&dir.path().join("staging-1"), &games, "Doom.zip"),
        ))
        .await
        .unwrap();
        let clash = dm
            .start(DownloadRequest::new(
                "d",
                "dos",
                remote(&server, "/slow"),
                DestinationPlan::extract_into(&dir.path().join("staging-2"), &games, "Doom.zip"),
            ))
            .await;
        assert!(matches!(clash, Err(EngineError::InvalidDestination(_))));

        dm.start(DownloadRequest::new(
            "e",
            "dos",
            remote(&server, "/slow"),
            DestinationPlan::extract_into(&dir.path().join("staging-2"), &games, "Quake.zip"),
        ))
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), dm.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_without_running_job_discards_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let install_dir = dir.path().join("games");
        let staged = dir.path().join("staging/Doom.zip");
        let partial = partial_dir_for(&install_dir, &staged);
        std::fs::create_dir_all(staged.parent().unwrap()).unwrap();
        std::fs::write(&staged, b"PK").unwrap();
        std::fs::create_dir_all(&partial).unwrap();

        let dm = manager().await;
        {
            let ledger = dm.ledger();
            let guard = ledger.lock_item("23").await;
            ledger
                .insert_queued(&guard, "dos", &staged, &install_dir, None)
                .await
                .unwrap()
                .unwrap();
        }

        dm.cancel("23").await.unwrap();
        assert_eq!(dm.status("23").await.unwrap().status, DownloadStatus::Cancelled);
        assert!(!staged.exists());
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn test_second_start_is_already_active() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 64])
                .set_delay(Duration::from_secs(30)),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let plan = DestinationPlan::direct_into(dir.path(), "a.gba");

        let dm = manager().await;
        let handle = dm
            .start(DownloadRequest::new("4", "gba", remote(&server, "/slow"), plan.clone()))
            .await
            .unwrap();
        let second = dm
            .start(DownloadRequest::new("4", "gba", remote(&server, "/slow"), plan))
            .await;
        assert!(matches!(second, Err(EngineError::AlreadyActive(_))));

        dm.cancel("4").await.unwrap();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_destination_leaves_ledger_untouched() {
        let dm = manager().await;
        let result = dm
            .start(DownloadRequest::new(
                "5",
                "gba",
                RemoteRef::http("http://127.0.0.1:9/x").unwrap(),
                DestinationPlan::direct("relative/.a.part", "/abs/a.gba"),
            ))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidDestination(_))));
        assert!(matches!(dm.status("5").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_http_error_is_network_failure() {
        let server = MockServer::start().await;
        serve(&server, "/missing", ResponseTemplate::new(404)).await;
        let dir = tempfile::tempdir().unwrap();

        let dm = manager().await;
        let handle = dm
            .start(DownloadRequest::new(
                "6",
                "snes",
                remote(&server, "/missing"),
                DestinationPlan::direct_into(dir.path(), "m.sfc"),
            ))
            .await
            .unwrap();

        match handle.wait().await.unwrap() {
            JobEvent::Failed { error_code, .. } => assert_eq!(error_code, ErrorCode::NetworkError),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zip_install_launch_target_and_remove() {
        let server = MockServer::start().await;
        let body = zip_bytes(&[("DOOM.EXE", b"MZ"), ("SETUP.EXE", b"MZ"), ("DOOM1.WAD", b"IWAD")]);
        serve(&server, "/roms/7/content", ResponseTemplate::new(200).set_body_bytes(body)).await;
        let dir = tempfile::tempdir().unwrap();
        let install_dir = dir.path().join("games");
        let plan = DestinationPlan::extract_into(&dir.path().join("staging"), &install_dir, "Doom.zip")
            .with_executable("DOOM.EXE");
        let staged = plan.staged_path.clone();

        let dm = manager().await;
        let handle = dm
            .start(DownloadRequest::new("7", "dos", remote(&server, "/roms/7/content"), plan))
            .await
            .unwrap();
        let last = handle.wait().await.unwrap();
        let root = install_dir.join("Doom");
        assert_eq!(
            last,
            JobEvent::Completed {
                item_id: "7".into(),
                local_path: root.join("DOOM.EXE"),
            }
        );
        assert!(!staged.exists());

        let record = dm.status("7").await.unwrap();
        assert_eq!(record.install_root, Some(root.clone()));

        let target = dm.launch_target("7").await.unwrap();
        assert_eq!(target.install_root, root);
        assert_eq!(target.executable, Some(root.join("DOOM.EXE")));
        assert_eq!(
            target.candidates,
            vec![root.join("DOOM.EXE"), root.join("SETUP.EXE")]
        );

        let removed = dm.remove("7").await.unwrap();
        assert_eq!(removed, vec![root.clone()]);
        assert!(!root.exists());
        assert!(matches!(dm.status("7").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_corrupt_7z_keeps_staged_archive_until_removed() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/roms/8/content",
            ResponseTemplate::new(200).set_body_bytes(b"definitely not 7z".to_vec()),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let install_dir = dir.path().join("games");
        let plan = DestinationPlan::extract_into(&dir.path().join("staging"), &install_dir, "Quake.7z");
        let staged = plan.staged_path.clone();

        let dm = manager().await;
        let handle = dm
            .start(DownloadRequest::new("8", "dos", remote(&server, "/roms/8/content"), plan))
            .await
            .unwrap();
        match handle.wait().await.unwrap() {
            JobEvent::Failed { error_code, .. } => assert_eq!(error_code, ErrorCode::CorruptArchive),
            other => panic!("unexpected {other:?}"),
        }

        let record = dm.status("8").await.unwrap();
        assert_eq!(record.staged_path, Some(staged.clone()));
        assert!(staged.exists());
        assert_eq!(std::fs::read_dir(&install_dir).unwrap().count(), 0);

        let removed = dm.remove("8").await.unwrap();
        assert_eq!(removed, vec![staged.clone()]);
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_unsupported_format_fails_before_transfer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let plan = DestinationPlan::extract_into(&dir.path().join("staging"), &dir.path().join("games"), "game.rar");

        let dm = manager().await;
        let handle = dm
            .start(DownloadRequest::new("9", "pc", remote(&server, "/roms/9/content"), plan))
            .await
            .unwrap();
        match handle.wait().await.unwrap() {
            JobEvent::Failed { error_code, .. } => {
                assert_eq!(error_code, ErrorCode::UnsupportedFormat)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(dm.status("9").await.unwrap().bytes_transferred, 0);
    }

    #[tokio::test]
    async fn test_restart_marks_unfinished_jobs_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("romdeck.db");
        let staged = dir.path().join(".game.nes.part");
        std::fs::write(&staged, b"half").unwrap();
        {
            let ledger = Ledger::new(Db::open_at(&db_path).unwrap());
            let guard = ledger.lock_item("10").await;
            ledger
                .insert_queued(&guard, "nes", &staged, &dir.path().join("game.nes"), Some(8))
                .await
                .unwrap();
            ledger.set_transferring(&guard, Some(8)).await.unwrap();
            ledger.update_progress(&guard, 4, Some(8)).await.unwrap();
        }

        let dm = DownloadManager::open(test_config(2), Ledger::new(Db::open_at(&db_path).unwrap()))
            .await
            .unwrap();
        let record = dm.status("10").await.unwrap();
        assert_eq!(record.status, DownloadStatus::Failed);
        assert_eq!(record.error_code, Some(ErrorCode::Interrupted));
        assert_eq!(record.error_detail.as_deref(), Some("interrupted"));
        assert!(!staged.exists());

        let mut feed = dm.subscribe("10").await.unwrap();
        assert_eq!(feed.next().await.unwrap().status(), DownloadStatus::Failed);
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_items() {
        let dm = manager().await;
        assert!(matches!(dm.status("x").await, Err(EngineError::NotFound(_))));
        assert!(matches!(dm.cancel("x").await, Err(EngineError::NotActive(_))));
        assert!(matches!(dm.remove("x").await, Err(EngineError::NotFound(_))));
        assert!(matches!(dm.subscribe("x").await, Err(EngineError::NotFound(_))));
        assert!(matches!(dm.launch_target("x").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_active_job_cancels_first() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 64])
                .set_delay(Duration::from_secs(30)),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();

        let dm = manager().await;
        let _handle = dm
            .start(DownloadRequest::new(
                "11",
                "gba",
                remote(&server, "/slow"),
                DestinationPlan::direct_into(dir.path(), "b.gba"),
            ))
            .await
            .unwrap();

        let removed = tokio::time::timeout(Duration::from_secs(5), dm.remove("11"))
            .await
            .unwrap()
            .unwrap();
        assert!(removed.is_empty());
        assert!(matches!(dm.status("11").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrency_cap_holds_jobs_in_queued() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/a",
            ResponseTemplate::new(200)
                .set_body_bytes(vec![1u8; 32])
                .set_delay(Duration::from_millis(300)),
        )
        .await;
        serve(
            &server,
            "/b",
            ResponseTemplate::new(200)
                .set_body_bytes(vec![2u8; 32])
                .set_delay(Duration::from_millis(300)),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();

        let dm = DownloadManager::open(test_config(1), Ledger::in_memory().unwrap())
            .await
            .unwrap();
        let a = dm
            .start(DownloadRequest::new(
                "a",
                "gb",
                remote(&server, "/a"),
                DestinationPlan::direct_into(dir.path(), "a.gb"),
            ))
            .await
            .unwrap();
        let b = dm
            .start(DownloadRequest::new(
                "b",
                "gb",
                remote(&server, "/b"),
                DestinationPlan::direct_into(dir.path(), "b.gb"),
            ))
            .await
            .unwrap();

        let ledger = dm.ledger().clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while ledger
                .count_by_status(DownloadStatus::Transferring)
                .await
                .unwrap()
                == 0
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(ledger.count_by_status(DownloadStatus::Transferring).await.unwrap(), 1);
        assert_eq!(ledger.count_by_status(DownloadStatus::Queued).await.unwrap(), 1);

        assert_eq!(a.wait().await.unwrap().status(), DownloadStatus::Completed);
        assert_eq!(b.wait().await.unwrap().status(), DownloadStatus::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_jobs() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 64])
                .set_delay(Duration::from_secs(30)),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();

        let dm = manager().await;
        dm.start(DownloadRequest::new(
            "12",
            "gba",
            remote(&server, "/slow"),
            DestinationPlan::direct_into(dir.path(), "c.gba"),
        ))
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), dm.shutdown())
            .await
            .unwrap();
        assert_eq!(dm.status("12").await.unwrap().status, DownloadStatus::Cancelled);
    }
}
