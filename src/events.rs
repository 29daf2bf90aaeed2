//! Progress Publisher
//!
//! One `watch` channel per running job. Subscribers always see the latest state first,
//! then every later state in lifecycle order, and the feed ends after the terminal event.
//! A reader that observes an event can query the ledger and will see at least that state,
//! because [`JobReporter`] writes the ledger before it publishes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::error::{ErrorCode, JobError};
use crate::ledger::Ledger;
use crate::models::{DownloadRecord, DownloadStatus, Progress};

/// Extraction phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractPhase {
    Start,
    Extracting,
    Done,
}

/// Job state pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum JobEvent {
    Queued {
        item_id: String,
    },
    Transferring {
        item_id: String,
        progress: Progress,
    },
    Extracting {
        item_id: String,
        phase: ExtractPhase,
        entries_done: Option<u64>,
        entries_total: Option<u64>,
    },
    Completed {
        item_id: String,
        local_path: PathBuf,
    },
    Failed {
        item_id: String,
        error_code: ErrorCode,
        error_detail: String,
    },
    Cancelled {
        item_id: String,
    },
}

impl JobEvent {
    pub fn item_id(&self) -> &str {
        match self {
            JobEvent::Queued { item_id }
            | JobEvent::Transferring { item_id, .. }
            | JobEvent::Extracting { item_id, .. }
            | JobEvent::Completed { item_id, .. }
            | JobEvent::Failed { item_id, .. }
            | JobEvent::Cancelled { item_id } => item_id,
        }
    }

    pub fn status(&self) -> DownloadStatus {
        match self {
            JobEvent::Queued { .. } => DownloadStatus::Queued,
            JobEvent::Transferring { .. } => DownloadStatus::Transferring,
            JobEvent::Extracting { .. } => DownloadStatus::Extracting,
            JobEvent::Completed { .. } => DownloadStatus::Completed,
            JobEvent::Failed { .. } => DownloadStatus::Failed,
            JobEvent::Cancelled { .. } => DownloadStatus::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Snapshot event for a record with no live job.
    pub fn from_record(record: &DownloadRecord) -> Self {
        let item_id = record.item_id.clone();
        match record.status {
            DownloadStatus::Queued => JobEvent::Queued { item_id },
            DownloadStatus::Transferring => JobEvent::Transferring {
                item_id,
                progress: record.progress(),
            },
            DownloadStatus::Extracting => JobEvent::Extracting {
                item_id,
                phase: ExtractPhase::Extracting,
                entries_done: None,
                entries_total: None,
            },
            DownloadStatus::Completed => JobEvent::Completed {
                item_id,
                local_path: record.local_path.clone().unwrap_or_default(),
            },
            DownloadStatus::Failed => JobEvent::Failed {
                item_id,
                error_code: record.error_code.unwrap_or(ErrorCode::Interrupted),
                error_detail: record.error_detail.clone().unwrap_or_default(),
            },
            DownloadStatus::Cancelled => JobEvent::Cancelled { item_id },
        }
    }
}

/// Live progress feed for one item.
pub struct ProgressFeed {
    rx: watch::Receiver<JobEvent>,
    started: bool,
    finished: bool,
}

impl ProgressFeed {
    pub(crate) fn new(rx: watch::Receiver<JobEvent>) -> Self {
        Self {
            rx,
            started: false,
            finished: false,
        }
    }

    /// A feed that yields `event` once and ends.
    pub fn snapshot(event: JobEvent) -> Self {
        let (_tx, rx) = watch::channel(event);
        Self::new(rx)
    }

    /// Next state, or `None` once the terminal event has been delivered.
    pub async fn next(&mut self) -> Option<JobEvent> {
        if self.finished {
            return None;
        }
        if self.started && self.rx.changed().await.is_err() {
            self.finished = true;
            return None;
        }
        self.started = true;

        let event = self.rx.borrow_and_update().clone();
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Drain the feed and return its terminal event.
    pub async fn wait_terminal(mut self) -> Option<JobEvent> {
        let mut last = None;
        while let Some(event) = self.next().await {
            last = Some(event);
        }
        last.filter(JobEvent::is_terminal)
    }
}

/// Registry of live job channels keyed by `item_id`.
#[derive(Clone, Default)]
pub struct ProgressPublisher {
    feeds: Arc<RwLock<HashMap<String, (Uuid, watch::Receiver<JobEvent>)>>>,
}

impl ProgressPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel for a new job. The job keeps the sender; dropping it closes feeds.
    pub(crate) async fn open(
        &self,
        item_id: &str,
        job_id: Uuid,
        initial: JobEvent,
    ) -> watch::Sender<JobEvent> {
        let (tx, rx) = watch::channel(initial);
        self.feeds
            .write()
            .await
            .insert(item_id.to_string(), (job_id, rx));
        tx
    }

    /// Unregister a job's channel unless a newer job has replaced it.
    pub(crate) async fn close(&self, item_id: &str, job_id: Uuid) {
        let mut feeds = self.feeds.write().await;
        if feeds.get(item_id).is_some_and(|(id, _)| *id == job_id) {
            feeds.remove(item_id);
        }
    }

    pub async fn subscribe(&self, item_id: &str) -> Option<ProgressFeed> {
        self.feeds
            .read()
            .await
            .get(item_id)
            .map(|(_, rx)| ProgressFeed::new(rx.clone()))
    }
}

/// Writes job state to the ledger, then publishes it, under the item lock.
///
/// Byte and entry progress is coalesced to at most one update per `interval`.
pub(crate) struct JobReporter {
    item_id: String,
    ledger: Ledger,
    tx: watch::Sender<JobEvent>,
    interval: Duration,
    last_emit: Option<Instant>,
}

impl JobReporter {
    pub(crate) fn new(
        item_id: &str,
        ledger: Ledger,
        tx: watch::Sender<JobEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            item_id: item_id.to_string(),
            ledger,
            tx,
            interval,
            last_emit: None,
        }
    }

    pub(crate) fn item_id(&self) -> &str {
        &self.item_id
    }

    fn due(&mut self, force: bool) -> bool {
        let now = Instant::now();
        let due = force
            || self
                .last_emit
                .map_or(true, |last| now.duration_since(last) >= self.interval);
        if due {
            self.last_emit = Some(now);
        }
        due
    }

    pub(crate) async fn transferring(&mut self, bytes_total: Option<u64>) -> Result<()> {
        let guard = self.ledger.lock_item(&self.item_id).await;
        self.ledger.set_transferring(&guard, bytes_total).await?;
        self.tx.send_replace(JobEvent::Transferring {
            item_id: self.item_id.clone(),
            progress: Progress::new(0, bytes_total),
        });
        self.last_emit = Some(Instant::now());
        Ok(())
    }

    /// Coalesced byte progress. Ledger failures are logged; the transfer carries on.
    pub(crate) async fn transfer_progress(&mut self, done: u64, total: Option<u64>, force: bool) {
        if !self.due(force) {
            return;
        }
        let guard = self.ledger.lock_item(&self.item_id).await;
        match self.ledger.update_progress(&guard, done, total).await {
            Ok(()) => {
                self.tx.send_replace(JobEvent::Transferring {
                    item_id: self.item_id.clone(),
                    progress: Progress::new(done, total),
                });
            }
            Err(e) => log::warn!("Failed to record progress for {}: {:#}", self.item_id, e),
        }
    }

    pub(crate) async fn extracting(&mut self) -> Result<()> {
        let guard = self.ledger.lock_item(&self.item_id).await;
        self.ledger.set_extracting(&guard).await?;
        self.tx.send_replace(JobEvent::Extracting {
            item_id: self.item_id.clone(),
            phase: ExtractPhase::Start,
            entries_done: None,
            entries_total: None,
        });
        self.last_emit = Some(Instant::now());
        Ok(())
    }

    /// Extraction phase/entry progress. Not persisted; the ledger only tracks the status.
    pub(crate) fn extract_progress(
        &mut self,
        phase: ExtractPhase,
        entries_done: Option<u64>,
        entries_total: Option<u64>,
    ) {
        let force = phase != ExtractPhase::Extracting;
        if !self.due(force) {
            return;
        }
        self.tx.send_replace(JobEvent::Extracting {
            item_id: self.item_id.clone(),
            phase,
            entries_done,
            entries_total,
        });
    }

    pub(crate) async fn completed(
        &mut self,
        local_path: &Path,
        install_root: Option<&Path>,
    ) -> Result<()> {
        let guard = self.ledger.lock_item(&self.item_id).await;
        self.ledger
            .set_completed(&guard, local_path, install_root)
            .await?;
        self.tx.send_replace(JobEvent::Completed {
            item_id: self.item_id.clone(),
            local_path: local_path.to_path_buf(),
        });
        Ok(())
    }

    pub(crate) async fn failed(&mut self, err: &JobError, retained_staged: Option<&Path>) -> Result<()> {
        let Some(code) = err.code() else {
            return self.cancelled().await;
        };
        let detail = err.detail();
        let guard = self.ledger.lock_item(&self.item_id).await;
        self.ledger
            .set_failed(&guard, code, &detail, retained_staged)
            .await?;
        self.tx.send_replace(JobEvent::Failed {
            item_id: self.item_id.clone(),
            error_code: code,
            error_detail: detail,
        });
        Ok(())
    }

    pub(crate) async fn cancelled(&mut self) -> Result<()> {
        let guard = self.ledger.lock_item(&self.item_id).await;
        self.ledger.set_cancelled(&guard).await?;
        self.tx.send_replace(JobEvent::Cancelled {
            item_id: self.item_id.clone(),
        });
        Ok(())
    }
}
