//! Ledger Store
//!
//! Async, shareable access to the download ledger. Every mutation of a record takes an
//! [`ItemGuard`] for that record, which serializes writers per `item_id` while leaving
//! different items free to proceed concurrently.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::Db;
use crate::error::ErrorCode;
use crate::models::{DownloadRecord, DownloadStatus, RecordFilter};

type LockMap = Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Proof that the holder owns the write lock for one item.
pub struct ItemGuard {
    item_id: String,
    lock: OwnedMutexGuard<()>,
    locks: LockMap,
}

impl ItemGuard {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }
}

impl Drop for ItemGuard {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let held = OwnedMutexGuard::mutex(&self.lock);
        // One reference in the map, one in this guard: nobody else is waiting.
        if Arc::strong_count(held) == 2
            && locks
                .get(&self.item_id)
                .is_some_and(|entry| Arc::ptr_eq(entry, held))
        {
            locks.remove(&self.item_id);
        }
    }
}

#[derive(Clone)]
pub struct Ledger {
    db: Arc<Mutex<Db>>,
    locks: LockMap,
}

impl Ledger {
    pub fn new(db: Db) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Db::open_in_memory()?))
    }

    /// Shared database handle, for settings access.
    pub fn db(&self) -> Arc<Mutex<Db>> {
        self.db.clone()
    }

    /// Wait for exclusive write access to `item_id`.
    pub async fn lock_item(&self, item_id: &str) -> ItemGuard {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(item_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        ItemGuard {
            item_id: item_id.to_string(),
            lock: lock.lock_owned().await,
            locks: self.locks.clone(),
        }
    }

    pub async fn get(&self, item_id: &str) -> Result<Option<DownloadRecord>> {
        self.db.lock().await.get(item_id)
    }

    pub async fn list(&self, filter: &RecordFilter) -> Result<Vec<DownloadRecord>> {
        self.db.lock().await.list(filter)
    }

    pub async fn list_active(&self) -> Result<Vec<DownloadRecord>> {
        self.db.lock().await.list_active()
    }

    pub async fn count_by_status(&self, status: DownloadStatus) -> Result<u64> {
        self.db.lock().await.count_by_status(status)
    }

    /// Create or replace the record as `Queued`. `Ok(None)` means a non-terminal record exists.
    pub async fn insert_queued(
        &self,
        guard: &ItemGuard,
        platform_id: &str,
        staged_path: &Path,
        target_path: &Path,
        bytes_total: Option<u64>,
    ) -> Result<Option<DownloadRecord>> {
        self.db.lock().await.insert_queued(
            guard.item_id(),
            platform_id,
            staged_path,
            target_path,
            bytes_total,
        )
    }

    pub async fn insert_discovered(
        &self,
        guard: &ItemGuard,
        platform_id: &str,
        local_path: &Path,
        install_root: Option<&Path>,
        size: Option<u64>,
    ) -> Result<bool> {
        self.db.lock().await.insert_discovered(
            guard.item_id(),
            platform_id,
            local_path,
            install_root,
            size,
        )
    }

    pub async fn set_transferring(&self, guard: &ItemGuard, bytes_total: Option<u64>) -> Result<()> {
        let changed = self
            .db
            .lock()
            .await
            .set_transferring(guard.item_id(), bytes_total)?;
        expect_transition(changed, guard, DownloadStatus::Transferring)
    }

    pub async fn update_progress(
        &self,
        guard: &ItemGuard,
        bytes_transferred: u64,
        bytes_total: Option<u64>,
    ) -> Result<()> {
        let changed = self.db.lock().await.update_progress(
            guard.item_id(),
            bytes_transferred,
            bytes_total,
        )?;
        expect_transition(changed, guard, DownloadStatus::Transferring)
    }

    pub async fn set_extracting(&self, guard: &ItemGuard) -> Result<()> {
        let changed = self.db.lock().await.set_extracting(guard.item_id())?;
        expect_transition(changed, guard, DownloadStatus::Extracting)
    }

    pub async fn set_completed(
        &self,
        guard: &ItemGuard,
        local_path: &Path,
        install_root: Option<&Path>,
    ) -> Result<()> {
        let changed =
            self.db
                .lock()
                .await
                .set_completed(guard.item_id(), local_path, install_root)?;
        expect_transition(changed, guard, DownloadStatus::Completed)
    }

    pub async fn set_failed(
        &self,
        guard: &ItemGuard,
        code: ErrorCode,
        detail: &str,
        retained_staged: Option<&Path>,
    ) -> Result<()> {
        let changed =
            self.db
                .lock()
                .await
                .set_failed(guard.item_id(), code, detail, retained_staged)?;
        expect_transition(changed, guard, DownloadStatus::Failed)
    }

    pub async fn set_cancelled(&self, guard: &ItemGuard) -> Result<()> {
        let changed = self.db.lock().await.set_cancelled(guard.item_id())?;
        expect_transition(changed, guard, DownloadStatus::Cancelled)
    }

    pub async fn delete(&self, guard: &ItemGuard) -> Result<bool> {
        self.db.lock().await.delete(guard.item_id())
    }
}

fn expect_transition(changed: bool, guard: &ItemGuard, to: DownloadStatus) -> Result<()> {
    if changed {
        Ok(())
    } else {
        Err(anyhow!(
            "record {} cannot move to {}",
            guard.item_id(),
            to.as_str()
        ))
    }
}
