use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::ErrorCode;
use crate::models::{DownloadRecord, DownloadStatus, RecordFilter, RecordSource};

/// Database schema version.
///
/// Bump this when introducing a new migration.
const SCHEMA_VERSION: i64 = 1;

const RECORD_COLUMNS: &str = r#"
    item_id, platform_id, status, source,
    local_path, install_root, staged_path, target_path,
    bytes_total, bytes_transferred,
    error_code, error_detail,
    created_at, updated_at
"#;

const ACTIVE_STATUSES: &str = "('queued', 'transferring', 'extracting')";
const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

/// Database handle wrapper.
///
/// Notes:
/// - This uses `rusqlite::Connection`, which is not `Sync`.
/// - Share it through [`crate::ledger::Ledger`], which adds per-item serialization.
pub struct Db {
    conn: Connection,
    path: Option<PathBuf>,
}

/// Determines the per-user app data directory.
///
/// macOS:  ~/Library/Application Support/io.romdeck.RomDeck
/// Windows: %APPDATA%\\romdeck\\RomDeck
/// Linux:  ~/.local/share/romdeck (depending on XDG)
pub fn app_project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("io", "romdeck", "RomDeck")
        .ok_or_else(|| anyhow!("failed to resolve per-user app data directory"))
}

/// Returns the path to the SQLite database file, creating its directory.
pub fn default_db_path() -> Result<PathBuf> {
    let data = app_project_dirs()?.data_dir().to_path_buf();
    fs::create_dir_all(&data).with_context(|| format!("create data dir: {}", data.display()))?;
    Ok(data.join("romdeck.sqlite3"))
}

impl Db {
    /// Open the ledger at the per-user location and apply migrations.
    pub fn open() -> Result<Self> {
        Self::open_at(&default_db_path()?)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)
            .with_context(|| format!("open sqlite db: {}", path.display()))?;

        // WAL keeps readers off the writer's back; NORMAL is durable enough under WAL.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&mut conn)?;

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        migrate(&mut conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Insert a `Queued` user-initiated record, replacing a terminal one.
    ///
    /// Returns `Ok(None)` when a non-terminal record already exists.
    pub fn insert_queued(
        &mut self,
        item_id: &str,
        platform_id: &str,
        staged_path: &Path,
        target_path: &Path,
        bytes_total: Option<u64>,
    ) -> Result<Option<DownloadRecord>> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            &format!(
                r#"
                INSERT INTO downloads ({RECORD_COLUMNS})
                VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5, ?6, ?7, 0, NULL, NULL, ?8, ?8)
                ON CONFLICT(item_id) DO UPDATE SET
                  platform_id = excluded.platform_id,
                  status = excluded.status,
                  source = excluded.source,
                  local_path = NULL,
                  install_root = NULL,
                  staged_path = excluded.staged_path,
                  target_path = excluded.target_path,
                  bytes_total = excluded.bytes_total,
                  bytes_transferred = 0,
                  error_code = NULL,
                  error_detail = NULL,
                  created_at = excluded.created_at,
                  updated_at = excluded.updated_at
                WHERE downloads.status IN {TERMINAL_STATUSES}
                "#
            ),
            params![
                item_id,
                platform_id,
                DownloadStatus::Queued.as_str(),
                RecordSource::UserInitiated.as_str(),
                path_str(staged_path),
                path_str(target_path),
                bytes_total.map(|b| b as i64),
                now
            ],
        )?;

        if changed == 0 {
            return Ok(None);
        }
        self.get(item_id)
    }

    /// Insert a `Completed` record found on disk. Only replaces failed/cancelled records.
    pub fn insert_discovered(
        &mut self,
        item_id: &str,
        platform_id: &str,
        local_path: &Path,
        install_root: Option<&Path>,
        size: Option<u64>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let size = size.map(|b| b as i64);
        let changed = self.conn.execute(
            &format!(
                r#"
                INSERT INTO downloads ({RECORD_COLUMNS})
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7, COALESCE(?7, 0), NULL, NULL, ?8, ?8)
                ON CONFLICT(item_id) DO UPDATE SET
                  platform_id = excluded.platform_id,
                  status = excluded.status,
                  source = excluded.source,
                  local_path = excluded.local_path,
                  install_root = excluded.install_root,
                  staged_path = NULL,
                  target_path = NULL,
                  bytes_total = excluded.bytes_total,
                  bytes_transferred = excluded.bytes_transferred,
                  error_code = NULL,
                  error_detail = NULL,
                  created_at = excluded.created_at,
                  updated_at = excluded.updated_at
                WHERE downloads.status IN ('failed', 'cancelled')
                "#
            ),
            params![
                item_id,
                platform_id,
                DownloadStatus::Completed.as_str(),
                RecordSource::FilesystemDiscovered.as_str(),
                path_str(local_path),
                install_root.map(path_str),
                size,
                now
            ],
        )?;
        Ok(changed == 1)
    }

    /// `Queued -> Transferring`.
    pub fn set_transferring(&mut self, item_id: &str, bytes_total: Option<u64>) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            r#"
            UPDATE downloads
            SET status = 'transferring', bytes_total = COALESCE(?2, bytes_total), updated_at = ?3
            WHERE item_id = ?1 AND status = 'queued'
            "#,
            params![item_id, bytes_total.map(|b| b as i64), now],
        )?;
        Ok(changed == 1)
    }

    /// Progress while `Transferring`; `bytes_transferred` never decreases.
    pub fn update_progress(
        &mut self,
        item_id: &str,
        bytes_transferred: u64,
        bytes_total: Option<u64>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            r#"
            UPDATE downloads
            SET bytes_transferred = MAX(bytes_transferred, ?2),
                bytes_total = COALESCE(?3, bytes_total),
                updated_at = ?4
            WHERE item_id = ?1 AND status = 'transferring'
            "#,
            params![
                item_id,
                bytes_transferred as i64,
                bytes_total.map(|b| b as i64),
                now
            ],
        )?;
        Ok(changed == 1)
    }

    /// `Transferring -> Extracting`.
    pub fn set_extracting(&mut self, item_id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            r#"
            UPDATE downloads
            SET status = 'extracting', updated_at = ?2
            WHERE item_id = ?1 AND status = 'transferring'
            "#,
            params![item_id, now],
        )?;
        Ok(changed == 1)
    }

    pub fn set_completed(
        &mut self,
        item_id: &str,
        local_path: &Path,
        install_root: Option<&Path>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            r#"
            UPDATE downloads
            SET status = 'completed', local_path = ?2, install_root = ?3,
                staged_path = NULL, target_path = NULL,
                error_code = NULL, error_detail = NULL, updated_at = ?4
            WHERE item_id = ?1 AND status IN ('transferring', 'extracting')
            "#,
            params![item_id, path_str(local_path), install_root.map(path_str), now],
        )?;
        Ok(changed == 1)
    }

    /// Any non-terminal state -> `Failed`. `retained_staged` keeps a staged file on record.
    pub fn set_failed(
        &mut self,
        item_id: &str,
        code: ErrorCode,
        detail: &str,
        retained_staged: Option<&Path>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            &format!(
                r#"
                UPDATE downloads
                SET status = 'failed', error_code = ?2, error_detail = ?3,
                    local_path = NULL, install_root = NULL, staged_path = ?4,
                    updated_at = ?5
                WHERE item_id = ?1 AND status IN {ACTIVE_STATUSES}
                "#
            ),
            params![item_id, code.as_str(), detail, retained_staged.map(path_str), now],
        )?;
        Ok(changed == 1)
    }

    /// Any non-terminal state -> `Cancelled`.
    pub fn set_cancelled(&mut self, item_id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            &format!(
                r#"
                UPDATE downloads
                SET status = 'cancelled', local_path = NULL, install_root = NULL,
                    staged_path = NULL, updated_at = ?2
                WHERE item_id = ?1 AND status IN {ACTIVE_STATUSES}
                "#
            ),
            params![item_id, now],
        )?;
        Ok(changed == 1)
    }

    pub fn delete(&mut self, item_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM downloads WHERE item_id = ?1", params![item_id])?;
        Ok(changed == 1)
    }

    pub fn get(&mut self, item_id: &str) -> Result<Option<DownloadRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM downloads WHERE item_id = ?1"),
                params![item_id],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list(&mut self, filter: &RecordFilter) -> Result<Vec<DownloadRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM downloads
            WHERE (?1 IS NULL OR platform_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY platform_id ASC, item_id ASC
            "#
        ))?;

        let rows = stmt.query_map(
            params![filter.platform_id, filter.status.map(DownloadStatus::as_str)],
            Self::row_to_record,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Records left in Queued/Transferring/Extracting.
    pub fn list_active(&mut self) -> Result<Vec<DownloadRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM downloads WHERE status IN {ACTIVE_STATUSES} ORDER BY created_at ASC"
        ))?;

        let rows = stmt.query_map([], Self::row_to_record)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Count records by status.
    pub fn count_by_status(&mut self, status: DownloadStatus) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM downloads WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Helper function to convert a database row to a `DownloadRecord`.
    fn row_to_record(row: &Row) -> rusqlite::Result<DownloadRecord> {
        let item_id: String = row.get(0)?;
        let platform_id: String = row.get(1)?;
        let status: String = row.get(2)?;
        let source: String = row.get(3)?;
        let local_path: Option<String> = row.get(4)?;
        let install_root: Option<String> = row.get(5)?;
        let staged_path: Option<String> = row.get(6)?;
        let target_path: Option<String> = row.get(7)?;
        let bytes_total: Option<i64> = row.get(8)?;
        let bytes_transferred: i64 = row.get(9)?;
        let error_code: Option<String> = row.get(10)?;
        let error_detail: Option<String> = row.get(11)?;
        let created_at: String = row.get(12)?;
        let updated_at: String = row.get(13)?;

        let status = DownloadStatus::from_str(&status).ok_or(rusqlite::Error::InvalidQuery)?;
        let source = RecordSource::from_str(&source).ok_or(rusqlite::Error::InvalidQuery)?;
        let error_code = match error_code {
            Some(s) => Some(ErrorCode::from_str(&s).ok_or(rusqlite::Error::InvalidQuery)?),
            None => None,
        };
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc);
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc);

        Ok(DownloadRecord {
            item_id,
            platform_id,
            status,
            source,
            local_path: local_path.map(PathBuf::from),
            install_root: install_root.map(PathBuf::from),
            staged_path: staged_path.map(PathBuf::from),
            target_path: target_path.map(PathBuf::from),
            bytes_total: bytes_total.map(|b| b as u64),
            bytes_transferred: bytes_transferred as u64,
            error_code,
            error_detail,
            created_at,
            updated_at,
        })
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Apply migrations to bring database to current schema.
fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        "#,
    )?;

    let existing: Option<String> = conn
        .query_row(
            r#"SELECT value FROM meta WHERE key = 'schema_version'"#,
            [],
            |r| r.get(0),
        )
        .optional()?;

    let current_version: i64 = existing
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        return Err(anyhow!(
            "db schema version {} is newer than this build supports ({})",
            current_version,
            SCHEMA_VERSION
        ));
    }

    if current_version == 0 {
        migration_v1(conn)?;
        set_schema_version(conn, 1)?;
    }

    Ok(())
}

fn set_schema_version(conn: &mut Connection, v: i64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO meta(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![v.to_string()],
    )?;
    Ok(())
}

fn migration_v1(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS downloads (
          item_id TEXT PRIMARY KEY,
          platform_id TEXT NOT NULL,
          status TEXT NOT NULL,
          source TEXT NOT NULL,

          local_path TEXT NULL,
          install_root TEXT NULL,
          staged_path TEXT NULL,
          target_path TEXT NULL,

          bytes_total INTEGER NULL,
          bytes_transferred INTEGER NOT NULL DEFAULT 0,

          error_code TEXT NULL,
          error_detail TEXT NULL,

          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_downloads_platform ON downloads(platform_id);
        CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);

        CREATE TABLE IF NOT EXISTS settings (
          key TEXT PRIMARY KEY,
          value_json TEXT NOT NULL
        );
        "#,
    )?;

    Ok(())
}
