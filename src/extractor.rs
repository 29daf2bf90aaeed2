//! Archive Extractor
//!
//! `.zip` archives are unpacked in-process on a blocking thread. `.7z` archives go through
//! an external tool found by [`ToolManager`]. Output always lands in a hidden partial
//! directory inside the install dir and is promoted only once extraction succeeded.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::events::{ExtractPhase, JobReporter};
use crate::fs_utils;
use crate::models::ExtractionPlan;
use crate::tool_manager::ToolManager;

#[cfg(windows)]
use crate::tool_manager::CREATE_NO_WINDOW;

const SEVEN_ZIP_MAGIC: [u8; 6] = [b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];

const TOOL_HINT: &str =
    "no 7z extractor found; install 7-Zip (7z or 7zz) or unar (macOS: brew install unar)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    SevenZip,
}

impl ArchiveFormat {
    /// Format from the file extension, case-insensitive.
    pub fn from_path(path: &Path) -> Result<Self, JobError> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "7z" => Ok(ArchiveFormat::SevenZip),
            "" => Err(JobError::UnsupportedFormat(format!(
                "{} has no extension",
                path.display()
            ))),
            other => Err(JobError::UnsupportedFormat(format!(
                ".{other} archives are not supported"
            ))),
        }
    }
}

/// Where extracted output ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExtractedOutput {
    pub install_root: PathBuf,
    pub local_path: PathBuf,
}

/// Hidden working directory used while extracting `staged` into `install_dir`.
pub(crate) fn partial_dir_for(install_dir: &Path, staged: &Path) -> PathBuf {
    let name = staged
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    install_dir.join(format!(".{name}.partial"))
}

pub(crate) struct ArchiveExtractor {
    tools: ToolManager,
}

impl ArchiveExtractor {
    pub(crate) fn new(tools: ToolManager) -> Self {
        Self { tools }
    }

    /// Extract `staged` into `install_dir`. The staged archive is deleted on success and
    /// left alone on failure; the partial directory never survives a failure.
    pub(crate) async fn extract(
        &self,
        staged: &Path,
        install_dir: &Path,
        plan: &ExtractionPlan,
        token: &CancellationToken,
        reporter: &mut JobReporter,
    ) -> Result<ExtractedOutput, JobError> {
        let format = ArchiveFormat::from_path(staged)?;

        fs::create_dir_all(install_dir)
            .await
            .map_err(|e| JobError::disk("create install dir", e))?;
        let partial = partial_dir_for(install_dir, staged);
        fs_utils::discard(&partial).await;
        fs::create_dir_all(&partial)
            .await
            .map_err(|e| JobError::disk("create partial dir", e))?;

        let unpacked = match format {
            ArchiveFormat::Zip => self.extract_zip(staged, &partial, token, reporter).await,
            ArchiveFormat::SevenZip => self.extract_7z(staged, &partial, token, reporter).await,
        };
        let promoted = match unpacked {
            Ok(()) if token.is_cancelled() => Err(JobError::Cancelled),
            Ok(()) => promote(&partial, install_dir, staged).await,
            Err(e) => Err(e),
        };
        let install_root = match promoted {
            Ok(root) => root,
            Err(e) => {
                fs_utils::discard(&partial).await;
                return Err(e);
            }
        };

        fs_utils::discard(&partial).await;
        fs_utils::discard(staged).await;

        let local_path = resolve_local_path(&install_root, plan);
        reporter.extract_progress(ExtractPhase::Done, None, None);
        log::info!(
            "Extracted {} into {}",
            staged.display(),
            install_root.display()
        );

        Ok(ExtractedOutput {
            install_root,
            local_path,
        })
    }

    async fn extract_zip(
        &self,
        archive: &Path,
        dest: &Path,
        token: &CancellationToken,
        reporter: &mut JobReporter,
    ) -> Result<(), JobError> {
        let (tx, mut rx) = watch::channel((0u64, 0u64));
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        let cancel = token.clone();
        let mut task = tokio::task::spawn_blocking(move || unzip(&archive, &dest, &cancel, &tx));

        loop {
            tokio::select! {
                joined = &mut task => {
                    return joined.map_err(|e| JobError::Disk(format!("extraction task failed: {e}")))?;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped: the blocking task is returning.
                        return (&mut task)
                            .await
                            .map_err(|e| JobError::Disk(format!("extraction task failed: {e}")))?;
                    }
                    let (done, total) = *rx.borrow_and_update();
                    reporter.extract_progress(ExtractPhase::Extracting, Some(done), Some(total));
                }
            }
        }
    }

    async fn extract_7z(
        &self,
        archive: &Path,
        dest: &Path,
        token: &CancellationToken,
        reporter: &mut JobReporter,
    ) -> Result<(), JobError> {
        check_7z_signature(archive).await?;

        let Some(tool) = self.tools.find_extractor().await else {
            log::warn!("Cannot extract {}: {}", archive.display(), TOOL_HINT);
            return Err(JobError::ExtractionToolUnavailable(TOOL_HINT.to_string()));
        };
        log::info!(
            "Extracting {} with {} {}",
            archive.display(),
            tool.tool.as_str(),
            tool.version.as_deref().unwrap_or("(unknown version)")
        );
        reporter.extract_progress(ExtractPhase::Extracting, None, None);

        let mut cmd = Command::new(&tool.path);
        cmd.args(tool.tool.extract_args(archive, dest))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|e| {
            JobError::ExtractionToolUnavailable(format!(
                "failed to run {}: {}",
                tool.path.display(),
                e
            ))
        })?;
        let stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr = tokio::spawn(read_pipe(child.stderr.take()));

        let status = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = status else {
            // The partial dir is removed next; the tool must be gone by then.
            if let Err(e) = child.kill().await {
                log::warn!("Failed to stop {}: {}", tool.path.display(), e);
            }
            return Err(JobError::Cancelled);
        };
        let status =
            status.map_err(|e| JobError::CorruptArchive(format!("extractor did not finish: {e}")))?;
        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        if status.success() {
            return Ok(());
        }
        Err(classify_tool_failure(status.code(), &stderr, &stdout))
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            log::debug!("Extractor output unreadable: {}", e);
        }
    }
    buf
}

fn unzip(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    progress: &watch::Sender<(u64, u64)>,
) -> Result<(), JobError> {
    let file = std::fs::File::open(archive).map_err(|e| JobError::disk("open archive", e))?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| JobError::CorruptArchive(e.to_string()))?;
    let total = zip.len() as u64;
    progress.send_replace((0, total));

    let mut buf = vec![0u8; 64 * 1024];
    for i in 0..zip.len() {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let mut entry = zip
            .by_index(i)
            .map_err(|e| JobError::CorruptArchive(e.to_string()))?;
        let name = entry.name().to_string();
        let Some(relative) = entry.enclosed_name() else {
            return Err(JobError::CorruptArchive(format!("unsafe entry path: {name}")));
        };
        let out = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out).map_err(|e| JobError::disk("create dir", e))?;
        } else {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent).map_err(|e| JobError::disk("create dir", e))?;
            }
            let mut writer =
                std::fs::File::create(&out).map_err(|e| JobError::disk("create file", e))?;
            loop {
                if cancel.is_cancelled() {
                    return Err(JobError::Cancelled);
                }
                let n = entry
                    .read(&mut buf)
                    .map_err(|e| JobError::CorruptArchive(format!("{name}: {e}")))?;
                if n == 0 {
                    break;
                }
                writer
                    .write_all(&buf[..n])
                    .map_err(|e| JobError::disk("write file", e))?;
            }

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode().map(|m| m & 0o777).filter(|m| *m != 0) {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode)) {
                    log::debug!("Could not set mode on {}: {}", out.display(), e);
                }
            }
        }

        progress.send_replace((i as u64 + 1, total));
    }
    Ok(())
}

async fn check_7z_signature(path: &Path) -> Result<(), JobError> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|e| JobError::disk("open archive", e))?;
    let mut magic = [0u8; 6];
    match file.read_exact(&mut magic).await {
        Ok(_) if magic == SEVEN_ZIP_MAGIC => Ok(()),
        Ok(_) => Err(JobError::CorruptArchive("not a 7z archive".to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(JobError::CorruptArchive("archive is truncated".to_string()))
        }
        Err(e) => Err(JobError::disk("read archive", e)),
    }
}

fn classify_tool_failure(code: Option<i32>, stderr: &[u8], stdout: &[u8]) -> JobError {
    let stderr = String::from_utf8_lossy(stderr);
    let stdout = String::from_utf8_lossy(stdout);
    let combined = format!("{stderr}\n{stdout}").to_lowercase();

    let message = match stderr.trim() {
        "" => match code {
            Some(code) => format!("extractor exited with status {code}"),
            None => "extractor was terminated".to_string(),
        },
        text => text.to_string(),
    };

    if combined.contains("no space") || combined.contains("not enough space") || combined.contains("disk full") {
        JobError::Disk(message)
    } else {
        JobError::CorruptArchive(message)
    }
}

/// Move the contents of `partial` into `install_dir`. Returns the extracted root.
async fn promote(partial: &Path, install_dir: &Path, archive: &Path) -> Result<PathBuf, JobError> {
    let mut entries = Vec::new();
    let mut dir = fs::read_dir(partial)
        .await
        .map_err(|e| JobError::disk("read partial dir", e))?;
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| JobError::disk("read partial dir", e))?
    {
        entries.push(entry);
    }

    match entries.as_slice() {
        [] => Err(JobError::CorruptArchive("archive contains no files".to_string())),
        [single] => {
            let target = install_dir.join(single.file_name());
            ensure_absent(&target).await?;
            fs::rename(single.path(), &target)
                .await
                .map_err(|e| JobError::disk("move extracted entry", e))?;
            Ok(target)
        }
        _ => {
            let target = install_dir.join(archive_stem(archive));
            ensure_absent(&target).await?;
            fs::rename(partial, &target)
                .await
                .map_err(|e| JobError::disk("move extracted folder", e))?;
            Ok(target)
        }
    }
}

async fn ensure_absent(target: &Path) -> Result<(), JobError> {
    match fs::try_exists(target).await {
        Ok(false) => Ok(()),
        Ok(true) => Err(JobError::Disk(format!(
            "destination already exists: {}",
            target.display()
        ))),
        Err(e) => Err(JobError::disk("check destination", e)),
    }
}

fn archive_stem(archive: &Path) -> String {
    let stem = archive
        .file_stem()
        .map(|s| sanitize_filename::sanitize(s.to_string_lossy()))
        .unwrap_or_default();
    if stem.is_empty() {
        "extracted".to_string()
    } else {
        stem
    }
}

fn resolve_local_path(root: &Path, plan: &ExtractionPlan) -> PathBuf {
    match &plan.executable {
        Some(exe) => {
            let candidate = root.join(exe);
            if candidate.is_file() {
                candidate
            } else {
                log::warn!(
                    "Executable {} not found under {}; using the folder",
                    exe.display(),
                    root.display()
                );
                root.to_path_buf()
            }
        }
        None => root.to_path_buf(),
    }
}

/// All `.exe` files under `dir`, sorted. Symlinks are not followed.
pub fn find_executables(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(kind) = entry.file_type() else {
                continue;
            };
            let path = entry.path();
            if kind.is_dir() {
                pending.push(path);
            } else if kind.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
            {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}
