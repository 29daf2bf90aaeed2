use std::io;
use std::path::Path;

use tokio::fs;

/// Remove a file or directory tree. Returns `Ok(false)` if nothing was there.
pub async fn remove_path(path: &Path) -> io::Result<bool> {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Best-effort cleanup of leftovers; failures are logged, not returned.
pub async fn discard(path: &Path) {
    match remove_path(path).await {
        Ok(true) => log::debug!("Removed {}", path.display()),
        Ok(false) => {}
        Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Move `from` to `to`, copying across filesystems when a rename is not possible.
///
/// The copy fallback never replaces an existing `to`.
pub async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    let rename_err = match fs::rename(from, to).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if !fs::try_exists(from).await.unwrap_or(false) {
        return Err(rename_err);
    }
    if fs::try_exists(to).await.unwrap_or(true) {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        ));
    }

    log::debug!(
        "rename {} -> {} failed ({}), copying instead",
        from.display(),
        to.display(),
        rename_err
    );
    if let Err(e) = fs::copy(from, to).await {
        // `to` did not exist before the copy, so anything there is ours.
        discard(to).await;
        return Err(e);
    }
    fs::remove_file(from).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_path_handles_files_dirs_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"x").unwrap();
        let tree = dir.path().join("game");
        std::fs::create_dir_all(tree.join("data")).unwrap();
        std::fs::write(tree.join("data/b.bin"), b"y").unwrap();

        assert!(remove_path(&file).await.unwrap());
        assert!(remove_path(&tree).await.unwrap());
        assert!(!remove_path(&file).await.unwrap());
        assert!(!file.exists());
        assert!(!tree.exists());
    }

    #[tokio::test]
    async fn test_move_file() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.part");
        let to = dir.path().join("a.nes");
        std::fs::write(&from, b"rom").unwrap();

        move_file(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"rom");

        assert!(move_file(&from, &to).await.is_err());
        assert_eq!(std::fs::read(&to).unwrap(), b"rom");
    }

    #[tokio::test]
    async fn test_failed_move_keeps_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("missing.part");
        let to = dir.path().join("keep.nes");
        std::fs::write(&to, b"owned by someone else").unwrap();

        assert!(move_file(&from, &to).await.is_err());
        assert_eq!(std::fs::read(&to).unwrap(), b"owned by someone else");

        let sub = dir.path().join("sub");
        std::fs::create_dir_all(&sub).unwrap();
        let src = dir.path().join("b.part");
        std::fs::write(&src, b"new").unwrap();
        // Renaming a file onto a directory fails; the copy fallback must not touch it.
        assert!(move_file(&src, &sub).await.is_err());
        assert!(sub.is_dir());
        assert_eq!(std::fs::read(&src).unwrap(), b"new");
    }
}
