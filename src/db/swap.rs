use std::fs;
use std::io;
use std::path::Path;

use tracing::info;

use super::{shm_path, sync_dir, sync_file, wal_path};
use crate::{AppError, AppResult};

fn ensure_same_parent(live: &Path, staged: &Path) -> AppResult<()> {
    let live_parent = live.parent().ok_or_else(|| {
        AppError::new(
            "DB_SWAP/NO_PARENT",
            "Database path does not have a parent directory",
        )
        .with_context("path", live.display().to_string())
    })?;

    let staged_parent = staged.parent().ok_or_else(|| {
        AppError::new(
            "DB_SWAP/NO_PARENT",
            "Staged path does not have a parent directory",
        )
        .with_context("path", staged.display().to_string())
    })?;

    if live_parent != staged_parent {
        return Err(AppError::new(
            "DB_SWAP/DIFFERENT_PARENT",
            "Swap paths must share the same parent directory",
        )
        .with_context("live", live.display().to_string())
        .with_context("staged", staged.display().to_string()));
    }

    Ok(())
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Deletes the database file and its `-wal`/`-shm` companions. Missing files are fine.
pub fn remove_database_files(db_path: &Path) -> AppResult<()> {
    for path in [db_path.to_path_buf(), wal_path(db_path), shm_path(db_path)] {
        let removed = remove_if_present(&path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "remove_database_file")
                .with_context("path", path.display().to_string())
        })?;
        if removed {
            info!(target: "headlog", event = "db_file_removed", path = %path.display());
        }
    }
    Ok(())
}

/// Replaces the live database with a fully written staged file.
///
/// The live file and its sidecars are deleted before the staged file is
/// renamed into place. The connection must already be closed; stale `-wal`
/// or `-shm` files would otherwise be replayed against the new contents.
pub fn replace_live_database(live_path: &Path, staged: &Path) -> AppResult<()> {
    ensure_same_parent(live_path, staged)?;

    sync_file(staged).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "sync_staged_db")
            .with_context("path", staged.display().to_string())
    })?;

    remove_database_files(live_path)?;

    fs::rename(staged, live_path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "promote_staged_db")
            .with_context("from", staged.display().to_string())
            .with_context("to", live_path.display().to_string())
    })?;

    sync_file(live_path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "sync_live_db")
            .with_context("path", live_path.display().to_string())
    })?;
    if let Some(parent) = live_path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(path: &Path, contents: &[u8]) {
        std::fs::write(path, contents).expect("write file");
    }

    #[test]
    fn replace_promotes_staged_and_drops_sidecars() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("headlog.db");
        let staged = dir.path().join("headlog.db.restore.partial");

        write_file(&live, b"old");
        write_file(&wal_path(&live), b"stale wal");
        write_file(&shm_path(&live), b"stale shm");
        write_file(&staged, b"new");

        replace_live_database(&live, &staged).expect("swap succeeds");

        assert_eq!(std::fs::read(&live).unwrap(), b"new".as_slice());
        assert!(!staged.exists());
        assert!(!wal_path(&live).exists());
        assert!(!shm_path(&live).exists());
    }

    #[test]
    fn replace_works_without_live_file() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("headlog.db");
        let staged = dir.path().join("staged.db");
        write_file(&staged, b"new");

        replace_live_database(&live, &staged).expect("swap succeeds");
        assert_eq!(std::fs::read(&live).unwrap(), b"new".as_slice());
    }

    #[test]
    fn replace_rejects_different_parents() {
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        let live = dir.path().join("headlog.db");
        let staged = other.path().join("staged.db");

        write_file(&live, b"old");
        write_file(&staged, b"new");

        let err = replace_live_database(&live, &staged).expect_err("different parents rejected");
        assert_eq!(err.code(), "DB_SWAP/DIFFERENT_PARENT");
        assert_eq!(std::fs::read(&live).unwrap(), b"old".as_slice());
    }
}
