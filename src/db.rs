use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, SqlitePool};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{AppError, AppResult};

pub mod inspect;
pub mod swap;

pub const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

pub async fn open_sqlite_pool(db_path: &Path) -> AppResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            tracing::error!(
                target: "headlog",
                error = %err,
                event = "data_dir_create_failed",
                path = %parent.display()
            );
            AppError::from(err)
                .with_context("operation", "create_data_dir")
                .with_context("path", parent.display().to_string())
        })?;
    }

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .log_statements(log::LevelFilter::Trace);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys=ON;")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA wal_autocheckpoint = 1000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_database")
                .with_context("path", db_path.display().to_string())
        })?;

    log_effective_pragmas(&pool, db_path).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &SqlitePool, db_path: &Path) {
    let (journal_mode,): (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let (foreign_keys,): (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "headlog",
        event = "db_open",
        path = %db_path.display(),
        journal_mode = %journal_mode,
        foreign_keys
    );

    if !journal_mode.eq_ignore_ascii_case("wal") {
        warn!(
            target: "headlog",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

/// Owner of the live database connection pool.
///
/// A restore closes the pool, swaps the file underneath it and reopens it, so
/// callers must fetch the pool again after any restore instead of caching it.
pub struct LiveDatabase {
    path: PathBuf,
    pool: Mutex<Option<SqlitePool>>,
}

impl LiveDatabase {
    /// Opens (creating if missing) the database at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let pool = open_sqlite_pool(&path).await?;
        Ok(Self {
            path,
            pool: Mutex::new(Some(pool)),
        })
    }

    /// A handle to a database that is not currently open.
    pub fn closed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_open(&self) -> bool {
        self.pool.lock().await.is_some()
    }

    pub async fn try_pool(&self) -> Option<SqlitePool> {
        self.pool.lock().await.clone()
    }

    pub async fn pool(&self) -> AppResult<SqlitePool> {
        self.try_pool().await.ok_or_else(|| {
            AppError::new("DB/CLOSED", "Database connection is closed")
                .with_context("path", self.path.display().to_string())
        })
    }

    /// Closes every pooled connection. A no-op when already closed.
    pub async fn close(&self) {
        let taken = self.pool.lock().await.take();
        if let Some(pool) = taken {
            pool.close().await;
            info!(target: "headlog", event = "db_closed", path = %self.path.display());
        }
    }

    /// Closes any open pool and opens a fresh one against the current file.
    pub async fn reopen(&self) -> AppResult<SqlitePool> {
        self.close().await;
        let pool = open_sqlite_pool(&self.path).await?;
        *self.pool.lock().await = Some(pool.clone());
        info!(target: "headlog", event = "db_reopened", path = %self.path.display());
        Ok(pool)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// Runs `PRAGMA wal_checkpoint(TRUNCATE)` so the main file holds every committed page.
pub async fn checkpoint_wal(pool: &SqlitePool) -> AppResult<CheckpointStats> {
    let (busy, log_frames, checkpointed_frames): (i64, i64, i64) =
        sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(pool)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "wal_checkpoint"))?;

    let stats = CheckpointStats {
        busy,
        log_frames,
        checkpointed_frames,
    };
    if busy != 0 {
        warn!(target: "headlog", event = "wal_checkpoint_busy", log_frames, checkpointed_frames);
    }
    Ok(stats)
}

pub fn sidecar_path(base: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(base.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

pub fn wal_path(db_path: &Path) -> PathBuf {
    sidecar_path(db_path, "-wal")
}

pub fn shm_path(db_path: &Path) -> PathBuf {
    sidecar_path(db_path, "-shm")
}

/// Writes `bytes` to `path` through a temp file in the same directory, so a
/// reader sees either the old contents or the new ones.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let parent = path.parent().ok_or_else(|| {
        AppError::new("IO/NO_PARENT", "Path does not have a parent directory")
            .with_context("path", path.display().to_string())
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_temp_file")
            .with_context("path", parent.display().to_string())
    })?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_temp_file")
                .with_context("path", path.display().to_string())
        })?;
    tmp.persist(path).map_err(|err| {
        AppError::from(err.error)
            .with_context("operation", "persist_temp_file")
            .with_context("path", path.display().to_string())
    })?;
    sync_dir(parent);
    Ok(())
}

pub(crate) fn sync_file(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

/// Copies the bytes of `src` into a newly created `dest` and fsyncs it. Unlike
/// `fs::copy`, the new file gets default permissions instead of the source's,
/// so a read-only artifact never becomes a read-only database.
pub(crate) fn copy_contents(src: &Path, dest: &Path) -> std::io::Result<u64> {
    match std::fs::remove_file(dest) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    let mut reader = File::open(src)?;
    let mut writer = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)?;
    let copied = std::io::copy(&mut reader, &mut writer)?;
    writer.sync_all()?;
    Ok(copied)
}

/// Best-effort directory fsync; not every platform allows opening a directory.
pub(crate) fn sync_dir(path: &Path) {
    if let Err(err) = File::open(path).and_then(|dir| dir.sync_all()) {
        tracing::debug!(target: "headlog", event = "dir_sync_skipped", path = %path.display(), error = %err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sidecar_paths_append_suffix() {
        let db = Path::new("/data/headlog.db");
        assert_eq!(wal_path(db), PathBuf::from("/data/headlog.db-wal"));
        assert_eq!(shm_path(db), PathBuf::from("/data/headlog.db-shm"));
    }

    #[cfg(unix)]
    #[test]
    fn copy_contents_does_not_inherit_read_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let src = dir.path().join("artifact.db");
        let dest = dir.path().join("copy.db");
        std::fs::write(&src, b"SQLite format 3\0payload").unwrap();
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o444)).unwrap();

        assert_eq!(copy_contents(&src, &dest).unwrap(), 23);
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_ne!(mode & 0o200, 0, "copy is not owner-writable: {mode:o}");
        assert_eq!(std::fs::read(&dest).unwrap(), std::fs::read(&src).unwrap());
    }

    #[tokio::test]
    async fn live_database_close_and_reopen() {
        let dir = tempdir().unwrap();
        let db = LiveDatabase::open(dir.path().join("live.db")).await.unwrap();
        assert!(db.is_open().await);

        db.close().await;
        assert!(!db.is_open().await);
        let err = db.pool().await.expect_err("closed pool rejected");
        assert_eq!(err.code(), "DB/CLOSED");

        let pool = db.reopen().await.unwrap();
        let (one,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn checkpoint_truncates_wal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.db");
        let db = LiveDatabase::open(&path).await.unwrap();
        let pool = db.pool().await.unwrap();
        sqlx::query("CREATE TABLE t (v INTEGER)").execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO t VALUES (1)").execute(&pool).await.unwrap();

        let stats = checkpoint_wal(&pool).await.unwrap();
        assert_eq!(stats.busy, 0);
        let wal_len = std::fs::metadata(wal_path(&path)).map(|m| m.len()).unwrap_or(0);
        assert_eq!(wal_len, 0);
    }
}
