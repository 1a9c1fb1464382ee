use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::metadata::{BackupMetadata, JSON_EXTENSION, METADATA_SUFFIX, SNAPSHOT_EXTENSION};
use crate::config::BackupConfig;
use crate::time::compact_stamp;
use crate::{AppError, AppResult};

pub const PARTIAL_SUFFIX: &str = ".partial";
const SAFETY_MARKER: &str = ".pre-restore-";
const STAGED_RESTORE_SUFFIX: &str = ".restore.partial";

/// What a file in the backup directory is, judged by name alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactFile {
    Snapshot { id: String },
    Metadata { id: String },
    Json { id: String },
    Partial,
}

/// Classifies a backup-directory entry; `None` for files that are not ours.
pub fn classify(file_name: &str) -> Option<ArtifactFile> {
    if file_name.ends_with(PARTIAL_SUFFIX) {
        return Some(ArtifactFile::Partial);
    }
    if let Some(id) = file_name.strip_suffix(METADATA_SUFFIX) {
        return (!id.is_empty()).then(|| ArtifactFile::Metadata { id: id.to_string() });
    }
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    match ext {
        JSON_EXTENSION => Some(ArtifactFile::Json {
            id: stem.to_string(),
        }),
        SNAPSHOT_EXTENSION => Some(ArtifactFile::Snapshot {
            id: stem.to_string(),
        }),
        _ => None,
    }
}

/// Deterministic locations for every file the backup services read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPaths {
    backup_dir: PathBuf,
    db_path: PathBuf,
}

impl BackupPaths {
    pub fn new(backup_dir: impl Into<PathBuf>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            db_path: db_path.into(),
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self::new(&config.backup_dir, &config.db_path)
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn snapshot_path(&self, id: &str) -> PathBuf {
        self.backup_dir.join(format!("{id}.{SNAPSHOT_EXTENSION}"))
    }

    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.backup_dir.join(format!("{id}{METADATA_SUFFIX}"))
    }

    pub fn json_path(&self, id: &str) -> PathBuf {
        self.backup_dir.join(format!("{id}.{JSON_EXTENSION}"))
    }

    pub fn artifact_path(&self, meta: &BackupMetadata) -> PathBuf {
        self.backup_dir.join(meta.artifact_name())
    }

    pub fn partial_path(&self, final_path: &Path) -> PathBuf {
        let mut os = OsString::from(final_path.as_os_str());
        os.push(PARTIAL_SUFFIX);
        PathBuf::from(os)
    }

    fn live_parent(&self) -> AppResult<&Path> {
        self.db_path.parent().ok_or_else(|| {
            AppError::new(
                "BACKUP/NO_PARENT",
                "Database path does not have a parent directory",
            )
            .with_context("path", self.db_path.display().to_string())
        })
    }

    fn live_file_name(&self) -> String {
        self.db_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "database".to_string())
    }

    /// Where the restore writes the incoming database before swapping it in.
    /// Same directory as the live file so the swap is a rename.
    pub fn staged_restore_path(&self) -> AppResult<PathBuf> {
        Ok(self
            .live_parent()?
            .join(format!("{}{STAGED_RESTORE_SUFFIX}", self.live_file_name())))
    }

    /// `<db name>.pre-restore-YYYYMMDD-HHMMSS[-NN]` beside the live database.
    pub fn safety_backup_path(&self, now_ms: i64) -> AppResult<PathBuf> {
        let parent = self.live_parent()?;
        let base = format!(
            "{}{SAFETY_MARKER}{}",
            self.live_file_name(),
            compact_stamp(now_ms)
        );
        for suffix in 0..100 {
            let candidate = if suffix == 0 {
                parent.join(&base)
            } else {
                parent.join(format!("{base}-{suffix:02}"))
            };
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(AppError::new(
            "BACKUP/NAME_COLLISION",
            "Unable to allocate a safety backup path",
        )
        .with_context("path", parent.join(base).display().to_string()))
    }
}
