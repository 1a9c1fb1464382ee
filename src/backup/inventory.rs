use std::fs;
use std::io;
use std::path::Path;

use serde_json::Value;
use tracing::{info, warn};

use super::error::{backup_not_found, corrupt};
use super::metadata::{validate_backup_id, BackupMetadata, BackupType};
use super::paths::{classify, ArtifactFile, BackupPaths};
use crate::db::write_atomic;
use crate::{AppError, AppResult};

/// Read/delete access to the backup directory's metadata records.
#[derive(Debug, Clone)]
pub struct BackupInventory {
    paths: BackupPaths,
}

impl BackupInventory {
    pub fn new(paths: BackupPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &BackupPaths {
        &self.paths
    }

    pub fn ensure_dir(&self) -> AppResult<()> {
        let dir = self.paths.backup_dir();
        fs::create_dir_all(dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_backups_dir")
                .with_context("path", dir.display().to_string())
        })
    }

    /// Metadata for `id`: the sidecar for snapshots, the embedded record for JSON.
    /// `Ok(None)` when neither exists.
    ///
    /// The returned record is keyed by `id`: a stored id or `fileName` that
    /// disagrees with the file it was read from is replaced, so artifact paths
    /// only ever come from a validated id.
    pub fn load_metadata(&self, id: &str) -> AppResult<Option<BackupMetadata>> {
        validate_backup_id(id)?;

        let sidecar = self.paths.metadata_path(id);
        if sidecar.exists() {
            let meta = read_sidecar(&sidecar)?;
            return Ok(Some(normalize(meta, id, BackupType::Snapshot)));
        }

        let json = self.paths.json_path(id);
        if json.exists() {
            let meta = read_embedded_metadata(&json)?;
            return Ok(Some(normalize(meta, id, BackupType::Json)));
        }

        Ok(None)
    }

    pub fn get_metadata(&self, id: &str) -> AppResult<BackupMetadata> {
        self.load_metadata(id)?.ok_or_else(|| backup_not_found(id))
    }

    /// Every readable backup, newest first. Broken entries are skipped with a
    /// warning; the validator is what reports them.
    pub fn list_backups(&self) -> AppResult<Vec<BackupMetadata>> {
        let dir = self.paths.backup_dir();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::from(err)
                    .with_context("operation", "read_backups_dir")
                    .with_context("path", dir.display().to_string()))
            }
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(target: "headlog", error = %err, event = "skip_invalid_backup_entry");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let id = match classify(&name) {
                Some(ArtifactFile::Metadata { id }) | Some(ArtifactFile::Json { id }) => id,
                _ => continue,
            };
            match self.listed_metadata(&id) {
                Ok(Some(meta)) => out.push(meta),
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        target: "headlog",
                        error = %err,
                        path = %entry.path().display(),
                        event = "skip_backup_invalid"
                    );
                }
            }
        }

        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        out.dedup_by(|a, b| a.id == b.id);
        Ok(out)
    }

    fn listed_metadata(&self, id: &str) -> AppResult<Option<BackupMetadata>> {
        let Some(mut meta) = self.load_metadata(id)? else {
            return Ok(None);
        };
        let artifact = self.paths.artifact_path(&meta);
        match fs::metadata(&artifact) {
            Ok(stat) => meta.file_size = stat.len(),
            Err(_) => {
                return Err(corrupt("Backup artifact is missing", &artifact));
            }
        }
        Ok(Some(meta))
    }

    /// Removes the artifact and its sidecar.
    pub fn delete_backup(&self, id: &str) -> AppResult<()> {
        let meta = self.get_metadata(id)?;
        let targets = [
            self.paths.artifact_path(&meta),
            self.paths.metadata_path(id),
        ];
        for path in targets {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(AppError::from(err)
                        .with_context("operation", "delete_backup")
                        .with_context("path", path.display().to_string()))
                }
            }
        }
        info!(target: "headlog", event = "backup_deleted", id);
        Ok(())
    }

    pub fn write_sidecar(&self, meta: &BackupMetadata) -> AppResult<()> {
        let path = self.paths.metadata_path(&meta.id);
        let payload = serde_json::to_vec_pretty(meta)
            .map_err(|err| AppError::from(err).with_context("operation", "serialize_metadata"))?;
        write_atomic(&path, &payload).map_err(|err| err.with_context("operation", "write_metadata"))
    }
}

fn normalize(mut meta: BackupMetadata, id: &str, backup_type: BackupType) -> BackupMetadata {
    meta.backup_type = backup_type;
    let expected = format!("{id}.{}", backup_type.extension());
    if meta.id != id || (!meta.file_name.is_empty() && meta.file_name != expected) {
        warn!(
            target: "headlog",
            event = "backup_metadata_mismatch",
            id,
            stored_id = %meta.id,
            stored_file_name = %meta.file_name
        );
    }
    meta.id = id.to_string();
    meta.file_name = expected;
    meta
}

pub fn read_sidecar(path: &Path) -> AppResult<BackupMetadata> {
    let bytes = fs::read(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_metadata")
            .with_context("path", path.display().to_string())
    })?;
    serde_json::from_slice(&bytes).map_err(|err| {
        corrupt("Backup metadata is not readable", path).with_cause(AppError::from(err))
    })
}

fn read_embedded_metadata(path: &Path) -> AppResult<BackupMetadata> {
    let bytes = fs::read(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_json_backup")
            .with_context("path", path.display().to_string())
    })?;
    let value: Value = serde_json::from_slice(&bytes).map_err(|err| {
        corrupt("JSON backup is not valid JSON", path).with_cause(AppError::from(err))
    })?;
    let metadata = value
        .get("metadata")
        .filter(|m| !m.is_null())
        .cloned()
        .ok_or_else(|| corrupt("JSON backup has no metadata", path))?;
    serde_json::from_value(metadata).map_err(|err| {
        corrupt("JSON backup metadata is not readable", path).with_cause(AppError::from(err))
    })
}
