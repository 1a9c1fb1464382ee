use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::inventory::read_sidecar;
use super::paths::{classify, ArtifactFile, BackupPaths};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokenReason {
    /// A `.json` backup that does not parse.
    UnparsableJson,
    /// A `.json` backup whose `metadata` is null, missing or has no id.
    MissingMetadataId,
    /// A `.meta.json` sidecar whose snapshot file is gone.
    OrphanedMetadata,
    /// A `.db` snapshot with no sidecar.
    MissingMetadata,
    /// A sidecar that does not parse.
    UnparsableMetadata,
    /// A `.partial` file left behind by an interrupted write.
    StalePartial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenArtifact {
    pub path: PathBuf,
    pub reason: BrokenReason,
    /// Files removed together with `path` during cleanup.
    pub companions: Vec<PathBuf>,
}

/// Finds and removes backup artifacts that can never be restored.
#[derive(Debug, Clone)]
pub struct BackupValidator {
    paths: BackupPaths,
}

fn json_backup_problem(bytes: &[u8]) -> Option<BrokenReason> {
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(_) => return Some(BrokenReason::UnparsableJson),
    };
    let has_id = value
        .get("metadata")
        .and_then(|meta| meta.get("id"))
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty());
    (!has_id).then_some(BrokenReason::MissingMetadataId)
}

impl BackupValidator {
    pub fn new(paths: BackupPaths) -> Self {
        Self { paths }
    }

    /// Every broken artifact currently in the backup directory, sorted by path.
    pub fn scan(&self) -> AppResult<Vec<BrokenArtifact>> {
        let dir = self.paths.backup_dir();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::from(err)
                    .with_context("operation", "scan_backups_dir")
                    .with_context("path", dir.display().to_string()))
            }
        };

        let mut snapshots = BTreeSet::new();
        let mut sidecars = BTreeSet::new();
        let mut broken = Vec::new();

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            match classify(&name) {
                Some(ArtifactFile::Partial) => broken.push(BrokenArtifact {
                    path,
                    reason: BrokenReason::StalePartial,
                    companions: Vec::new(),
                }),
                Some(ArtifactFile::Json { id }) => {
                    let problem = match fs::read(&path) {
                        Ok(bytes) => json_backup_problem(&bytes),
                        Err(err) => {
                            warn!(target: "headlog", event = "validate_read_failed", path = %path.display(), error = %err);
                            None
                        }
                    };
                    if let Some(reason) = problem {
                        let sidecar = self.paths.metadata_path(&id);
                        let companions = if sidecar.exists() { vec![sidecar] } else { Vec::new() };
                        broken.push(BrokenArtifact {
                            path,
                            reason,
                            companions,
                        });
                    }
                }
                Some(ArtifactFile::Snapshot { id }) => {
                    snapshots.insert(id);
                }
                Some(ArtifactFile::Metadata { id }) => {
                    sidecars.insert(id);
                }
                None => {}
            }
        }

        for id in &sidecars {
            let sidecar = self.paths.metadata_path(id);
            if read_sidecar(&sidecar).is_err() {
                let snapshot = self.paths.snapshot_path(id);
                let companions = if snapshots.contains(id) { vec![snapshot] } else { Vec::new() };
                broken.push(BrokenArtifact {
                    path: sidecar,
                    reason: BrokenReason::UnparsableMetadata,
                    companions,
                });
            } else if !snapshots.contains(id) {
                broken.push(BrokenArtifact {
                    path: sidecar,
                    reason: BrokenReason::OrphanedMetadata,
                    companions: Vec::new(),
                });
            }
        }

        for id in snapshots.difference(&sidecars) {
            broken.push(BrokenArtifact {
                path: self.paths.snapshot_path(id),
                reason: BrokenReason::MissingMetadata,
                companions: Vec::new(),
            });
        }

        broken.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(broken)
    }

    pub fn check_for_broken_backups(&self) -> AppResult<usize> {
        let broken = self.scan()?;
        if !broken.is_empty() {
            warn!(target: "headlog", event = "broken_backups_found", count = broken.len());
        }
        Ok(broken.len())
    }

    /// Deletes every broken artifact and its companions. Returns how many
    /// artifacts were removed; a second run right after returns `0`.
    pub fn cleanup_broken_backups(&self) -> AppResult<usize> {
        let mut removed = 0;
        for artifact in self.scan()? {
            let mut ok = true;
            for path in std::iter::once(&artifact.path).chain(artifact.companions.iter()) {
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        ok = false;
                        warn!(
                            target: "headlog",
                            event = "broken_backup_delete_failed",
                            path = %path.display(),
                            error = %err
                        );
                    }
                }
            }
            if ok {
                removed += 1;
                info!(
                    target: "headlog",
                    event = "broken_backup_removed",
                    path = %artifact.path.display(),
                    reason = ?artifact.reason
                );
            }
        }
        Ok(removed)
    }
}
