use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task;
use tracing::info;

use super::creator::{copy_file_via_partial, gather, GatherLimits};
use super::error::{
    backup_not_found, corrupt, export_failed, import_failed, incompatible_schema_version,
    unsupported_file,
};
use super::metadata::{generate_backup_id, BackupKind, BackupMetadata, BackupType};
use super::BackupDeps;
use crate::db::{self, inspect};
use crate::error_log::report;
use crate::platform::{DocumentPicker, PickedDocument, ShareRequest, ShareTarget};
use crate::time::{compact_stamp, now_ms};
use crate::{AppError, AppResult};

const SQLITE_MIME: &str = "application/vnd.sqlite3";
const SNAPSHOT_SHARE_MIME: &str = "application/x-sqlite3";
const SNAPSHOT_IMPORT_EXTENSIONS: [&str; 3] = ["db", "sqlite", "sqlite3"];

fn share_mime(path: &Path, backup_type: BackupType) -> String {
    match backup_type {
        BackupType::Json => mime_guess::from_path(path)
            .first()
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_else(|| "application/json".to_string()),
        BackupType::Snapshot => SNAPSHOT_SHARE_MIME.to_string(),
    }
}

fn document_extension(doc: &PickedDocument) -> Option<String> {
    let from_name = Path::new(&doc.name)
        .extension()
        .or_else(|| doc.path.extension())?;
    Some(from_name.to_string_lossy().to_ascii_lowercase())
}

/// Moves backups in and out of the app through the platform seams.
#[derive(Clone)]
pub struct BackupExporter {
    deps: BackupDeps,
    share: Arc<dyn ShareTarget>,
}

impl BackupExporter {
    pub fn new(deps: BackupDeps, share: Arc<dyn ShareTarget>) -> Self {
        Self { deps, share }
    }

    /// Hands backup `id`'s artifact to the share target.
    pub async fn export_backup(&self, id: &str) -> AppResult<ShareRequest> {
        match self.share_backup(id) {
            Ok(request) => Ok(request),
            Err(err) => {
                report(&self.deps.error_log, "export_backup", &err);
                Err(export_failed(err))
            }
        }
    }

    fn share_backup(&self, id: &str) -> AppResult<ShareRequest> {
        let meta = self.deps.inventory().get_metadata(id)?;
        if meta.backup_type == BackupType::Json && !cfg!(feature = "legacy_json") {
            return Err(super::error::legacy_json_retired());
        }
        let path = self.deps.paths.artifact_path(&meta);
        if !path.exists() {
            return Err(backup_not_found(id).with_context("path", path.display().to_string()));
        }
        let request = ShareRequest {
            mime_type: share_mime(&path, meta.backup_type),
            title: format!("Headlog backup {id}"),
            path,
        };
        self.share.share(&request)?;
        info!(target: "headlog", event = "backup_exported", id, mime_type = %request.mime_type);
        Ok(request)
    }

    /// Copies a user-picked file into the backup directory under a fresh id.
    /// `Ok(None)` when the picker was cancelled.
    pub async fn import_backup(
        &self,
        picker: &dyn DocumentPicker,
    ) -> AppResult<Option<BackupMetadata>> {
        let picked = match picker.pick() {
            Ok(picked) => picked,
            Err(err) => {
                report(&self.deps.error_log, "import_backup", &err);
                return Err(import_failed(err));
            }
        };
        let Some(doc) = picked else {
            info!(target: "headlog", event = "import_cancelled");
            return Ok(None);
        };

        match self.import_document(&doc).await {
            Ok(meta) => {
                info!(
                    target: "headlog",
                    event = "backup_imported",
                    id = %meta.id,
                    source = %doc.path.display(),
                    schema_version = meta.schema_version
                );
                Ok(Some(meta))
            }
            Err(err) => {
                report(&self.deps.error_log, "import_backup", &err);
                Err(import_failed(err))
            }
        }
    }

    async fn import_document(&self, doc: &PickedDocument) -> AppResult<BackupMetadata> {
        let inventory = self.deps.inventory();
        inventory.ensure_dir()?;
        match document_extension(doc).as_deref() {
            Some(ext) if SNAPSHOT_IMPORT_EXTENSIONS.contains(&ext) => {
                self.import_snapshot(&doc.path).await
            }
            Some("json") => self.import_json(&doc.path).await,
            _ => Err(unsupported_file(&doc.name)),
        }
    }

    async fn import_snapshot(&self, source: &Path) -> AppResult<BackupMetadata> {
        let kind = infer::get_from_path(source).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "sniff_import")
                .with_context("path", source.display().to_string())
        })?;
        if kind.map(|k| k.mime_type()) != Some(SQLITE_MIME) {
            return Err(corrupt("Imported file is not a SQLite database", source));
        }

        let timestamp = now_ms();
        let id = generate_backup_id(BackupKind::Manual, timestamp);
        let artifact = self.deps.paths.snapshot_path(&id);
        copy_file_via_partial(
            source.to_path_buf(),
            self.deps.paths.partial_path(&artifact),
            artifact.clone(),
        )
        .await?;

        let result = self.describe_import(&id, timestamp, &artifact);
        if result.is_err() {
            let _ = fs::remove_file(&artifact);
        }
        result
    }

    fn describe_import(&self, id: &str, timestamp: i64, artifact: &Path) -> AppResult<BackupMetadata> {
        let schema_version = inspect::read_schema_version(artifact).map_err(|err| {
            corrupt("Imported database could not be opened", artifact).with_cause(err)
        })?;
        let current = self.deps.migrator.current_version();
        if schema_version > current {
            return Err(incompatible_schema_version(schema_version, current));
        }

        let meta = BackupMetadata {
            id: id.to_string(),
            timestamp,
            app_version: self.deps.config.app_version.clone(),
            schema_version,
            episode_count: 0,
            medication_count: 0,
            file_size: fs::metadata(artifact).map(|m| m.len()).unwrap_or(0),
            file_name: format!("{id}.db"),
            backup_type: BackupType::Snapshot,
            sha256: Some(inspect::file_sha256(artifact)?),
        };
        self.deps.inventory().write_sidecar(&meta)?;
        Ok(meta)
    }

    #[cfg(not(feature = "legacy_json"))]
    async fn import_json(&self, _source: &Path) -> AppResult<BackupMetadata> {
        Err(super::error::legacy_json_retired())
    }

    #[cfg(feature = "legacy_json")]
    async fn import_json(&self, source: &Path) -> AppResult<BackupMetadata> {
        let bytes = fs::read(source).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_import")
                .with_context("path", source.display().to_string())
        })?;
        let mut data: super::BackupData = serde_json::from_slice(&bytes).map_err(|err| {
            corrupt("Imported JSON is not a backup", source).with_cause(AppError::from(err))
        })?;
        let current = self.deps.migrator.current_version();
        if data.metadata.schema_version > current {
            return Err(incompatible_schema_version(data.metadata.schema_version, current));
        }

        let id = generate_backup_id(BackupKind::Manual, now_ms());
        data.metadata.id = id.clone();
        data.metadata.file_name = format!("{id}.json");
        data.metadata.backup_type = BackupType::Json;
        data.metadata.sha256 = None;
        let payload = serde_json::to_vec_pretty(&data)
            .map_err(|err| AppError::from(err).with_context("operation", "serialize_import"))?;

        let dest = self.deps.paths.json_path(&id);
        let write_payload = payload.clone();
        task::spawn_blocking(move || db::write_atomic(&dest, &write_payload))
            .await
            .map_err(|err| {
                AppError::new("BACKUP/TASK", "Import write task panicked")
                    .with_context("error", err.to_string())
            })??;

        let mut meta = data.metadata;
        meta.file_size = payload.len() as u64;
        Ok(meta)
    }

    /// Writes every diary row to a timestamped JSON file in the export
    /// directory and shares it.
    pub async fn export_data_as_json(&self) -> AppResult<PathBuf> {
        match self.write_data_export().await {
            Ok(path) => Ok(path),
            Err(err) => {
                report(&self.deps.error_log, "export_data_as_json", &err);
                Err(export_failed(err))
            }
        }
    }

    async fn write_data_export(&self) -> AppResult<PathBuf> {
        let pool = self.deps.db.pool().await?;
        let gathered = gather(&pool, &GatherLimits::default()).await?;
        let timestamp = now_ms();
        let id = generate_backup_id(BackupKind::Manual, timestamp);
        let schema_version = self.deps.migrator.schema_version(&pool).await?;
        let file_name = format!("headlog-export-{}.json", compact_stamp(timestamp));

        let meta = BackupMetadata {
            id,
            timestamp,
            app_version: self.deps.config.app_version.clone(),
            schema_version,
            episode_count: gathered.episodes.len() as i64,
            medication_count: gathered.medications.len() as i64,
            file_size: 0,
            file_name: file_name.clone(),
            backup_type: BackupType::Json,
            sha256: None,
        };
        let payload = serde_json::to_vec_pretty(&gathered.into_data(meta, None))
            .map_err(|err| AppError::from(err).with_context("operation", "serialize_export"))?;

        let export_dir = self.deps.config.export_dir.clone();
        fs::create_dir_all(&export_dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_export_dir")
                .with_context("path", export_dir.display().to_string())
        })?;
        let path = export_dir.join(file_name);
        let dest = path.clone();
        task::spawn_blocking(move || db::write_atomic(&dest, &payload))
            .await
            .map_err(|err| {
                AppError::new("BACKUP/TASK", "Export write task panicked")
                    .with_context("error", err.to_string())
            })??;

        let request = ShareRequest {
            path: path.clone(),
            mime_type: share_mime(&path, BackupType::Json),
            title: "Headlog data export".to_string(),
        };
        self.share.share(&request)?;
        info!(target: "headlog", event = "data_exported", path = %path.display());
        Ok(path)
    }
}
