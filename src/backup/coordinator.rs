use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::creator::BackupCreator;
use super::exporter::BackupExporter;
use super::inventory::BackupInventory;
use super::metadata::{BackupKind, BackupMetadata};
use super::restorer::{BackupRestorer, RestoreReport};
use super::validator::BackupValidator;
use super::BackupDeps;
use crate::error_log::report;
use crate::kv_store::StoreHandle;
use crate::platform::{DocumentPicker, ShareRequest, ShareTarget};
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Outcome of maintenance work that must never fail its caller. The error has
/// already been written to the error log when this is `Failed`.
#[derive(Debug, Clone)]
#[must_use]
pub enum NonFatal<T> {
    Completed(T),
    Failed(AppError),
}

impl<T> NonFatal<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, NonFatal::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            NonFatal::Completed(value) => Some(value),
            NonFatal::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&AppError> {
        match self {
            NonFatal::Completed(_) => None,
            NonFatal::Failed(err) => Some(err),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub kept: usize,
    pub deleted: Vec<String>,
    /// Automatic backups that should have gone but could not be deleted.
    pub failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeeklyBackupStatus {
    Created(BackupMetadata),
    NotDue { next_due_at: i64 },
}

/// Single entry point the host talks to.
#[derive(Clone)]
pub struct BackupCoordinator {
    deps: BackupDeps,
    store: StoreHandle,
    creator: BackupCreator,
    restorer: BackupRestorer,
    exporter: BackupExporter,
    validator: BackupValidator,
}

impl BackupCoordinator {
    pub fn new(deps: BackupDeps, store: StoreHandle, share: Arc<dyn ShareTarget>) -> Self {
        Self {
            creator: BackupCreator::new(deps.clone()),
            restorer: BackupRestorer::new(deps.clone()),
            exporter: BackupExporter::new(deps.clone(), share),
            validator: BackupValidator::new(deps.paths.clone()),
            store,
            deps,
        }
    }

    fn inventory(&self) -> BackupInventory {
        self.deps.inventory()
    }

    pub fn deps(&self) -> &BackupDeps {
        &self.deps
    }

    /// Creates the backup directory.
    pub fn initialize(&self) -> AppResult<()> {
        self.inventory().ensure_dir()
    }

    pub async fn create_snapshot_backup(&self, kind: BackupKind) -> AppResult<BackupMetadata> {
        self.creator.create_snapshot_backup(kind).await
    }

    pub async fn create_backup(&self, kind: BackupKind) -> AppResult<BackupMetadata> {
        self.creator.create_backup(kind).await
    }

    pub fn list_backups(&self) -> AppResult<Vec<BackupMetadata>> {
        self.inventory().list_backups()
    }

    pub fn get_backup(&self, id: &str) -> AppResult<BackupMetadata> {
        self.inventory().get_metadata(id)
    }

    pub fn delete_backup(&self, id: &str) -> AppResult<()> {
        self.inventory().delete_backup(id)
    }

    pub async fn restore_backup(&self, id: &str) -> AppResult<RestoreReport> {
        self.restorer.restore_backup(id).await
    }

    pub async fn export_backup(&self, id: &str) -> AppResult<ShareRequest> {
        self.exporter.export_backup(id).await
    }

    pub async fn import_backup(
        &self,
        picker: &dyn DocumentPicker,
    ) -> AppResult<Option<BackupMetadata>> {
        self.exporter.import_backup(picker).await
    }

    pub async fn export_data_as_json(&self) -> AppResult<std::path::PathBuf> {
        self.exporter.export_data_as_json().await
    }

    pub fn check_for_broken_backups(&self) -> AppResult<usize> {
        self.validator.check_for_broken_backups()
    }

    pub fn cleanup_broken_backups(&self) -> AppResult<usize> {
        self.validator.cleanup_broken_backups()
    }

    pub fn validator(&self) -> &BackupValidator {
        &self.validator
    }

    /// Keeps the newest `max_auto_backups` automatic backups and deletes the
    /// rest. Manual backups are never touched.
    pub fn cleanup_old_auto_backups(&self) -> NonFatal<RetentionReport> {
        let listed = match self.list_backups() {
            Ok(listed) => listed,
            Err(err) => {
                report(&self.deps.error_log, "cleanup_old_auto_backups", &err);
                return NonFatal::Failed(err);
            }
        };

        let limit = self.deps.config.max_auto_backups;
        let automatic: Vec<BackupMetadata> =
            listed.into_iter().filter(|meta| meta.is_automatic()).collect();
        let mut retention = RetentionReport {
            kept: automatic.len().min(limit),
            ..RetentionReport::default()
        };

        for meta in automatic.iter().skip(limit) {
            match self.delete_backup(&meta.id) {
                Ok(()) => retention.deleted.push(meta.id.clone()),
                Err(err) => {
                    retention.failures += 1;
                    report(&self.deps.error_log, "cleanup_old_auto_backups", &err);
                }
            }
        }

        if !retention.deleted.is_empty() || retention.failures > 0 {
            info!(
                target: "headlog",
                event = "auto_backup_retention",
                kept = retention.kept,
                deleted = retention.deleted.len(),
                failures = retention.failures
            );
        }
        NonFatal::Completed(retention)
    }

    pub async fn check_and_create_weekly_backup(&self) -> NonFatal<WeeklyBackupStatus> {
        self.check_and_create_weekly_backup_at(now_ms()).await
    }

    /// Weekly cadence evaluated at `now`. Due when no backup was recorded,
    /// when more than the interval has passed, or when the recorded time is
    /// in the future (clock moved backwards).
    pub async fn check_and_create_weekly_backup_at(&self, now: i64) -> NonFatal<WeeklyBackupStatus> {
        let interval = self.deps.config.weekly_interval_ms;
        if let Some(last) = self.store.last_weekly_backup() {
            if last <= now && now - last <= interval {
                return NonFatal::Completed(WeeklyBackupStatus::NotDue {
                    next_due_at: last.saturating_add(interval),
                });
            }
        }

        let meta = match self.creator.create_snapshot_backup(BackupKind::Automatic).await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(target: "headlog", event = "weekly_backup_failed", error = %err);
                report(&self.deps.error_log, "check_and_create_weekly_backup", &err);
                return NonFatal::Failed(err);
            }
        };

        if let NonFatal::Failed(err) = self.cleanup_old_auto_backups() {
            warn!(target: "headlog", event = "weekly_retention_failed", error = %err);
        }

        if let Err(err) = self.store.set_last_weekly_backup(now) {
            let err = AppError::new("SETTINGS/WRITE", err.to_string())
                .with_context("operation", "persist_weekly_timestamp");
            report(&self.deps.error_log, "check_and_create_weekly_backup", &err);
            return NonFatal::Failed(err);
        }

        info!(target: "headlog", event = "weekly_backup_created", id = %meta.id);
        NonFatal::Completed(WeeklyBackupStatus::Created(meta))
    }
}
