use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::task;
use tracing::{info, warn};

use super::error::{backup_not_found, corrupt, incompatible_schema_version, restore_failed};
use super::metadata::{BackupMetadata, BackupType};
use super::BackupDeps;
use crate::db::{self, copy_contents, inspect, swap, sync_dir};
use crate::error_log::report;
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// What a successful restore did to the live database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub backup_schema_version: i64,
    /// Version of the live database once migrations have run.
    pub schema_version: i64,
    pub migrations_applied: Vec<i64>,
    /// Copy of the database as it was before the restore, when there was one.
    pub safety_backup: Option<PathBuf>,
    /// Rows written by a JSON restore; `0` for snapshots.
    pub rows_restored: usize,
}

async fn blocking<T, F>(operation: &'static str, f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    task::spawn_blocking(f).await.map_err(|err| {
        AppError::new("BACKUP/TASK", "Restore task panicked")
            .with_context("operation", operation)
            .with_context("error", err.to_string())
    })?
}

fn copy_synced(from: &Path, to: &Path, operation: &'static str) -> AppResult<()> {
    let result = copy_contents(from, to)
        .map(|_| ())
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", operation)
                .with_context("from", from.display().to_string())
                .with_context("to", to.display().to_string())
        });
    if result.is_err() {
        let _ = fs::remove_file(to);
    } else if let Some(parent) = to.parent() {
        sync_dir(parent);
    }
    result
}

/// Replaces the live database with the contents of a backup.
#[derive(Clone)]
pub struct BackupRestorer {
    deps: BackupDeps,
}

impl BackupRestorer {
    pub fn new(deps: BackupDeps) -> Self {
        Self { deps }
    }

    /// Restores backup `id` over the live database. A refused or failed
    /// restore leaves the live database as it was and open.
    pub async fn restore_backup(&self, id: &str) -> AppResult<RestoreReport> {
        let result = match self.deps.inventory().load_metadata(id) {
            Ok(Some(meta)) => match meta.backup_type {
                BackupType::Snapshot => self.restore_from_snapshot(&meta).await,
                BackupType::Json => self.restore_from_json(&meta).await,
            },
            Ok(None) => Err(backup_not_found(id)),
            Err(err) => Err(err),
        };
        match result {
            Ok(restored) => {
                info!(
                    target: "headlog",
                    event = "backup_restored",
                    id,
                    backup_type = ?restored.backup_type,
                    from_version = restored.backup_schema_version,
                    to_version = restored.schema_version
                );
                Ok(restored)
            }
            Err(err) => {
                report(&self.deps.error_log, "restore_backup", &err);
                Err(restore_failed(err))
            }
        }
    }

    fn check_compatible(&self, backup_version: i64) -> AppResult<()> {
        let current = self.deps.migrator.current_version();
        if backup_version > current {
            return Err(incompatible_schema_version(backup_version, current));
        }
        Ok(())
    }

    /// Checkpoints and copies the live file beside itself. `None` when there is
    /// no live file to protect.
    async fn take_safety_copy(&self) -> AppResult<Option<PathBuf>> {
        let live = self.deps.paths.db_path().to_path_buf();
        if !live.exists() {
            return Ok(None);
        }
        let dest = self.deps.paths.safety_backup_path(now_ms())?;
        let copy_to = dest.clone();
        blocking("safety_copy", move || {
            copy_synced(&live, &copy_to, "safety_copy")
        })
        .await?;
        info!(target: "headlog", event = "restore_safety_copy", path = %dest.display());
        Ok(Some(dest))
    }

    async fn checkpoint_live(&self) {
        if let Some(pool) = self.deps.db.try_pool().await {
            if let Err(err) = db::checkpoint_wal(&pool).await {
                warn!(target: "headlog", event = "restore_checkpoint_failed", error = %err);
            }
        }
    }

    /// Verifies the artifact and stages a copy beside the live file.
    async fn stage_snapshot(&self, meta: &BackupMetadata) -> AppResult<PathBuf> {
        let artifact = self.deps.paths.artifact_path(meta);
        if !artifact.exists() {
            return Err(corrupt("Snapshot file is missing", &artifact));
        }
        if !inspect::file_has_sqlite_header(&artifact)? {
            return Err(corrupt("Snapshot is not a SQLite database", &artifact));
        }
        if let Some(expected) = &meta.sha256 {
            let actual = inspect::file_sha256(&artifact)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(corrupt("Snapshot checksum does not match its metadata", &artifact)
                    .with_context("expected_sha256", expected.clone())
                    .with_context("actual_sha256", actual));
            }
        }

        let staged = self.deps.paths.staged_restore_path()?;
        let (from, to) = (artifact.clone(), staged.clone());
        blocking("stage_snapshot", move || {
            copy_synced(&from, &to, "stage_snapshot")
        })
        .await?;

        let staged_version = match inspect::read_schema_version(&staged) {
            Ok(version) => version,
            Err(err) => {
                let _ = fs::remove_file(&staged);
                return Err(corrupt("Snapshot could not be opened", &artifact).with_cause(err));
            }
        };
        if let Err(err) = self.check_compatible(staged_version) {
            let _ = fs::remove_file(&staged);
            return Err(err);
        }
        Ok(staged)
    }

    async fn restore_from_snapshot(&self, meta: &BackupMetadata) -> AppResult<RestoreReport> {
        self.check_compatible(meta.schema_version)?;
        let staged = self.stage_snapshot(meta).await?;
        let live = self.deps.paths.db_path().to_path_buf();

        self.checkpoint_live().await;
        self.deps.db.close().await;

        let safety_backup = match self.take_safety_copy().await {
            Ok(path) => path,
            Err(err) => {
                let _ = fs::remove_file(&staged);
                self.reopen_after_failure().await;
                return Err(err);
            }
        };

        let (swap_live, swap_staged) = (live.clone(), staged.clone());
        let swapped = blocking("replace_live_database", move || {
            swap::replace_live_database(&swap_live, &swap_staged)
        })
        .await;
        if let Err(mut err) = swapped {
            let _ = fs::remove_file(&staged);
            if let Some(path) = &safety_backup {
                err = err.with_context("safety_backup", path.display().to_string());
            }
            if live.exists() {
                self.reopen_after_failure().await;
            }
            return Err(err);
        }

        let pool = self.deps.db.reopen().await?;
        self.deps.migrator.reinitialize(&pool).await?;
        let migrated = self.deps.migrator.run_pending_migrations(&pool).await?;

        Ok(RestoreReport {
            backup_id: meta.id.clone(),
            backup_type: BackupType::Snapshot,
            backup_schema_version: migrated.from_version,
            schema_version: migrated.to_version,
            migrations_applied: migrated.applied,
            safety_backup,
            rows_restored: 0,
        })
    }

    async fn reopen_after_failure(&self) {
        if let Err(err) = self.deps.db.reopen().await {
            warn!(target: "headlog", event = "restore_reopen_failed", error = %err);
        }
    }

    #[cfg(not(feature = "legacy_json"))]
    async fn restore_from_json(&self, _meta: &BackupMetadata) -> AppResult<RestoreReport> {
        Err(super::error::legacy_json_retired())
    }

    #[cfg(feature = "legacy_json")]
    async fn restore_from_json(&self, meta: &BackupMetadata) -> AppResult<RestoreReport> {
        let path = self.deps.paths.artifact_path(meta);
        let bytes = fs::read(&path).map_err(|err| {
            corrupt("JSON backup file is missing", &path).with_cause(AppError::from(err))
        })?;
        let data: super::BackupData = serde_json::from_slice(&bytes).map_err(|err| {
            corrupt("JSON backup is not readable", &path).with_cause(AppError::from(err))
        })?;
        self.check_compatible(data.metadata.schema_version)?;
        if data
            .schema_sql
            .as_deref()
            .is_some_and(|sql| sql.trim().is_empty())
        {
            return Err(corrupt("JSON backup carries an empty schema", &path));
        }

        let pool = self.deps.db.pool().await?;
        self.checkpoint_live().await;
        let safety_backup = self.take_safety_copy().await?;

        let rows_restored = match legacy::load(&pool, &data).await {
            Ok(rows) => rows,
            Err(err) => {
                return Err(match &safety_backup {
                    Some(path) => err.with_context("safety_backup", path.display().to_string()),
                    None => err,
                })
            }
        };
        let migrated = self.deps.migrator.run_pending_migrations(&pool).await?;

        Ok(RestoreReport {
            backup_id: meta.id.clone(),
            backup_type: BackupType::Json,
            backup_schema_version: data.metadata.schema_version,
            schema_version: migrated.to_version,
            migrations_applied: migrated.applied,
            safety_backup,
            rows_restored,
        })
    }
}

/// Loading a legacy JSON document into the live database inside one transaction.
#[cfg(feature = "legacy_json")]
mod legacy {
    use sqlx::{Connection, SqliteConnection, SqlitePool};
    use tracing::{info, warn};

    use crate::backup::BackupData;
    use crate::migrate::{ensure_version_table, split_statements, stamp_version};
    use crate::repo::{self, Entity};
    use crate::{AppError, AppResult};

    /// Child rows whose required parent may be missing from a bounded export.
    const ORPHAN_CHECKS: [(&str, &str, &str); 4] = [
        ("episode_notes", "episode_id", "episodes"),
        ("intensity_readings", "episode_id", "episodes"),
        ("medication_doses", "medication_id", "medications"),
        ("medication_schedules", "medication_id", "medications"),
    ];

    fn sql_err(operation: &'static str) -> impl Fn(sqlx::Error) -> AppError {
        move |err| AppError::from(err).with_context("operation", operation)
    }

    async fn set_foreign_keys(conn: &mut SqliteConnection, on: bool) -> AppResult<()> {
        let sql = if on {
            "PRAGMA foreign_keys=ON;"
        } else {
            "PRAGMA foreign_keys=OFF;"
        };
        sqlx::query(sql)
            .execute(&mut *conn)
            .await
            .map_err(sql_err("set_foreign_keys"))?;
        Ok(())
    }

    /// Replaces the diary tables with the document's rows. Foreign keys are
    /// off for the duration so rows can land in any order, and back on for
    /// the connection afterwards whatever happened.
    pub(super) async fn load(pool: &SqlitePool, data: &BackupData) -> AppResult<usize> {
        let mut conn = pool.acquire().await.map_err(sql_err("acquire_connection"))?;
        set_foreign_keys(&mut conn, false).await?;
        let result = load_in_transaction(&mut conn, data).await;
        if let Err(err) = set_foreign_keys(&mut conn, true).await {
            warn!(target: "headlog", event = "foreign_keys_restore_failed", error = %err);
            conn.detach();
        }
        result
    }

    async fn load_in_transaction(conn: &mut SqliteConnection, data: &BackupData) -> AppResult<usize> {
        let mut tx = conn.begin().await.map_err(sql_err("begin_restore"))?;

        match data.schema_sql.as_deref() {
            Some(schema_sql) => {
                drop_user_objects(&mut *tx).await?;
                for stmt in split_statements(schema_sql) {
                    sqlx::query(&stmt)
                        .execute(&mut *tx)
                        .await
                        .map_err(|err| {
                            AppError::from(err)
                                .with_context("operation", "apply_backup_schema")
                                .with_context("sql", stmt.clone())
                        })?;
                }
                ensure_version_table(&mut *tx).await?;
                stamp_version(&mut *tx, data.metadata.schema_version).await?;
            }
            None => {
                for entity in Entity::ALL.iter().rev() {
                    repo::delete_all(&mut *tx, *entity).await?;
                }
            }
        }

        let mut inserted: usize = 0;
        for entity in Entity::ALL {
            let rows = data.rows(entity);
            if rows.is_empty() {
                continue;
            }
            let columns = repo::table_columns(&mut *tx, entity.table()).await?;
            if columns.is_empty() {
                warn!(target: "headlog", event = "restore_table_missing", table = entity.table(), rows = rows.len());
                continue;
            }
            for row in rows {
                if repo::insert_preserving_id(&mut *tx, entity, row, &columns).await? {
                    inserted += 1;
                }
            }
        }

        for (table, column, parent) in ORPHAN_CHECKS {
            if repo::table_columns(&mut *tx, table).await?.is_empty()
                || repo::table_columns(&mut *tx, parent).await?.is_empty()
            {
                continue;
            }
            let dropped = sqlx::query(&format!(
                "DELETE FROM {table} WHERE {column} NOT IN (SELECT id FROM {parent})"
            ))
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "drop_orphaned_rows")
                    .with_context("table", table)
            })?
            .rows_affected();
            if dropped > 0 {
                warn!(target: "headlog", event = "restore_orphans_dropped", table, count = dropped);
                inserted = inserted.saturating_sub(dropped as usize);
            }
        }

        let orphaned = sqlx::query(
            "UPDATE medication_doses SET episode_id = NULL
              WHERE episode_id IS NOT NULL
                AND episode_id NOT IN (SELECT id FROM episodes)",
        )
        .execute(&mut *tx)
        .await
        .map_err(sql_err("clear_dangling_episode_links"))?
        .rows_affected();
        if orphaned > 0 {
            info!(target: "headlog", event = "restore_dangling_links_cleared", count = orphaned);
        }

        tx.commit().await.map_err(sql_err("commit_restore"))?;
        Ok(inserted)
    }

    async fn drop_user_objects(conn: &mut SqliteConnection) -> AppResult<()> {
        let objects: Vec<(String, String)> = sqlx::query_as(
            "SELECT type, name FROM sqlite_master
              WHERE type IN ('index', 'table')
                AND name NOT LIKE 'sqlite_%'
                AND name != 'schema_version'
              ORDER BY CASE type WHEN 'index' THEN 0 ELSE 1 END",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(sql_err("list_schema_objects"))?;

        for (kind, name) in objects {
            let sql = if kind == "index" {
                format!("DROP INDEX IF EXISTS \"{name}\"")
            } else {
                format!("DROP TABLE IF EXISTS \"{name}\"")
            };
            sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "drop_schema_object")
                        .with_context("name", name.clone())
                })?;
        }
        Ok(())
    }
}
