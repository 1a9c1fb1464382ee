use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use fs2::available_space;
use sqlx::SqlitePool;
use tokio::task;
use tracing::{info, warn};

use super::error::{creation_failed, database_file_not_found, low_disk, snapshot_failed};
use super::metadata::{generate_backup_id, BackupData, BackupKind, BackupMetadata, BackupType};
use super::BackupDeps;
use crate::db::{self, copy_contents, inspect, sync_dir};
use crate::error_log::report;
use crate::repo::{self, Entity, Row};
use crate::time::{date_days_ago, now_ms};
use crate::{AppError, AppResult};

const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const JSON_EPISODE_LIMIT: i64 = 50;
const JSON_DOSE_LIMIT: i64 = 100;
const JSON_DAILY_STATUS_DAYS: i64 = 730;

/// How much of each table goes into a JSON document.
#[derive(Debug, Clone, Default)]
pub(crate) struct GatherLimits {
    pub episodes: Option<i64>,
    pub doses: Option<i64>,
    pub daily_status_since: Option<String>,
}

impl GatherLimits {
    fn legacy_backup(now_ms: i64) -> Self {
        Self {
            episodes: Some(JSON_EPISODE_LIMIT),
            doses: Some(JSON_DOSE_LIMIT),
            daily_status_since: Some(date_days_ago(now_ms, JSON_DAILY_STATUS_DAYS)),
        }
    }
}

pub(crate) struct Gathered {
    pub episodes: Vec<Row>,
    pub episode_notes: Vec<Row>,
    pub intensity_readings: Vec<Row>,
    pub daily_status_logs: Vec<Row>,
    pub medications: Vec<Row>,
    pub medication_doses: Vec<Row>,
    pub medication_schedules: Vec<Row>,
}

impl Gathered {
    pub fn into_data(self, metadata: BackupMetadata, schema_sql: Option<String>) -> BackupData {
        BackupData {
            metadata,
            schema_sql,
            episodes: self.episodes,
            episode_notes: self.episode_notes,
            intensity_readings: self.intensity_readings,
            daily_status_logs: self.daily_status_logs,
            medications: self.medications,
            medication_doses: self.medication_doses,
            medication_schedules: self.medication_schedules,
        }
    }
}

fn row_id(row: &Row) -> Option<&str> {
    row.get("id").and_then(|v| v.as_str())
}

/// Reads the diary tables through the repositories. Notes and readings are
/// fetched per exported episode, schedules per medication.
pub(crate) async fn gather(pool: &SqlitePool, limits: &GatherLimits) -> AppResult<Gathered> {
    let episodes = repo::get_all(pool, Entity::Episodes, limits.episodes).await?;
    let mut episode_notes = Vec::new();
    let mut intensity_readings = Vec::new();
    for id in episodes.iter().filter_map(row_id) {
        episode_notes.extend(repo::get_by_parent_id(pool, Entity::EpisodeNotes, id).await?);
        intensity_readings
            .extend(repo::get_by_parent_id(pool, Entity::IntensityReadings, id).await?);
    }

    let medications = repo::get_all(pool, Entity::Medications, None).await?;
    let mut medication_schedules = Vec::new();
    for id in medications.iter().filter_map(row_id) {
        medication_schedules
            .extend(repo::get_by_parent_id(pool, Entity::MedicationSchedules, id).await?);
    }
    let medication_doses = repo::get_all(pool, Entity::MedicationDoses, limits.doses).await?;

    let daily_status_logs = match &limits.daily_status_since {
        Some(since) => repo::get_daily_status_since(pool, since).await?,
        None => repo::get_all(pool, Entity::DailyStatusLogs, None).await?,
    };

    Ok(Gathered {
        episodes,
        episode_notes,
        intensity_readings,
        daily_status_logs,
        medications,
        medication_doses,
        medication_schedules,
    })
}

/// `CREATE TABLE` then `CREATE INDEX` statements for every user object except
/// the schema version table, each terminated by `;`.
pub(crate) async fn capture_schema_sql(pool: &SqlitePool) -> AppResult<String> {
    let statements: Vec<String> = sqlx::query_scalar(
        "SELECT sql FROM sqlite_master
          WHERE type IN ('table', 'index')
            AND sql IS NOT NULL
            AND name NOT LIKE 'sqlite_%'
            AND name != 'schema_version'
          ORDER BY CASE type WHEN 'table' THEN 0 ELSE 1 END, rowid",
    )
    .fetch_all(pool)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "capture_schema_sql"))?;
    Ok(statements
        .iter()
        .map(|sql| format!("{};", sql.trim_end_matches(';')))
        .collect::<Vec<_>>()
        .join("\n"))
}

fn required_free_bytes(db_bytes: u64) -> u64 {
    ((db_bytes as f64) * REQUIRED_FREE_MULTIPLIER).ceil() as u64
}

fn free_disk_space(path: &Path) -> AppResult<u64> {
    if let Ok(fake) = env::var("HEADLOG_FAKE_FREE_BYTES") {
        if let Ok(value) = fake.parse::<u64>() {
            return Ok(value);
        }
    }
    available_space(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", path.display().to_string())
    })
}

fn database_bytes(db_path: &Path) -> u64 {
    [
        db_path.to_path_buf(),
        db::wal_path(db_path),
        db::shm_path(db_path),
    ]
    .iter()
    .map(|path| fs::metadata(path).map(|meta| meta.len()).unwrap_or(0))
    .sum()
}

/// Copies `src` to `dest` through a `.partial` file so `dest` only ever
/// appears complete.
fn copy_via_partial(src: &Path, partial: &Path, dest: &Path) -> AppResult<()> {
    let result = (|| -> AppResult<()> {
        copy_contents(src, partial).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "copy_database")
                .with_context("from", src.display().to_string())
                .with_context("to", partial.display().to_string())
        })?;
        fs::rename(partial, dest).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "finalize_backup")
                .with_context("from", partial.display().to_string())
                .with_context("to", dest.display().to_string())
        })?;
        if let Some(parent) = dest.parent() {
            sync_dir(parent);
        }
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(partial);
    }
    result
}

pub(crate) async fn copy_file_via_partial(
    src: PathBuf,
    partial: PathBuf,
    dest: PathBuf,
) -> AppResult<()> {
    task::spawn_blocking(move || copy_via_partial(&src, &partial, &dest))
        .await
        .map_err(|err| {
            AppError::new("BACKUP/TASK", "Backup copy task panicked")
                .with_context("error", err.to_string())
        })?
}

async fn count_or_zero(pool: Option<&SqlitePool>, entity: Entity) -> i64 {
    let Some(pool) = pool else {
        return 0;
    };
    match repo::count(pool, entity).await {
        Ok(count) => count,
        Err(err) => {
            warn!(
                target: "headlog",
                event = "backup_count_failed",
                table = entity.table(),
                error = %err
            );
            0
        }
    }
}

/// Produces new backup artifacts in the backup directory.
#[derive(Clone)]
pub struct BackupCreator {
    deps: BackupDeps,
}

impl BackupCreator {
    pub fn new(deps: BackupDeps) -> Self {
        Self { deps }
    }

    fn prepare_dir(&self) -> AppResult<()> {
        self.deps.inventory().ensure_dir()
    }

    /// Byte copy of the live database plus a `.meta.json` sidecar.
    pub async fn create_snapshot_backup(&self, kind: BackupKind) -> AppResult<BackupMetadata> {
        self.prepare_dir()?;
        match self.snapshot(kind).await {
            Ok(meta) => {
                info!(
                    target: "headlog",
                    event = "snapshot_backup_created",
                    id = %meta.id,
                    size = meta.file_size,
                    schema_version = meta.schema_version
                );
                Ok(meta)
            }
            Err(err) => {
                report(&self.deps.error_log, "create_snapshot_backup", &err);
                Err(snapshot_failed(err))
            }
        }
    }

    async fn snapshot(&self, kind: BackupKind) -> AppResult<BackupMetadata> {
        let paths = &self.deps.paths;
        let db_path = paths.db_path().to_path_buf();
        if !db_path.exists() {
            return Err(database_file_not_found(&db_path));
        }

        let pool = self.deps.db.try_pool().await;
        if let Some(pool) = &pool {
            if let Err(err) = db::checkpoint_wal(pool).await {
                warn!(target: "headlog", event = "backup_checkpoint_failed", error = %err);
            }
        }

        let required = required_free_bytes(database_bytes(&db_path));
        let available = free_disk_space(paths.backup_dir())?;
        if available < required {
            return Err(low_disk(available, required));
        }

        let timestamp = now_ms();
        let id = generate_backup_id(kind, timestamp);
        let artifact = paths.snapshot_path(&id);
        copy_file_via_partial(db_path.clone(), paths.partial_path(&artifact), artifact.clone())
            .await?;

        let result = self.describe_snapshot(&id, timestamp, &artifact, pool.as_ref()).await;
        if result.is_err() {
            let _ = fs::remove_file(&artifact);
        }
        result
    }

    async fn describe_snapshot(
        &self,
        id: &str,
        timestamp: i64,
        artifact: &Path,
        pool: Option<&SqlitePool>,
    ) -> AppResult<BackupMetadata> {
        let episode_count = count_or_zero(pool, Entity::Episodes).await;
        let medication_count = count_or_zero(pool, Entity::Medications).await;

        let schema_version = match pool {
            Some(pool) => self.deps.migrator.schema_version(pool).await?,
            None => inspect::read_schema_version(artifact)?,
        };
        let file_size = fs::metadata(artifact).map(|meta| meta.len()).unwrap_or(0);
        let sha256 = inspect::file_sha256(artifact)?;

        let meta = BackupMetadata {
            id: id.to_string(),
            timestamp,
            app_version: self.deps.config.app_version.clone(),
            schema_version,
            episode_count,
            medication_count,
            file_size,
            file_name: format!("{id}.db"),
            backup_type: BackupType::Snapshot,
            sha256: Some(sha256),
        };
        self.deps.inventory().write_sidecar(&meta)?;
        Ok(meta)
    }

    /// Legacy full-data JSON backup with the captured schema.
    pub async fn create_backup(&self, kind: BackupKind) -> AppResult<BackupMetadata> {
        self.prepare_dir()?;
        match self.json_backup(kind).await {
            Ok(meta) => {
                info!(
                    target: "headlog",
                    event = "json_backup_created",
                    id = %meta.id,
                    size = meta.file_size
                );
                Ok(meta)
            }
            Err(err) => {
                report(&self.deps.error_log, "create_backup", &err);
                Err(creation_failed(err))
            }
        }
    }

    async fn json_backup(&self, kind: BackupKind) -> AppResult<BackupMetadata> {
        let pool = self.deps.db.pool().await?;
        let timestamp = now_ms();
        let gathered = gather(&pool, &GatherLimits::legacy_backup(timestamp)).await?;
        let schema_sql = capture_schema_sql(&pool).await?;
        let schema_version = self.deps.migrator.schema_version(&pool).await?;

        let id = generate_backup_id(kind, timestamp);
        let mut meta = BackupMetadata {
            id: id.clone(),
            timestamp,
            app_version: self.deps.config.app_version.clone(),
            schema_version,
            episode_count: gathered.episodes.len() as i64,
            medication_count: gathered.medications.len() as i64,
            file_size: 0,
            file_name: format!("{id}.json"),
            backup_type: BackupType::Json,
            sha256: None,
        };
        let data = gathered.into_data(meta.clone(), Some(schema_sql));
        let payload = serde_json::to_vec_pretty(&data)
            .map_err(|err| AppError::from(err).with_context("operation", "serialize_backup"))?;
        meta.file_size = payload.len() as u64;

        let path = self.deps.paths.json_path(&id);
        task::spawn_blocking(move || db::write_atomic(&path, &payload))
            .await
            .map_err(|err| {
                AppError::new("BACKUP/TASK", "Backup write task panicked")
                    .with_context("error", err.to_string())
            })??;
        Ok(meta)
    }
}
