#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::Arc;

use headlog_lib::backup::{BackupCoordinator, BackupDeps, BackupMetadata, BackupType};
use headlog_lib::config::BackupConfig;
use headlog_lib::db::{inspect, LiveDatabase};
use headlog_lib::error_log::{ErrorLog, MemoryErrorLog};
use headlog_lib::kv_store::StoreHandle;
use headlog_lib::migrate::{SchemaMigrator, MIGRATIONS};
use headlog_lib::platform::{RecordingShare, ShareTarget};
use headlog_lib::repo::{self, Entity, Row};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;

pub const T0: i64 = 1_700_000_000_000;

pub struct Fixture {
    pub dir: TempDir,
    pub config: BackupConfig,
    pub db: Arc<LiveDatabase>,
    pub error_log: Arc<MemoryErrorLog>,
    pub share: Arc<RecordingShare>,
    pub store: StoreHandle,
    pub coordinator: BackupCoordinator,
}

impl Fixture {
    pub async fn pool(&self) -> SqlitePool {
        self.db.pool().await.expect("live database open")
    }

    pub fn deps(&self) -> &BackupDeps {
        self.coordinator.deps()
    }
}

fn build(
    dir: TempDir,
    config: BackupConfig,
    db: Arc<LiveDatabase>,
) -> Fixture {
    let error_log = Arc::new(MemoryErrorLog::default());
    let share = Arc::new(RecordingShare::default());
    let store = StoreHandle::in_memory();
    let log: Arc<dyn ErrorLog> = error_log.clone();
    let target: Arc<dyn ShareTarget> = share.clone();
    let coordinator = BackupCoordinator::new(
        BackupDeps::new(config.clone(), db.clone(), log),
        store.clone(),
        target,
    );
    coordinator.initialize().unwrap();
    Fixture {
        dir,
        config,
        db,
        error_log,
        share,
        store,
        coordinator,
    }
}

/// A migrated live database in a fresh data directory.
pub async fn fixture() -> Fixture {
    fixture_with(|config| config).await
}

pub async fn fixture_with(configure: impl FnOnce(BackupConfig) -> BackupConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = configure(BackupConfig::for_data_dir(dir.path()));
    let db = Arc::new(LiveDatabase::open(&config.db_path).await.unwrap());
    SchemaMigrator::new()
        .run_pending_migrations(&db.pool().await.unwrap())
        .await
        .unwrap();
    build(dir, config, db)
}

/// No database at all; enough for inventory-only operations.
pub fn offline_fixture(configure: impl FnOnce(BackupConfig) -> BackupConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = configure(BackupConfig::for_data_dir(dir.path()));
    let db = Arc::new(LiveDatabase::closed(&config.db_path));
    build(dir, config, db)
}

pub async fn seed_diary(pool: &SqlitePool) {
    let statements = [
        "INSERT INTO episodes (id, start_time, end_time, peak_intensity, locations, created_at, updated_at)
         VALUES ('ep-1', 1700000000000, 1700003600000, 7.5, '[\"left_temple\"]', 1700000000000, 1700000000000)",
        "INSERT INTO episodes (id, start_time, created_at, updated_at)
         VALUES ('ep-2', 1700100000000, 1700100000000, 1700100000000)",
        "INSERT INTO episode_notes (id, episode_id, timestamp, note, created_at)
         VALUES ('note-1', 'ep-1', 1700000100000, 'aura first', 1700000100000)",
        "INSERT INTO intensity_readings (id, episode_id, timestamp, intensity, created_at)
         VALUES ('read-1', 'ep-1', 1700000200000, 6, 1700000200000)",
        "INSERT INTO medications (id, name, type, dosage_amount, dosage_unit, created_at, updated_at)
         VALUES ('med-1', 'Sumatriptan', 'rescue', 50, 'mg', 1690000000000, 1690000000000)",
        "INSERT INTO medication_doses (id, medication_id, timestamp, quantity, episode_id, created_at)
         VALUES ('dose-1', 'med-1', 1700000300000, 1, 'ep-1', 1700000300000)",
        "INSERT INTO medication_schedules (id, medication_id, time, dosage)
         VALUES ('sched-1', 'med-1', '08:00', 1)",
        "INSERT INTO daily_status_logs (id, date, status, created_at, updated_at)
         VALUES ('day-1', '2099-01-01', 'green', 1700000000000, 1700000000000)",
    ];
    for sql in statements {
        sqlx::query(sql).execute(pool).await.unwrap();
    }
}

pub async fn count(pool: &SqlitePool, entity: Entity) -> i64 {
    repo::count(pool, entity).await.unwrap()
}

pub async fn all_rows(pool: &SqlitePool, entity: Entity) -> Vec<Row> {
    let mut rows = repo::get_all(pool, entity, None).await.unwrap();
    rows.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    rows
}

/// A standalone database file migrated to `version` with one episode in it.
pub async fn write_database_at_version(path: &Path, version: usize) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Delete),
        )
        .await
        .unwrap();
    SchemaMigrator::with_migrations(&MIGRATIONS[..version])
        .run_pending_migrations(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO episodes (id, start_time, created_at, updated_at)
         VALUES ('old-ep', 1600000000000, 1600000000000, 1600000000000)",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;
}

/// A database file whose version table claims `version`, whatever the schema.
pub async fn write_database_stamped(path: &Path, version: i64) {
    write_database_at_version(path, MIGRATIONS.len()).await;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .journal_mode(SqliteJournalMode::Delete),
        )
        .await
        .unwrap();
    sqlx::query("UPDATE schema_version SET version = ? WHERE id = 1")
        .bind(version)
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;
}

pub fn snapshot_metadata(id: &str, timestamp: i64, schema_version: i64) -> BackupMetadata {
    BackupMetadata {
        id: id.to_string(),
        timestamp,
        app_version: "0.5.0".into(),
        schema_version,
        episode_count: 1,
        medication_count: 0,
        file_size: 0,
        file_name: format!("{id}.db"),
        backup_type: BackupType::Snapshot,
        sha256: None,
    }
}

/// Places `source` in the backup directory as snapshot `id` with a sidecar.
pub fn install_snapshot(fx: &Fixture, id: &str, source: &Path, schema_version: i64) -> BackupMetadata {
    let inventory = fx.deps().inventory();
    let artifact = inventory.paths().snapshot_path(id);
    std::fs::copy(source, &artifact).unwrap();
    let mut meta = snapshot_metadata(id, T0, schema_version);
    meta.file_size = std::fs::metadata(&artifact).unwrap().len();
    meta.sha256 = Some(inspect::file_sha256(&artifact).unwrap());
    inventory.write_sidecar(&meta).unwrap();
    meta
}
