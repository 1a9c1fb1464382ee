#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use headlog_lib::backup::error::{DATABASE_FILE_NOT_FOUND, NOT_FOUND, RESTORE_FAILED, SNAPSHOT_FAILED};
use headlog_lib::backup::{BackupKind, BackupType};
use headlog_lib::db::inspect;
use headlog_lib::repo::Entity;
use util::{all_rows, count, fixture, offline_fixture, seed_diary};

#[tokio::test]
async fn snapshot_restore_brings_back_every_row() {
    let fx = fixture().await;
    seed_diary(&fx.pool().await).await;

    let mut before = Vec::new();
    for entity in Entity::ALL {
        before.push(all_rows(&fx.pool().await, entity).await);
    }

    let meta = fx
        .coordinator
        .create_snapshot_backup(BackupKind::Manual)
        .await
        .unwrap();
    assert!(meta.id.starts_with("backup_"));
    assert_eq!(meta.backup_type, BackupType::Snapshot);
    assert_eq!(meta.schema_version, 7);
    assert_eq!(meta.episode_count, 2);
    assert_eq!(meta.medication_count, 1);
    let artifact = fx.deps().paths.artifact_path(&meta);
    assert_eq!(meta.sha256.as_deref(), Some(inspect::file_sha256(&artifact).unwrap().as_str()));
    assert!(inspect::file_has_sqlite_header(&artifact).unwrap());

    let pool = fx.pool().await;
    sqlx::query("DELETE FROM episodes WHERE id = 'ep-2'")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO medications (id, name, type, dosage_amount, dosage_unit, created_at, updated_at)
         VALUES ('med-late', 'Late', 'other', 1, 'mg', 1, 1)",
    )
    .execute(&pool)
    .await
    .unwrap();
    drop(pool);

    let report = fx.coordinator.restore_backup(&meta.id).await.unwrap();
    assert_eq!(report.backup_id, meta.id);
    assert_eq!(report.schema_version, 7);
    assert!(report.migrations_applied.is_empty());
    let safety = report.safety_backup.expect("live database existed");
    assert!(safety.exists());

    let pool = fx.pool().await;
    for (entity, rows) in Entity::ALL.into_iter().zip(before) {
        assert_eq!(all_rows(&pool, entity).await, rows, "{} differs", entity.table());
    }
    assert_eq!(count(&pool, Entity::Medications).await, 1);
}

#[tokio::test]
async fn restore_removes_stale_wal_sidecars() {
    let fx = fixture().await;
    seed_diary(&fx.pool().await).await;
    let meta = fx
        .coordinator
        .create_snapshot_backup(BackupKind::Manual)
        .await
        .unwrap();

    fx.coordinator.restore_backup(&meta.id).await.unwrap();

    assert!(!fx.config.db_path.with_extension("db.restore.partial").exists());
    let pool = fx.pool().await;
    let (check,): (String,) = sqlx::query_as("PRAGMA integrity_check;")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(check, "ok");
    assert_eq!(count(&pool, Entity::Episodes).await, 2);
}

#[tokio::test]
async fn listing_shows_new_snapshot_first() {
    let fx = fixture().await;
    let first = fx
        .coordinator
        .create_snapshot_backup(BackupKind::Manual)
        .await
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = fx
        .coordinator
        .create_snapshot_backup(BackupKind::Automatic)
        .await
        .unwrap();

    let listed = fx.coordinator.list_backups().unwrap();
    let ids: Vec<_> = listed.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, [second.id.clone(), first.id.clone()]);
    assert!(listed[0].is_automatic());

    fx.coordinator.delete_backup(&first.id).unwrap();
    assert_eq!(fx.coordinator.list_backups().unwrap().len(), 1);
}

#[tokio::test]
async fn snapshot_without_database_reports_missing_file() {
    let fx = offline_fixture(|config| config);
    let err = fx
        .coordinator
        .create_snapshot_backup(BackupKind::Manual)
        .await
        .expect_err("no database file");
    assert_eq!(err.code(), SNAPSHOT_FAILED);
    assert!(err.message().starts_with("Failed to create snapshot backup: "));
    assert!(err.chain_contains(DATABASE_FILE_NOT_FOUND));

    let logged = fx.error_log.entries();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].0, "create_snapshot_backup");
    assert!(fx.coordinator.list_backups().unwrap().is_empty());
}

#[tokio::test]
async fn restoring_unknown_id_is_not_found() {
    let fx = fixture().await;
    let err = fx
        .coordinator
        .restore_backup("backup_1_missing")
        .await
        .expect_err("unknown id");
    assert_eq!(err.code(), RESTORE_FAILED);
    assert!(err.chain_contains(NOT_FOUND));
    assert!(fx.db.is_open().await);
}

#[cfg(unix)]
#[tokio::test]
async fn read_only_artifacts_never_make_a_read_only_database() {
    use std::os::unix::fs::PermissionsExt;

    use headlog_lib::platform::PathPicker;

    let fx = fixture().await;
    seed_diary(&fx.pool().await).await;
    let meta = fx
        .coordinator
        .create_snapshot_backup(BackupKind::Manual)
        .await
        .unwrap();
    let artifact = fx.deps().paths.artifact_path(&meta);
    std::fs::set_permissions(&artifact, std::fs::Permissions::from_mode(0o444)).unwrap();

    fx.coordinator.restore_backup(&meta.id).await.unwrap();
    let mode = std::fs::metadata(&fx.config.db_path).unwrap().permissions().mode();
    assert_ne!(mode & 0o200, 0, "live database is not owner-writable: {mode:o}");
    sqlx::query("DELETE FROM episodes WHERE id = 'ep-2'")
        .execute(&fx.pool().await)
        .await
        .unwrap();

    let download = fx.dir.path().join("download.db");
    std::fs::copy(&artifact, &download).unwrap();
    std::fs::set_permissions(&download, std::fs::Permissions::from_mode(0o444)).unwrap();
    let imported = fx
        .coordinator
        .import_backup(&PathPicker::new(&download))
        .await
        .unwrap()
        .expect("not cancelled");
    let imported_mode = std::fs::metadata(fx.deps().paths.artifact_path(&imported))
        .unwrap()
        .permissions()
        .mode();
    assert_ne!(imported_mode & 0o200, 0, "imported artifact kept read-only mode");
}

#[tokio::test]
async fn failed_count_query_degrades_to_zero() {
    let fx = fixture().await;
    let pool = fx.pool().await;
    seed_diary(&pool).await;
    for table in ["medication_schedules", "medication_doses", "medications"] {
        sqlx::query(&format!("DROP TABLE {table}"))
            .execute(&pool)
            .await
            .unwrap();
    }
    drop(pool);

    let meta = fx
        .coordinator
        .create_snapshot_backup(BackupKind::Manual)
        .await
        .unwrap();
    assert_eq!(meta.episode_count, 2);
    assert_eq!(meta.medication_count, 0);
    assert!(fx.deps().paths.artifact_path(&meta).exists());
    assert_eq!(fx.coordinator.list_backups().unwrap().len(), 1);
}
