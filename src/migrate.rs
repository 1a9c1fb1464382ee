use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::{error, info};

use crate::time::now_ms;
use crate::{AppError, AppResult};

pub const SCHEMA_VERSION_TABLE: &str = "schema_version";

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "0001_initial.sql",
        sql: include_str!("../migrations/0001_initial.sql"),
    },
    Migration {
        version: 2,
        name: "0002_episode_notes.sql",
        sql: include_str!("../migrations/0002_episode_notes.sql"),
    },
    Migration {
        version: 3,
        name: "0003_intensity_readings.sql",
        sql: include_str!("../migrations/0003_intensity_readings.sql"),
    },
    Migration {
        version: 4,
        name: "0004_daily_status_logs.sql",
        sql: include_str!("../migrations/0004_daily_status_logs.sql"),
    },
    Migration {
        version: 5,
        name: "0005_dose_status.sql",
        sql: include_str!("../migrations/0005_dose_status.sql"),
    },
    Migration {
        version: 6,
        name: "0006_episode_location.sql",
        sql: include_str!("../migrations/0006_episode_location.sql"),
    },
    Migration {
        version: 7,
        name: "0007_indexes_and_reminders.sql",
        sql: include_str!("../migrations/0007_indexes_and_reminders.sql"),
    },
];

static ADD_COLUMN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+COLUMN\s+(\w+)").expect("valid regex")
});

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.chars().count() > 160 {
        let head: String = trimmed.chars().take(160).collect();
        format!("{head}…")
    } else {
        trimmed.to_string()
    }
}

/// Drops blank lines and `--` comment lines, then splits on `;`.
pub fn split_statements(raw_sql: &str) -> Vec<String> {
    let cleaned = raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n");

    cleaned
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| {
            let upper = s.to_ascii_uppercase();
            upper != "BEGIN" && upper != "BEGIN TRANSACTION" && upper != "COMMIT"
        })
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub applied: Vec<i64>,
}

/// Applies the bundled, integer-versioned migrations and tracks the version in
/// a single-row table inside the database itself.
#[derive(Debug, Clone, Copy)]
pub struct SchemaMigrator {
    migrations: &'static [Migration],
}

impl Default for SchemaMigrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaMigrator {
    pub fn new() -> Self {
        Self {
            migrations: MIGRATIONS,
        }
    }

    pub fn with_migrations(migrations: &'static [Migration]) -> Self {
        Self { migrations }
    }

    /// The schema version this build migrates databases to.
    pub fn current_version(&self) -> i64 {
        self.migrations.iter().map(|m| m.version).max().unwrap_or(0)
    }

    /// Version stamped in the database; `0` when the version table does not exist yet.
    pub async fn schema_version(&self, pool: &SqlitePool) -> AppResult<i64> {
        read_version(pool).await
    }

    /// Binds the migrator to a freshly opened connection: makes sure the version
    /// table exists and returns the version found there.
    pub async fn reinitialize(&self, pool: &SqlitePool) -> AppResult<i64> {
        ensure_version_table(pool).await?;
        let version = read_version(pool).await?;
        info!(
            target: "headlog",
            event = "migrator_reinitialized",
            version,
            target_version = self.current_version()
        );
        Ok(version)
    }

    /// Runs every migration newer than the database's version, one transaction each.
    pub async fn run_pending_migrations(&self, pool: &SqlitePool) -> AppResult<MigrationReport> {
        ensure_version_table(pool).await?;
        let from_version = read_version(pool).await?;
        let target = self.current_version();
        if from_version > target {
            return Err(AppError::new(
                "MIGRATE/DATABASE_NEWER",
                "Database schema is newer than this build supports",
            )
            .with_context("database_version", from_version.to_string())
            .with_context("app_version", target.to_string()));
        }

        let mut applied = Vec::new();
        let mut pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.version > from_version)
            .collect();
        pending.sort_by_key(|m| m.version);

        for migration in pending {
            self.apply_one(pool, migration).await?;
            applied.push(migration.version);
        }

        let to_version = read_version(pool).await?;
        if !applied.is_empty() {
            info!(
                target: "headlog",
                event = "migrations_applied",
                from_version,
                to_version,
                count = applied.len()
            );
        }
        Ok(MigrationReport {
            from_version,
            to_version,
            applied,
        })
    }

    async fn apply_one(&self, pool: &SqlitePool, migration: &Migration) -> AppResult<()> {
        let file = migration.name;
        let with_file = |err: AppError| {
            err.with_context("operation", "apply_migration")
                .with_context("file", file)
        };

        let mut tx = pool.begin().await.map_err(|e| with_file(e.into()))?;
        for stmt in split_statements(migration.sql) {
            if let Some(caps) = ADD_COLUMN_RE.captures(&stmt) {
                let table = caps.get(1).map_or("", |m| m.as_str());
                let column = caps.get(2).map_or("", |m| m.as_str());
                let exists: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM pragma_table_info(?) WHERE name = ?",
                )
                .bind(table)
                .bind(column)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| with_file(e.into()))?;
                if exists.is_some() {
                    info!(target: "headlog", event = "migration_stmt_skip", file = %file, sql = %preview(&stmt));
                    continue;
                }
            }
            info!(target: "headlog", event = "migration_stmt", file = %file, sql = %preview(&stmt));
            if let Err(e) = sqlx::query(&stmt).execute(&mut *tx).await {
                error!(target: "headlog", event = "migration_stmt_error", file = %file, sql = %preview(&stmt), error = %e);
                return Err(with_file(e.into()));
            }
        }
        stamp_version(&mut *tx, migration.version)
            .await
            .map_err(with_file)?;
        tx.commit().await.map_err(|e| with_file(e.into()))?;
        info!(target: "headlog", event = "migration_file_applied", file = %file, version = migration.version);
        Ok(())
    }
}

pub async fn ensure_version_table<'e, E>(executor: E) -> AppResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    executor
        .execute(
            "CREATE TABLE IF NOT EXISTS schema_version (\
               id INTEGER PRIMARY KEY CHECK (id = 1),\
               version INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             )",
        )
        .await?;
    Ok(())
}

/// Upserts the single version row. The table must already exist.
pub async fn stamp_version<'e, E>(executor: E, version: i64) -> AppResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?, ?)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version, updated_at = excluded.updated_at",
    )
    .bind(version)
    .bind(now_ms())
    .execute(executor)
    .await?;
    Ok(())
}

async fn read_version(pool: &SqlitePool) -> AppResult<i64> {
    let has_table: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
    )
    .fetch_optional(pool)
    .await?;
    if has_table.is_none() {
        return Ok(0);
    }
    let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect sqlite::memory:")
    }

    #[test]
    fn split_skips_comments_and_transaction_markers() {
        let sql = "-- header\nBEGIN;\nCREATE TABLE a (id INTEGER);\n\nCREATE TABLE b (id INTEGER);\nCOMMIT;";
        let stmts = split_statements(sql);
        assert_eq!(
            stmts,
            vec!["CREATE TABLE a (id INTEGER)", "CREATE TABLE b (id INTEGER)"]
        );
    }

    #[test]
    fn bundled_versions_are_contiguous() {
        let migrator = SchemaMigrator::new();
        assert_eq!(migrator.current_version(), 7);
        for (idx, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version, idx as i64 + 1);
        }
    }

    #[tokio::test]
    async fn fresh_database_reaches_current_version() {
        let pool = memory_pool().await;
        let migrator = SchemaMigrator::new();
        assert_eq!(migrator.schema_version(&pool).await.unwrap(), 0);

        let report = migrator.run_pending_migrations(&pool).await.unwrap();
        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, 7);
        assert_eq!(report.applied, vec![1, 2, 3, 4, 5, 6, 7]);

        let again = migrator.run_pending_migrations(&pool).await.unwrap();
        assert!(again.applied.is_empty());
    }

    #[tokio::test]
    async fn partial_database_runs_only_newer_migrations() {
        let first_five: &'static [Migration] = Box::leak(MIGRATIONS[..5].to_vec().into_boxed_slice());
        let pool = memory_pool().await;
        SchemaMigrator::with_migrations(first_five)
            .run_pending_migrations(&pool)
            .await
            .unwrap();

        let report = SchemaMigrator::new()
            .run_pending_migrations(&pool)
            .await
            .unwrap();
        assert_eq!(report.from_version, 5);
        assert_eq!(report.applied, vec![6, 7]);

        let has_latitude: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM pragma_table_info('episodes') WHERE name = 'latitude'")
                .fetch_optional(&pool)
                .await
                .unwrap();
        assert!(has_latitude.is_some());
    }

    #[tokio::test]
    async fn add_column_is_skipped_when_present() {
        let pool = memory_pool().await;
        SchemaMigrator::new()
            .run_pending_migrations(&pool)
            .await
            .unwrap();
        stamp_version(&pool, 4).await.unwrap();

        let report = SchemaMigrator::new()
            .run_pending_migrations(&pool)
            .await
            .unwrap();
        assert_eq!(report.applied, vec![5, 6, 7]);
        assert_eq!(report.to_version, 7);
    }

    #[tokio::test]
    async fn newer_database_is_refused() {
        let pool = memory_pool().await;
        ensure_version_table(&pool).await.unwrap();
        stamp_version(&pool, 9).await.unwrap();

        let err = SchemaMigrator::new()
            .run_pending_migrations(&pool)
            .await
            .expect_err("newer schema refused");
        assert_eq!(err.code(), "MIGRATE/DATABASE_NEWER");
    }
}
