//! Generic accessors over the diary tables. Rows travel as JSON objects keyed
//! by column name so the legacy JSON backup can carry whatever columns the
//! producing build had.

use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Executor, Row as _, Sqlite, TypeInfo, ValueRef};

use crate::{AppError, AppResult};

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Episodes,
    EpisodeNotes,
    IntensityReadings,
    DailyStatusLogs,
    Medications,
    MedicationDoses,
    MedicationSchedules,
}

impl Entity {
    /// Parents before children; reverse it to delete.
    pub const ALL: [Entity; 7] = [
        Entity::Episodes,
        Entity::Medications,
        Entity::EpisodeNotes,
        Entity::IntensityReadings,
        Entity::DailyStatusLogs,
        Entity::MedicationDoses,
        Entity::MedicationSchedules,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Entity::Episodes => "episodes",
            Entity::EpisodeNotes => "episode_notes",
            Entity::IntensityReadings => "intensity_readings",
            Entity::DailyStatusLogs => "daily_status_logs",
            Entity::Medications => "medications",
            Entity::MedicationDoses => "medication_doses",
            Entity::MedicationSchedules => "medication_schedules",
        }
    }

    pub fn parent_column(self) -> Option<&'static str> {
        match self {
            Entity::EpisodeNotes | Entity::IntensityReadings => Some("episode_id"),
            Entity::MedicationDoses | Entity::MedicationSchedules => Some("medication_id"),
            Entity::Episodes | Entity::Medications | Entity::DailyStatusLogs => None,
        }
    }

    fn recency_column(self) -> &'static str {
        match self {
            Entity::Episodes => "start_time",
            Entity::EpisodeNotes | Entity::IntensityReadings | Entity::MedicationDoses => {
                "timestamp"
            }
            Entity::DailyStatusLogs => "date",
            Entity::Medications => "created_at",
            Entity::MedicationSchedules => "time",
        }
    }
}

fn row_to_map(row: SqliteRow) -> Row {
    let mut map = Map::new();
    for col in row.columns() {
        let idx = col.ordinal();
        let val = match row.try_get_raw(idx) {
            Ok(raw) if !raw.is_null() => match raw.type_info().name() {
                "INTEGER" => row
                    .try_get::<i64, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                "REAL" => row
                    .try_get::<f64, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                _ => row
                    .try_get::<String, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            },
            _ => Value::Null,
        };
        map.insert(col.name().to_string(), val);
    }
    map
}

fn bind_value<'q>(
    q: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    v: &Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match v {
        Value::Null => q.bind(Option::<i64>::None),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else if let Some(f) = n.as_f64() {
                q.bind(f)
            } else {
                q.bind(Option::<i64>::None)
            }
        }
        Value::Bool(b) => q.bind(*b as i64),
        Value::String(s) => q.bind(s.clone()),
        _ => q.bind(v.to_string()),
    }
}

fn with_table(err: impl Into<AppError>, operation: &str, entity: Entity) -> AppError {
    err.into()
        .with_context("operation", operation.to_string())
        .with_context("table", entity.table())
}

/// Rows of `entity`, newest first, optionally capped at `limit`.
pub async fn get_all<'e, E>(executor: E, entity: Entity, limit: Option<i64>) -> AppResult<Vec<Row>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT * FROM {} ORDER BY {} DESC LIMIT ?",
        entity.table(),
        entity.recency_column()
    );
    let rows = sqlx::query(&sql)
        .bind(limit.unwrap_or(-1))
        .fetch_all(executor)
        .await
        .map_err(|err| with_table(err, "get_all", entity))?;
    Ok(rows.into_iter().map(row_to_map).collect())
}

pub async fn get_by_parent_id<'e, E>(
    executor: E,
    entity: Entity,
    parent_id: &str,
) -> AppResult<Vec<Row>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let parent = entity.parent_column().ok_or_else(|| {
        AppError::new("REPO/NO_PARENT", "Entity has no parent relation")
            .with_context("table", entity.table())
    })?;
    let sql = format!(
        "SELECT * FROM {} WHERE {parent} = ? ORDER BY {} ASC",
        entity.table(),
        entity.recency_column()
    );
    let rows = sqlx::query(&sql)
        .bind(parent_id)
        .fetch_all(executor)
        .await
        .map_err(|err| with_table(err, "get_by_parent_id", entity))?;
    Ok(rows.into_iter().map(row_to_map).collect())
}

/// Daily status rows dated on or after `since` (`YYYY-MM-DD`), newest first.
pub async fn get_daily_status_since<'e, E>(executor: E, since: &str) -> AppResult<Vec<Row>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM daily_status_logs WHERE date >= ? ORDER BY date DESC")
        .bind(since)
        .fetch_all(executor)
        .await
        .map_err(|err| with_table(err, "get_daily_status_since", Entity::DailyStatusLogs))?;
    Ok(rows.into_iter().map(row_to_map).collect())
}

pub async fn count<'e, E>(executor: E, entity: Entity) -> AppResult<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT COUNT(*) FROM {}", entity.table());
    sqlx::query_scalar(&sql)
        .fetch_one(executor)
        .await
        .map_err(|err| with_table(err, "count", entity))
}

pub async fn delete_all<'e, E>(executor: E, entity: Entity) -> AppResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("DELETE FROM {}", entity.table());
    let result = sqlx::query(&sql)
        .execute(executor)
        .await
        .map_err(|err| with_table(err, "delete_all", entity))?;
    Ok(result.rows_affected())
}

/// Column names of `table` in declaration order; empty when the table does not exist.
pub async fn table_columns<'e, E>(executor: E, table: &str) -> AppResult<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
        .bind(table)
        .fetch_all(executor)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "table_columns")
                .with_context("table", table.to_string())
        })
}

/// Inserts `row` keeping its original `id`. Keys that are not columns of the
/// table (from `columns`) are dropped so older or newer exports still load.
/// Returns `false` when nothing in the row matched a column.
pub async fn insert_preserving_id<'e, E>(
    executor: E,
    entity: Entity,
    row: &Row,
    columns: &[String],
) -> AppResult<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let present: Vec<(&String, &Value)> = row
        .iter()
        .filter(|(key, _)| columns.iter().any(|c| c == *key))
        .collect();
    if present.is_empty() {
        return Ok(false);
    }

    let cols = present
        .iter()
        .map(|(key, _)| format!("\"{key}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; present.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({cols}) VALUES ({placeholders})",
        entity.table()
    );

    let mut query = sqlx::query(&sql);
    for (_, value) in &present {
        query = bind_value(query, value);
    }
    query.execute(executor).await.map_err(|err| {
        let mut app = with_table(err, "insert_preserving_id", entity);
        if let Some(id) = row.get("id").and_then(Value::as_str) {
            app = app.with_context("id", id.to_string());
        }
        app
    })?;
    Ok(true)
}
