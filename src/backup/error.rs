//! Error codes and constructors for the backup subsystem.

use std::path::Path;

use serde::Serialize;

use crate::AppError;

pub const NOT_FOUND: &str = "BACKUP/NOT_FOUND";
pub const DATABASE_FILE_NOT_FOUND: &str = "BACKUP/DATABASE_FILE_NOT_FOUND";
pub const INCOMPATIBLE_SCHEMA_VERSION: &str = "BACKUP/INCOMPATIBLE_SCHEMA_VERSION";
pub const CORRUPT: &str = "BACKUP/CORRUPT";
pub const INVALID_ID: &str = "BACKUP/INVALID_ID";
pub const UNSUPPORTED_FILE: &str = "BACKUP/UNSUPPORTED_FILE";
pub const LEGACY_JSON_RETIRED: &str = "BACKUP/LEGACY_JSON_RETIRED";
pub const LOW_DISK: &str = "BACKUP/LOW_DISK";

pub const SNAPSHOT_FAILED: &str = "BACKUP/SNAPSHOT_FAILED";
pub const CREATION_FAILED: &str = "BACKUP/CREATION_FAILED";
pub const RESTORE_FAILED: &str = "BACKUP/RESTORE_FAILED";
pub const EXPORT_FAILED: &str = "BACKUP/EXPORT_FAILED";
pub const IMPORT_FAILED: &str = "BACKUP/IMPORT_FAILED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotFound,
    Incompatible,
    Corrupt,
    Io,
    Other,
}

fn category_of(code: &str) -> Option<ErrorCategory> {
    match code {
        NOT_FOUND | DATABASE_FILE_NOT_FOUND => Some(ErrorCategory::NotFound),
        INCOMPATIBLE_SCHEMA_VERSION | LEGACY_JSON_RETIRED => Some(ErrorCategory::Incompatible),
        CORRUPT | INVALID_ID | UNSUPPORTED_FILE => Some(ErrorCategory::Corrupt),
        LOW_DISK => Some(ErrorCategory::Io),
        c if c.starts_with("IO/") || c.starts_with("JSON/IO") => Some(ErrorCategory::Io),
        c if c.starts_with("JSON/") => Some(ErrorCategory::Corrupt),
        _ => None,
    }
}

/// Category of the innermost-meaningful failure: the first code in the chain
/// that maps to one, outermost first.
pub fn category(err: &AppError) -> ErrorCategory {
    err.chain()
        .find_map(|e| category_of(e.code()))
        .unwrap_or(ErrorCategory::Other)
}

pub fn backup_not_found(id: &str) -> AppError {
    AppError::new(NOT_FOUND, format!("Backup not found: {id}")).with_context("backup_id", id)
}

pub fn database_file_not_found(path: &Path) -> AppError {
    AppError::new(DATABASE_FILE_NOT_FOUND, "Database file not found")
        .with_context("path", path.display().to_string())
}

pub fn incompatible_schema_version(backup_version: i64, current_version: i64) -> AppError {
    AppError::new(
        INCOMPATIBLE_SCHEMA_VERSION,
        format!(
            "Backup schema version {backup_version} is newer than this app's schema version {current_version}"
        ),
    )
    .with_context("backup_version", backup_version.to_string())
    .with_context("current_version", current_version.to_string())
}

pub fn corrupt(reason: impl Into<String>, path: &Path) -> AppError {
    AppError::new(CORRUPT, reason).with_context("path", path.display().to_string())
}

pub fn invalid_id(id: &str) -> AppError {
    AppError::new(INVALID_ID, "Backup id contains unsupported characters")
        .with_context("backup_id", id)
}

pub fn unsupported_file(name: &str) -> AppError {
    AppError::new(
        UNSUPPORTED_FILE,
        "Only .db, .sqlite and .sqlite3 backup files can be imported",
    )
    .with_context("file_name", name)
}

pub fn legacy_json_retired() -> AppError {
    AppError::new(
        LEGACY_JSON_RETIRED,
        "JSON backups are no longer supported by this build",
    )
}

pub fn low_disk(available: u64, required: u64) -> AppError {
    AppError::new(
        LOW_DISK,
        format!("Not enough disk space for a backup (need ~{required} bytes)"),
    )
    .with_context("available_bytes", available.to_string())
    .with_context("required_bytes", required.to_string())
}

fn wrap(code: &str, prefix: &str, cause: AppError) -> AppError {
    AppError::new(code, format!("{prefix}: {}", cause.message())).with_cause(cause)
}

pub fn snapshot_failed(cause: AppError) -> AppError {
    wrap(SNAPSHOT_FAILED, "Failed to create snapshot backup", cause)
}

pub fn creation_failed(cause: AppError) -> AppError {
    wrap(CREATION_FAILED, "Failed to create backup", cause)
}

pub fn restore_failed(cause: AppError) -> AppError {
    wrap(RESTORE_FAILED, "Failed to restore backup", cause)
}

pub fn export_failed(cause: AppError) -> AppError {
    wrap(EXPORT_FAILED, "Failed to export backup", cause)
}

pub fn import_failed(cause: AppError) -> AppError {
    wrap(IMPORT_FAILED, "Failed to import backup", cause)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrappers_prefix_message_and_keep_cause() {
        let err = restore_failed(incompatible_schema_version(9, 7));
        assert_eq!(err.code(), RESTORE_FAILED);
        assert!(err
            .message()
            .starts_with("Failed to restore backup: Backup schema version 9"));
        assert!(err.chain_contains(INCOMPATIBLE_SCHEMA_VERSION));
        assert_eq!(category(&err), ErrorCategory::Incompatible);
    }

    #[test]
    fn io_causes_classify_as_io() {
        let io = AppError::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only",
        ));
        assert_eq!(category(&snapshot_failed(io)), ErrorCategory::Io);
    }

    #[test]
    fn json_syntax_is_corrupt_and_unknown_is_other() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(category(&AppError::from(parse)), ErrorCategory::Corrupt);
        assert_eq!(
            category(&creation_failed(AppError::new("SQLX/ERROR", "x"))),
            ErrorCategory::Other
        );
    }

    #[test]
    fn not_found_variants_share_category() {
        assert_eq!(category(&backup_not_found("x")), ErrorCategory::NotFound);
        assert_eq!(
            category(&database_file_not_found(Path::new("/x.db"))),
            ErrorCategory::NotFound
        );
    }
}
