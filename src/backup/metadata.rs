use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::invalid_id;
use crate::repo::{Entity, Row};
use crate::AppResult;

pub const SNAPSHOT_EXTENSION: &str = "db";
pub const JSON_EXTENSION: &str = "json";
pub const METADATA_SUFFIX: &str = ".meta.json";

static BACKUP_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Snapshot,
    /// Records written before snapshots existed carry no type and are JSON.
    #[default]
    Json,
}

impl BackupType {
    pub fn extension(self) -> &'static str {
        match self {
            BackupType::Snapshot => SNAPSHOT_EXTENSION,
            BackupType::Json => JSON_EXTENSION,
        }
    }
}

/// Who asked for the backup. Retention only ever touches automatic ones,
/// recognised by their id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Manual,
    Automatic,
}

impl BackupKind {
    pub fn id_prefix(self) -> &'static str {
        match self {
            BackupKind::Manual => "backup_",
            BackupKind::Automatic => "auto_",
        }
    }

    pub fn from_automatic(is_automatic: bool) -> Self {
        if is_automatic {
            BackupKind::Automatic
        } else {
            BackupKind::Manual
        }
    }
}

/// `<prefix><epoch millis>_<8 hex chars>`.
pub fn generate_backup_id(kind: BackupKind, timestamp_ms: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}{}_{}", kind.id_prefix(), timestamp_ms, &suffix[..8])
}

pub fn is_automatic_id(id: &str) -> bool {
    id.starts_with(BackupKind::Automatic.id_prefix())
}

/// Ids become file names, so only a conservative character set is accepted.
pub fn validate_backup_id(id: &str) -> AppResult<()> {
    if BACKUP_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(invalid_id(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub app_version: String,
    pub schema_version: i64,
    #[serde(default)]
    pub episode_count: i64,
    #[serde(default)]
    pub medication_count: i64,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub backup_type: BackupType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl BackupMetadata {
    pub fn is_automatic(&self) -> bool {
        is_automatic_id(&self.id)
    }

    /// On-disk artifact name. Always derived from the id and type; the stored
    /// `fileName` is informational only.
    pub fn artifact_name(&self) -> String {
        format!("{}.{}", self.id, self.backup_type.extension())
    }
}

/// The legacy full-data JSON document. Entity rows are column-name keyed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupData {
    pub metadata: BackupMetadata,
    /// Absent in exports made before the schema was captured.
    #[serde(rename = "schemaSQL", default, skip_serializing_if = "Option::is_none")]
    pub schema_sql: Option<String>,
    pub episodes: Vec<Row>,
    #[serde(default)]
    pub episode_notes: Vec<Row>,
    #[serde(default)]
    pub intensity_readings: Vec<Row>,
    #[serde(default)]
    pub daily_status_logs: Vec<Row>,
    pub medications: Vec<Row>,
    pub medication_doses: Vec<Row>,
    pub medication_schedules: Vec<Row>,
}

impl BackupData {
    pub fn rows(&self, entity: Entity) -> &[Row] {
        match entity {
            Entity::Episodes => &self.episodes,
            Entity::EpisodeNotes => &self.episode_notes,
            Entity::IntensityReadings => &self.intensity_readings,
            Entity::DailyStatusLogs => &self.daily_status_logs,
            Entity::Medications => &self.medications,
            Entity::MedicationDoses => &self.medication_doses,
            Entity::MedicationSchedules => &self.medication_schedules,
        }
    }

    pub fn total_rows(&self) -> usize {
        Entity::ALL.iter().map(|e| self.rows(*e).len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_ids_are_valid_and_tagged() {
        let auto = generate_backup_id(BackupKind::Automatic, 1_700_000_000_000);
        let manual = generate_backup_id(BackupKind::Manual, 1_700_000_000_000);
        assert!(auto.starts_with("auto_1700000000000_"));
        assert_eq!(auto.len(), "auto_1700000000000_".len() + 8);
        assert!(is_automatic_id(&auto));
        assert!(!is_automatic_id(&manual));
        assert!(validate_backup_id(&auto).is_ok());
        assert!(validate_backup_id(&manual).is_ok());
    }

    #[test]
    fn path_like_ids_are_rejected() {
        for bad in ["", "../escape", "a/b", "with space", "dot.db"] {
            let err = validate_backup_id(bad).expect_err("rejected");
            assert_eq!(err.code(), super::super::error::INVALID_ID);
        }
    }

    #[test]
    fn metadata_uses_camel_case_and_defaults_type_to_json() {
        let legacy = json!({
            "id": "backup_1_abcdef01",
            "timestamp": 1,
            "appVersion": "0.3.0",
            "schemaVersion": 3,
            "episodeCount": 4,
            "medicationCount": 2,
            "fileSize": 10,
            "fileName": "backup_1_abcdef01.json"
        });
        let meta: BackupMetadata = serde_json::from_value(legacy).unwrap();
        assert_eq!(meta.backup_type, BackupType::Json);
        assert_eq!(meta.sha256, None);

        let snapshot = BackupMetadata {
            backup_type: BackupType::Snapshot,
            sha256: Some("ab".into()),
            ..meta
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["backupType"], "snapshot");
        assert_eq!(value["schemaVersion"], 3);
        assert_eq!(value["sha256"], "ab");
    }

    #[test]
    fn backup_data_requires_core_arrays_but_not_late_additions() {
        let minimal = json!({
            "metadata": {"id": "backup_1_abcdef01", "timestamp": 1, "schemaVersion": 1},
            "episodes": [],
            "medications": [],
            "medicationDoses": [],
            "medicationSchedules": []
        });
        let data: BackupData = serde_json::from_value(minimal).unwrap();
        assert!(data.schema_sql.is_none());
        assert!(data.daily_status_logs.is_empty());

        let missing = json!({
            "metadata": {"id": "backup_1_abcdef01", "timestamp": 1, "schemaVersion": 1},
            "episodes": []
        });
        assert!(serde_json::from_value::<BackupData>(missing).is_err());

        let null_meta = json!({
            "metadata": null,
            "episodes": [],
            "medications": [],
            "medicationDoses": [],
            "medicationSchedules": []
        });
        assert!(serde_json::from_value::<BackupData>(null_meta).is_err());
    }
}
