use std::env;
use std::path::{Path, PathBuf};

use crate::time::DAY_MS;
use crate::{AppError, AppResult};

pub const APP_IDENTIFIER: &str = "com.headlog.app";
pub const DB_FILE_NAME: &str = "headlog.db";
pub const BACKUP_DIR_NAME: &str = "backups";
pub const EXPORT_DIR_NAME: &str = "exports";
pub const LOG_DIR_NAME: &str = "logs";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ERROR_LOG_FILE_NAME: &str = "error-log.jsonl";

pub const DEFAULT_MAX_AUTO_BACKUPS: usize = 5;
pub const HARD_MAX_AUTO_BACKUPS: usize = 20;
pub const DEFAULT_WEEKLY_INTERVAL_MS: i64 = 7 * DAY_MS;

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Every location and policy knob the backup services need. Nothing in the
/// crate reads a fixed path; tests build one of these over a temp directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub export_dir: PathBuf,
    pub log_dir: PathBuf,
    pub settings_path: PathBuf,
    pub error_log_path: PathBuf,
    pub app_version: String,
    pub max_auto_backups: usize,
    pub weekly_interval_ms: i64,
}

impl BackupConfig {
    /// Derives every path from a single data directory using defaults for the policy values.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            db_path: data_dir.join(DB_FILE_NAME),
            backup_dir: data_dir.join(BACKUP_DIR_NAME),
            export_dir: data_dir.join(EXPORT_DIR_NAME),
            log_dir: data_dir.join(LOG_DIR_NAME),
            settings_path: data_dir.join(SETTINGS_FILE_NAME),
            error_log_path: data_dir.join(ERROR_LOG_FILE_NAME),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            max_auto_backups: DEFAULT_MAX_AUTO_BACKUPS,
            weekly_interval_ms: DEFAULT_WEEKLY_INTERVAL_MS,
            data_dir,
        }
    }

    /// Resolves the platform data directory and applies environment overrides.
    pub fn load() -> AppResult<Self> {
        Ok(Self::for_data_dir(default_data_dir()?).with_env_overrides())
    }

    /// Like [`BackupConfig::load`] but rooted at an explicit directory.
    pub fn load_from(data_dir: &Path) -> Self {
        Self::for_data_dir(data_dir).with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        self.max_auto_backups = env::var("HEADLOG_MAX_AUTO_BACKUPS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .and_then(clamp_max_auto_backups)
            .unwrap_or(self.max_auto_backups);

        self.weekly_interval_ms = env::var("HEADLOG_WEEKLY_INTERVAL_HOURS")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|hours| *hours > 0)
            .map(|hours| hours.saturating_mul(HOUR_MS))
            .unwrap_or(self.weekly_interval_ms);
        self
    }

    pub fn with_max_auto_backups(mut self, max: usize) -> Self {
        self.max_auto_backups = clamp_max_auto_backups(max).unwrap_or(DEFAULT_MAX_AUTO_BACKUPS);
        self
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }
}

fn clamp_max_auto_backups(value: usize) -> Option<usize> {
    (value > 0).then(|| value.min(HARD_MAX_AUTO_BACKUPS))
}

/// `HEADLOG_FAKE_APPDATA` wins so tests and scripted runs never touch the real profile.
pub fn default_data_dir() -> AppResult<PathBuf> {
    if let Ok(fake) = env::var("HEADLOG_FAKE_APPDATA") {
        return Ok(PathBuf::from(fake));
    }
    dirs::data_dir()
        .map(|dir| dir.join(APP_IDENTIFIER))
        .ok_or_else(|| {
            AppError::new(
                "CONFIG/NO_DATA_DIR",
                "Unable to resolve the application data directory",
            )
        })
}
